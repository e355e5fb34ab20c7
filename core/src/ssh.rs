//! SSH transport for the connection manager

use async_ssh2_tokio::client::{AuthMethod, Client, ServerCheckMethod};
use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::remote::{Connector, Session};
use crate::{Credential, Device, Error, Result};

/// Host key verification policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostKeyPolicy {
    /// Accept any host key
    #[default]
    NoCheck,
    /// Verify against `~/.ssh/known_hosts`
    KnownHosts,
}

/// Opens SSH sessions with `async-ssh2-tokio`
#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    host_key_policy: HostKeyPolicy,
}

impl SshConnector {
    pub fn new(host_key_policy: HostKeyPolicy) -> Self {
        Self { host_key_policy }
    }

    fn server_check(&self) -> ServerCheckMethod {
        match self.host_key_policy {
            HostKeyPolicy::NoCheck => ServerCheckMethod::NoCheck,
            HostKeyPolicy::KnownHosts => ServerCheckMethod::DefaultKnownHostsFile,
        }
    }
}

/// Resolve the authentication method for a device
pub fn auth_method(device: &Device) -> Result<AuthMethod> {
    match &device.endpoint.credential {
        Credential::PasswordEnv(env_key) => match get_secret(env_key) {
            Some(password) => Ok(AuthMethod::with_password(&password)),
            None => Err(Error::AuthenticationError(format!(
                "Password not provided for device '{}'; set environment variable '{}'",
                device.name, env_key
            ))),
        },
        Credential::Password(password) => Ok(AuthMethod::with_password(password)),
        Credential::KeyFile(path) => {
            if !path.exists() {
                return Err(Error::AuthenticationError(format!(
                    "SSH key not found: {}",
                    path.display()
                )));
            }
            Ok(AuthMethod::with_key_file(path, None))
        }
    }
}

/// Get secret from environment variable or file
///
/// If `VAR_NAME` is not set, tries `VAR_NAME_FILE`, which should point to a
/// file containing the secret (Docker/Kubernetes secrets).
pub fn get_secret(var_name: &str) -> Option<String> {
    if let Ok(value) = std::env::var(var_name) {
        return Some(value);
    }

    let file_var = format!("{}_FILE", var_name);
    if let Ok(path) = std::env::var(&file_var) {
        if let Ok(contents) = std::fs::read_to_string(&path) {
            return Some(contents.trim().to_string());
        }
    }

    None
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, device: &Device) -> Result<Box<dyn Session>> {
        let auth = auth_method(device)?;
        let endpoint = &device.endpoint;

        debug!(
            "Connecting to {}@{}:{}",
            endpoint.username, endpoint.host, endpoint.port
        );

        let client = Client::connect(
            (endpoint.host.clone(), endpoint.port),
            &endpoint.username,
            auth,
            self.server_check(),
        )
        .await
        .map_err(|e| match e {
            async_ssh2_tokio::Error::PasswordWrong | async_ssh2_tokio::Error::KeyAuthFailed => {
                Error::AuthenticationError(format!("Authentication failed for {}: {}", device.name, e))
            }
            other => Error::ConnectionError(format!("Failed to connect to SSH server: {}", other)),
        })?;

        info!(device = %device.name, "SSH session established");
        Ok(Box::new(SshSession { client }))
    }
}

/// A live SSH client; each command runs on its own exec channel
pub struct SshSession {
    client: Client,
}

#[async_trait]
impl Session for SshSession {
    async fn send_command(&mut self, command: &str) -> Result<String> {
        let result = self
            .client
            .execute(command)
            .await
            .map_err(|e| Error::ConnectionError(format!("Failed to execute command: {}", e)))?;

        if result.exit_status != 0 {
            let stderr = result.stderr.trim();
            let message = if stderr.is_empty() {
                format!("Command exited with status {}", result.exit_status)
            } else {
                stderr.to_string()
            };
            return Err(Error::RemoteExecutionError(message));
        }

        Ok(result.stdout)
    }

    async fn is_alive(&mut self) -> bool {
        !self.client.is_closed()
    }

    async fn close(&mut self) -> Result<()> {
        self.client.disconnect().await.map_err(|e| {
            error!(error = %e, "SSH disconnect failed");
            Error::ConnectionError(format!("Failed to disconnect: {}", e))
        })
    }
}
