//! Remote execution with per-device persistent sessions
//!
//! The [`ConnectionManager`] owns at most one live session per device. Every
//! command for a device runs under that device's lock, so commands on one
//! device never overlap while different devices proceed independently.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn};

use crate::{Device, Error, Result};

/// An open remote shell session
#[async_trait]
pub trait Session: Send {
    /// Send one command and return its raw output
    async fn send_command(&mut self, command: &str) -> Result<String>;

    /// Cheap liveness check performed before a session is reused
    async fn is_alive(&mut self) -> bool;

    /// Close the session
    async fn close(&mut self) -> Result<()>;
}

/// Opens sessions to devices
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, device: &Device) -> Result<Box<dyn Session>>;
}

/// Default connect timeout in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECONDS: u64 = 100;

/// Default command timeout in seconds
pub const DEFAULT_COMMAND_TIMEOUT_SECONDS: u64 = 60;

/// Connection lifecycle settings
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Keep sessions open between commands; when false a session is opened
    /// and closed around every command
    pub persistent: bool,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            persistent: true,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECONDS),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECONDS),
            max_reconnect_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }
}

impl ConnectionSettings {
    /// Delay after failed attempt `attempt` (1-based): `min(max, base * 2^(attempt-1))`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        backoff_delay(self.backoff_base, self.backoff_max, attempt)
    }
}

/// Exponential backoff delay for a 1-based attempt number
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .map_or(max, |delay| delay.min(max))
}

/// Per-device connection state, only touched under the device lock
#[derive(Default)]
struct ConnectionState {
    session: Option<Box<dyn Session>>,
    /// Session must be replaced before the next command
    stale: bool,
    consecutive_failures: u32,
    /// Reconnects are suppressed until this instant after exhausting attempts
    next_retry_at: Option<Instant>,
}

struct DeviceSlot {
    device: Device,
    state: Mutex<ConnectionState>,
}

/// Outcome of one command execution
#[derive(Debug)]
pub struct Execution {
    /// Cleaned output or the error that prevented it
    pub output: Result<String>,
    pub duration: Duration,
}

impl Execution {
    pub fn duration_ms(&self) -> f64 {
        self.duration.as_secs_f64() * 1000.0
    }
}

/// Owns one connection slot per device
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
    slots: HashMap<String, Arc<DeviceSlot>>,
}

impl ConnectionManager {
    /// Create a manager with one slot per device
    pub fn new(
        devices: Vec<Device>,
        connector: Arc<dyn Connector>,
        settings: ConnectionSettings,
    ) -> Self {
        if settings.persistent {
            info!(devices = devices.len(), "Persistent connections enabled");
        } else {
            info!(devices = devices.len(), "Using a fresh connection per command");
        }

        let slots = devices
            .into_iter()
            .map(|device| {
                let name = device.name.clone();
                let slot = DeviceSlot {
                    device,
                    state: Mutex::new(ConnectionState::default()),
                };
                (name, Arc::new(slot))
            })
            .collect();

        Self {
            connector,
            settings,
            slots,
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Execute a command on a device
    ///
    /// Errors are returned inside the [`Execution`]; nothing here panics or
    /// aborts on a device failure.
    #[instrument(skip(self), fields(persistent = self.settings.persistent))]
    pub async fn execute(&self, device: &str, command: &str) -> Execution {
        let started = Instant::now();

        let Some(slot) = self.slots.get(device) else {
            return Execution {
                output: Err(Error::ConfigError(format!("Unknown device: {}", device))),
                duration: started.elapsed(),
            };
        };

        let mut state = slot.state.lock().await;
        let output = if self.settings.persistent {
            self.execute_persistent(&slot.device, &mut state, command)
                .await
        } else {
            self.execute_once(&slot.device, command).await
        };
        drop(state);

        let duration = started.elapsed();
        match &output {
            Ok(_) => debug!(
                device = %device,
                command = %command,
                duration_ms = duration.as_millis() as u64,
                "Command completed"
            ),
            Err(e) => warn!(device = %device, command = %command, error = %e, "Command failed"),
        }

        Execution { output, duration }
    }

    async fn execute_persistent(
        &self,
        device: &Device,
        state: &mut ConnectionState,
        command: &str,
    ) -> Result<String> {
        self.ensure_connected(device, state).await?;

        let Some(session) = state.session.as_mut() else {
            return Err(Error::ConnectionError(format!(
                "No session available for {}",
                device.name
            )));
        };

        let result = self.run_command(device, session, command).await;
        if let Err(e) = &result {
            if e.marks_stale() {
                debug!(device = %device.name, "Marking session stale");
                state.stale = true;
            }
        }
        result
    }

    /// Legacy mode: open, run, close
    async fn execute_once(&self, device: &Device, command: &str) -> Result<String> {
        let mut session = self.open_session(device).await?;
        let result = self.run_command(device, &mut session, command).await;

        if let Err(e) = session.close().await {
            error!(device = %device.name, error = %e, "Error closing connection");
        }
        result
    }

    /// Make sure `state` holds a usable session, reconnecting with backoff
    async fn ensure_connected(&self, device: &Device, state: &mut ConnectionState) -> Result<()> {
        let reusable = match state.session.as_mut() {
            Some(session) if !state.stale => session.is_alive().await,
            _ => false,
        };
        if reusable {
            return Ok(());
        }

        if let Some(mut old) = state.session.take() {
            warn!(device = %device.name, "Connection is dead, reconnecting");
            if let Err(e) = old.close().await {
                debug!(device = %device.name, error = %e, "Error closing dead connection");
            }
        }
        state.stale = false;

        if let Some(retry_at) = state.next_retry_at {
            let now = Instant::now();
            if now < retry_at {
                return Err(Error::ConnectionError(format!(
                    "Reconnect to {} suppressed for {:.1}s after {} failed attempts",
                    device.name,
                    (retry_at - now).as_secs_f64(),
                    state.consecutive_failures
                )));
            }
        }

        let max_attempts = self.settings.max_reconnect_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match self.open_session(device).await {
                Ok(session) => {
                    info!(device = %device.name, attempt, "Successfully connected");
                    state.session = Some(session);
                    state.consecutive_failures = 0;
                    state.next_retry_at = None;
                    return Ok(());
                }
                Err(e) => {
                    state.consecutive_failures += 1;
                    error!(
                        device = %device.name,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Connection attempt failed"
                    );
                    last_error = Some(e);

                    if attempt < max_attempts {
                        let delay = self.settings.backoff_delay(attempt);
                        info!(
                            device = %device.name,
                            delay_ms = delay.as_millis() as u64,
                            "Waiting before retry"
                        );
                        sleep(delay).await;
                    }
                }
            }
        }

        // Leave further attempts to a later tick
        let suppress_for = self.settings.backoff_delay(max_attempts);
        state.next_retry_at = Instant::now().checked_add(suppress_for);
        if state.next_retry_at.is_none() {
            warn!(
                device = %device.name,
                "Retry suppression window out of range; retrying on the next tick"
            );
        }

        let message = format!(
            "Failed to connect to {} after {} attempts: {}",
            device.name,
            max_attempts,
            last_error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "Unknown".to_string())
        );
        Err(match last_error {
            Some(Error::AuthenticationError(_)) => Error::AuthenticationError(message),
            _ => Error::ConnectionError(message),
        })
    }

    /// Connect once within the connect timeout and prepare the session
    async fn open_session(&self, device: &Device) -> Result<Box<dyn Session>> {
        info!(device = %device.name, host = %device.endpoint.host, "Establishing SSH connection");

        let mut session = match timeout(
            self.settings.connect_timeout,
            self.connector.connect(device),
        )
        .await
        {
            Err(_) => {
                return Err(Error::ConnectionError(format!(
                    "Connection timeout after {} seconds",
                    self.settings.connect_timeout.as_secs()
                )));
            }
            Ok(result) => result?,
        };

        for setup in device.dialect.session_setup() {
            match timeout(self.settings.command_timeout, session.send_command(setup)).await {
                Ok(Ok(_)) => debug!(device = %device.name, command = %setup, "Session setup"),
                Ok(Err(e)) => {
                    warn!(device = %device.name, command = %setup, error = %e, "Session setup failed")
                }
                Err(_) => warn!(device = %device.name, command = %setup, "Session setup timed out"),
            }
        }

        Ok(session)
    }

    async fn run_command(
        &self,
        device: &Device,
        session: &mut Box<dyn Session>,
        command: &str,
    ) -> Result<String> {
        let rendered = device.dialect.render_command(command);

        match timeout(self.settings.command_timeout, session.send_command(&rendered)).await {
            Err(_) => Err(Error::TimeoutError(format!(
                "Command '{}' timed out after {}s",
                command,
                self.settings.command_timeout.as_secs_f64()
            ))),
            Ok(Err(e)) => Err(e),
            Ok(Ok(raw)) => Ok(device.dialect.clean_output(&raw)),
        }
    }

    /// Close every open session; close failures are logged, not returned
    pub async fn close_all(&self) {
        for (name, slot) in &self.slots {
            let mut state = slot.state.lock().await;
            if let Some(mut session) = state.session.take() {
                info!(device = %name, "Closing persistent connection");
                if let Err(e) = session.close().await {
                    error!(device = %name, error = %e, "Error closing connection");
                }
            }
            state.stale = false;
        }
    }
}
