//! Configuration management
//!
//! Loaded once from a TOML file and validated before anything starts; an
//! invalid configuration is fatal.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use nwwatch_core::dialect::is_known_device_type;
use nwwatch_core::{
    Command, ConnectionSettings, Credential, Device, DeviceEndpoint, Error, HostKeyPolicy,
    OutputRules, Result,
};
use nwwatch_database::StoreSettings;

/// Characters allowed in a probe target
const PING_TARGET_PATTERN: &str = r"^[a-zA-Z0-9.:\-_]+$";

/// Upper bound for reconnect backoff values, in seconds (one day)
const MAX_BACKOFF_SECONDS: f64 = 86_400.0;

/// Collector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Default command cadence in seconds
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,

    #[serde(default = "default_ping_interval_seconds")]
    pub ping_interval_seconds: u64,

    /// Ping samples kept per device, in seconds
    #[serde(default = "default_ping_window_seconds")]
    pub ping_window_seconds: u64,

    /// Runs kept per (device, command)
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    #[serde(default = "default_max_output_lines")]
    pub max_output_lines: usize,

    /// Devices worked on concurrently
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    #[serde(default = "default_command_timeout_seconds")]
    pub command_timeout_seconds: u64,

    /// Bounds for per-command `interval_seconds`
    #[serde(default = "default_min_command_interval_seconds")]
    pub min_command_interval_seconds: u64,
    #[serde(default = "default_max_command_interval_seconds")]
    pub max_command_interval_seconds: u64,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub ssh: SshConfig,

    #[serde(default)]
    pub global_filters: FilterConfig,

    #[serde(default)]
    pub commands: Vec<CommandConfig>,

    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Remote shell connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub persistent_connections: bool,
    /// Connect timeout in seconds
    pub connection_timeout: u64,
    pub max_reconnect_attempts: u32,
    /// Seconds
    pub reconnect_backoff_base: f64,
    /// Seconds
    pub reconnect_backoff_max: f64,
    /// Verify host keys against `~/.ssh/known_hosts`
    pub known_hosts_check: bool,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            persistent_connections: true,
            connection_timeout: 100,
            max_reconnect_attempts: 3,
            reconnect_backoff_base: 1.0,
            reconnect_backoff_max: 30.0,
            known_hosts_check: false,
        }
    }
}

/// Global output filters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub line_exclude_substrings: Vec<String>,
    pub output_exclude_substrings: Vec<String>,
}

/// Per-command filter overrides; a present list replaces the global one
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterOverride {
    pub line_exclude_substrings: Option<Vec<String>>,
    pub output_exclude_substrings: Option<Vec<String>>,
}

/// Command entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    pub command_text: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub interval_seconds: Option<u64>,
    /// Cron expression, 5 or 6 fields
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub sort_order: Option<i64>,
    #[serde(default)]
    pub filters: Option<FilterOverride>,
    #[serde(default)]
    pub max_output_lines: Option<usize>,
}

/// Device entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    /// Environment variable holding the password
    #[serde(default)]
    pub password_env_key: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    pub device_type: String,
    /// Probe target, defaults to `host`
    #[serde(default)]
    pub ping_host: Option<String>,
}

fn default_interval_seconds() -> u64 {
    5
}
fn default_ping_interval_seconds() -> u64 {
    1
}
fn default_ping_window_seconds() -> u64 {
    60
}
fn default_history_size() -> usize {
    10
}
fn default_max_output_lines() -> usize {
    nwwatch_core::pipeline::DEFAULT_MAX_OUTPUT_LINES
}
fn default_max_parallel() -> usize {
    20
}
fn default_command_timeout_seconds() -> u64 {
    nwwatch_core::remote::DEFAULT_COMMAND_TIMEOUT_SECONDS
}
fn default_min_command_interval_seconds() -> u64 {
    5
}
fn default_max_command_interval_seconds() -> u64 {
    60
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_port() -> u16 {
    22
}

impl Config {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field; the first problem found is returned
    pub fn validate(&self) -> Result<()> {
        positive("interval_seconds", self.interval_seconds)?;
        positive("ping_interval_seconds", self.ping_interval_seconds)?;
        positive("ping_window_seconds", self.ping_window_seconds)?;
        positive("history_size", self.history_size as u64)?;
        positive("max_output_lines", self.max_output_lines as u64)?;
        positive("max_parallel", self.max_parallel as u64)?;
        positive("command_timeout_seconds", self.command_timeout_seconds)?;
        positive("ssh.connection_timeout", self.ssh.connection_timeout)?;

        if self.min_command_interval_seconds > self.max_command_interval_seconds {
            return Err(Error::ConfigError(format!(
                "min_command_interval_seconds ({}) exceeds max_command_interval_seconds ({})",
                self.min_command_interval_seconds, self.max_command_interval_seconds
            )));
        }
        if !(self.ssh.reconnect_backoff_base > 0.0) {
            return Err(Error::ConfigError(format!(
                "ssh.reconnect_backoff_base must be positive, got {}",
                self.ssh.reconnect_backoff_base
            )));
        }
        if !(self.ssh.reconnect_backoff_max <= MAX_BACKOFF_SECONDS) {
            return Err(Error::ConfigError(format!(
                "ssh.reconnect_backoff_max must be a finite number of seconds no larger than {}, got {}",
                MAX_BACKOFF_SECONDS, self.ssh.reconnect_backoff_max
            )));
        }
        if !(self.ssh.reconnect_backoff_max >= self.ssh.reconnect_backoff_base) {
            return Err(Error::ConfigError(format!(
                "ssh.reconnect_backoff_max ({}) must be at least reconnect_backoff_base ({})",
                self.ssh.reconnect_backoff_max, self.ssh.reconnect_backoff_base
            )));
        }

        if self.devices.is_empty() {
            return Err(Error::ConfigError(
                "At least one device must be configured".to_string(),
            ));
        }
        if self.commands.is_empty() {
            return Err(Error::ConfigError(
                "At least one command must be configured".to_string(),
            ));
        }

        let mut texts = HashSet::new();
        for (i, cmd) in self.commands.iter().enumerate() {
            self.validate_command(i, cmd)?;
            if !texts.insert(cmd.command_text.as_str()) {
                return Err(Error::ConfigError(format!(
                    "Duplicate command_text: '{}'",
                    cmd.command_text
                )));
            }
        }

        let target_pattern = Regex::new(PING_TARGET_PATTERN)
            .map_err(|e| Error::ConfigError(format!("Invalid ping target pattern: {}", e)))?;
        let mut names = HashSet::new();
        for (i, device) in self.devices.iter().enumerate() {
            validate_device(i, device, &target_pattern)?;
            if !names.insert(device.name.as_str()) {
                return Err(Error::ConfigError(format!(
                    "Duplicate device name: '{}'",
                    device.name
                )));
            }
        }

        Ok(())
    }

    fn validate_command(&self, i: usize, cmd: &CommandConfig) -> Result<()> {
        if cmd.command_text.trim().is_empty() {
            return Err(Error::ConfigError(format!(
                "commands[{}].command_text must not be empty",
                i
            )));
        }

        if let Some(secs) = cmd.interval_seconds {
            if cmd.schedule.is_some() {
                return Err(Error::ConfigError(format!(
                    "commands[{}] ('{}'): interval_seconds and schedule are mutually exclusive",
                    i, cmd.command_text
                )));
            }
            let (min, max) = (
                self.min_command_interval_seconds,
                self.max_command_interval_seconds,
            );
            if secs < min || secs > max {
                return Err(Error::ConfigError(format!(
                    "commands[{}].interval_seconds must be between {} and {}, got {}",
                    i, min, max, secs
                )));
            }
        }

        if let Some(expr) = &cmd.schedule {
            nwwatch_scheduler::Cadence::cron(expr).map_err(|e| {
                Error::ConfigError(format!("commands[{}].schedule: {}", i, e))
            })?;
        }

        if cmd.max_output_lines == Some(0) {
            return Err(Error::ConfigError(format!(
                "commands[{}].max_output_lines must be positive",
                i
            )));
        }

        Ok(())
    }

    /// Devices with dialects and credentials resolved
    pub fn devices(&self) -> Vec<Device> {
        self.devices.iter().map(DeviceConfig::to_device).collect()
    }

    /// Commands with effective output rules
    pub fn commands(&self) -> Vec<Command> {
        self.commands
            .iter()
            .map(|cmd| Command {
                text: cmd.command_text.clone(),
                name: cmd.name.clone(),
                interval_seconds: cmd.interval_seconds,
                schedule: cmd.schedule.clone(),
                output_rules: self.output_rules(cmd),
                sort_order: cmd.sort_order,
            })
            .collect()
    }

    fn output_rules(&self, cmd: &CommandConfig) -> OutputRules {
        let overrides = cmd.filters.clone().unwrap_or_default();
        OutputRules {
            line_exclusions: overrides
                .line_exclude_substrings
                .unwrap_or_else(|| self.global_filters.line_exclude_substrings.clone()),
            output_exclusions: overrides
                .output_exclude_substrings
                .unwrap_or_else(|| self.global_filters.output_exclude_substrings.clone()),
            max_lines: cmd.max_output_lines.unwrap_or(self.max_output_lines),
        }
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            persistent: self.ssh.persistent_connections,
            connect_timeout: Duration::from_secs(self.ssh.connection_timeout),
            command_timeout: Duration::from_secs(self.command_timeout_seconds),
            max_reconnect_attempts: self.ssh.max_reconnect_attempts,
            backoff_base: Duration::from_secs_f64(self.ssh.reconnect_backoff_base),
            backoff_max: Duration::from_secs_f64(self.ssh.reconnect_backoff_max),
        }
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            history_size: self.history_size,
            ping_window_seconds: self.ping_window_seconds as i64,
        }
    }

    pub fn host_key_policy(&self) -> HostKeyPolicy {
        if self.ssh.known_hosts_check {
            HostKeyPolicy::KnownHosts
        } else {
            HostKeyPolicy::NoCheck
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_seconds)
    }
}

impl DeviceConfig {
    /// Credential by precedence: env var, inline password, key file
    pub fn credential(&self) -> Option<Credential> {
        if let Some(key) = &self.password_env_key {
            return Some(Credential::PasswordEnv(key.clone()));
        }
        if let Some(password) = &self.password {
            return Some(Credential::Password(password.clone()));
        }
        self.key_path.clone().map(Credential::KeyFile)
    }

    pub fn ping_target(&self) -> &str {
        self.ping_host.as_deref().unwrap_or(&self.host)
    }

    fn to_device(&self) -> Device {
        let endpoint = DeviceEndpoint {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            credential: self
                .credential()
                .unwrap_or_else(|| Credential::Password(String::new())),
        };
        let mut device = Device::new(&self.name, endpoint, &self.device_type);
        device.ping_target = self.ping_target().to_string();
        device
    }
}

fn validate_device(i: usize, device: &DeviceConfig, target_pattern: &Regex) -> Result<()> {
    for (field, value) in [
        ("name", &device.name),
        ("host", &device.host),
        ("username", &device.username),
        ("device_type", &device.device_type),
    ] {
        if value.trim().is_empty() {
            return Err(Error::ConfigError(format!(
                "devices[{}].{} must not be empty",
                i, field
            )));
        }
    }

    if device.port == 0 {
        return Err(Error::ConfigError(format!(
            "devices[{}].port must be between 1 and 65535",
            i
        )));
    }

    if device.credential().is_none() {
        return Err(Error::ConfigError(format!(
            "Device '{}' must specify password_env_key, password or key_path",
            device.name
        )));
    }
    if device.password_env_key.is_none() && device.password.is_some() {
        warn!(
            device = %device.name,
            "Plaintext password in configuration; prefer password_env_key"
        );
    }

    let target = device.ping_target();
    if !target_pattern.is_match(target) {
        return Err(Error::ConfigError(format!(
            "devices[{}] ('{}'): invalid ping target '{}'; only letters, digits, '.', ':', '-' and '_' are allowed",
            i, device.name, target
        )));
    }

    if !is_known_device_type(&device.device_type) {
        warn!(
            device = %device.name,
            device_type = %device.device_type,
            "Unknown device type, using generic dialect"
        );
    }

    Ok(())
}

fn positive(field: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(Error::ConfigError(format!("{} must be positive", field)));
    }
    Ok(())
}
