//! Shared types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::dialect::Dialect;
use crate::pipeline::{OutputRules, ProcessedOutput};

/// A monitored network device
///
/// Built once from configuration and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct Device {
    /// Unique device name
    pub name: String,
    /// Where and how to open a remote shell
    pub endpoint: DeviceEndpoint,
    /// Command dialect spoken by this device
    pub dialect: Arc<dyn Dialect>,
    /// Host used for reachability probes (validated at load time)
    pub ping_target: String,
}

impl Device {
    /// Build a device that probes its own SSH host
    pub fn new(name: impl Into<String>, endpoint: DeviceEndpoint, device_type: &str) -> Self {
        let ping_target = endpoint.host.clone();
        Self {
            name: name.into(),
            endpoint,
            dialect: crate::dialect::dialect_for(device_type),
            ping_target,
        }
    }

    /// Get display string for device
    pub fn display(&self) -> String {
        format!(
            "{} ({}@{}:{}, {})",
            self.name,
            self.endpoint.username,
            self.endpoint.host,
            self.endpoint.port,
            self.dialect.name()
        )
    }
}

/// Remote shell endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEndpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential: Credential,
}

/// Reference to the secret used to authenticate
#[derive(Clone, PartialEq)]
pub enum Credential {
    /// Password read from the named environment variable at connect time
    PasswordEnv(String),
    /// Password embedded in the configuration file
    Password(String),
    /// Private key file
    KeyFile(PathBuf),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::PasswordEnv(key) => f.debug_tuple("PasswordEnv").field(key).finish(),
            Credential::Password(_) => f.write_str("Password(<redacted>)"),
            Credential::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
        }
    }
}

/// A command collected from every device
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Command text sent to the device (unique)
    pub text: String,
    /// Optional display name
    pub name: Option<String>,
    /// Per-command interval override in seconds
    pub interval_seconds: Option<u64>,
    /// Cron expression, mutually exclusive with `interval_seconds`
    pub schedule: Option<String>,
    /// Filter and truncation rules with global defaults already applied
    pub output_rules: OutputRules,
    /// Display ordering hint
    pub sort_order: Option<i64>,
}

impl Command {
    /// Create a command that inherits every default
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            name: None,
            interval_seconds: None,
            schedule: None,
            output_rules: OutputRules::default(),
            sort_order: None,
        }
    }
}

/// One recorded attempt to execute a command against a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub device: String,
    pub command: String,
    pub ts_epoch: i64,
    pub output_text: String,
    pub ok: bool,
    pub error_message: Option<String>,
    pub duration_ms: f64,
    pub is_filtered: bool,
    pub is_truncated: bool,
    pub original_line_count: i64,
}

impl Run {
    /// Build a successful run from processed output
    pub fn success(
        device: impl Into<String>,
        command: impl Into<String>,
        started_at: DateTime<Utc>,
        duration_ms: f64,
        output: ProcessedOutput,
    ) -> Self {
        Self {
            device: device.into(),
            command: command.into(),
            ts_epoch: started_at.timestamp(),
            output_text: output.text,
            ok: true,
            error_message: None,
            duration_ms,
            is_filtered: output.is_filtered,
            is_truncated: output.is_truncated,
            original_line_count: output.original_line_count as i64,
        }
    }

    /// Build a failed run carrying the error text
    pub fn failure(
        device: impl Into<String>,
        command: impl Into<String>,
        started_at: DateTime<Utc>,
        duration_ms: f64,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            device: device.into(),
            command: command.into(),
            ts_epoch: started_at.timestamp(),
            output_text: String::new(),
            ok: false,
            error_message: Some(error_message.into()),
            duration_ms,
            is_filtered: false,
            is_truncated: false,
            original_line_count: 0,
        }
    }
}

/// One reachability probe result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingSample {
    pub device: String,
    pub ts_epoch: i64,
    pub ok: bool,
    /// Round-trip time, absent on failure
    pub rtt_ms: Option<f64>,
    pub error_message: Option<String>,
}

impl PingSample {
    pub fn reachable(device: impl Into<String>, ts_epoch: i64, rtt_ms: Option<f64>) -> Self {
        Self {
            device: device.into(),
            ts_epoch,
            ok: true,
            rtt_ms,
            error_message: None,
        }
    }

    pub fn unreachable(
        device: impl Into<String>,
        ts_epoch: i64,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            device: device.into(),
            ts_epoch,
            ok: false,
            rtt_ms: None,
            error_message: Some(error_message.into()),
        }
    }
}

/// Results handed to the snapshot publisher as one unit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultBatch {
    pub runs: Vec<Run>,
    pub ping_samples: Vec<PingSample>,
}

impl ResultBatch {
    pub fn from_runs(runs: Vec<Run>) -> Self {
        Self {
            runs,
            ping_samples: Vec::new(),
        }
    }

    pub fn from_ping_samples(ping_samples: Vec<PingSample>) -> Self {
        Self {
            runs: Vec::new(),
            ping_samples,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty() && self.ping_samples.is_empty()
    }
}
