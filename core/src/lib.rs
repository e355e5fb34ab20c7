//! Core library for nwwatch
//!
//! Shared types, the error taxonomy, the per-device connection manager,
//! command dialects, the output pipeline, the control channel and
//! reachability probes used by the collector.

pub mod control;
pub mod dialect;
pub mod error;
pub mod pipeline;
pub mod probe;
pub mod remote;
pub mod ssh;
pub mod types;

// Re-exports
pub use control::{ControlChannel, ControlState, ControlUpdate};
pub use dialect::{dialect_for, Dialect};
pub use error::{Error, Result};
pub use pipeline::{process_output, OutputRules, ProcessedOutput};
pub use probe::{Prober, SystemPing};
pub use remote::{ConnectionManager, ConnectionSettings, Connector, Execution, Session};
pub use ssh::{get_secret, HostKeyPolicy, SshConnector};
pub use types::{Command, Credential, Device, DeviceEndpoint, PingSample, ResultBatch, Run};
