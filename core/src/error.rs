//! Error types

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Authentication error: {0}")]
    AuthenticationError(String),

    #[error("Remote execution error: {0}")]
    RemoteExecutionError(String),

    #[error("Timeout: {0}")]
    TimeoutError(String),

    #[error("Publish error: {0}")]
    PublishError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Control state error: {0}")]
    ControlError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    /// Whether a session that produced this error must be replaced before reuse.
    ///
    /// Remote execution errors (the device answered, but rejected the command)
    /// leave the session usable.
    pub fn marks_stale(&self) -> bool {
        matches!(
            self,
            Error::TimeoutError(_) | Error::ConnectionError(_) | Error::IoError(_)
        )
    }
}

// Convert anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}
