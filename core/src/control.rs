//! Collector control state
//!
//! A small JSON file shared between the collector and an operator surface.
//! The collector only reads it, once per scheduling tick. Writers replace
//! the whole file atomically (write to a temp file, then rename), so a
//! reader never sees a half-written update.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::{Error, Result};

/// File name of the control state inside the control directory
pub const CONTROL_STATE_FILENAME: &str = "collector_control.json";

/// Directory used when neither a flag nor the environment names one
pub const DEFAULT_CONTROL_DIR: &str = "control";

/// Environment variable overriding the control directory
pub const CONTROL_DIR_ENV: &str = "NWWATCH_CONTROL_DIR";

/// Shared pause/shutdown flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlState {
    pub commands_paused: bool,
    pub shutdown_requested: bool,
    /// Epoch seconds of the last write
    pub updated_at: i64,
}

/// Partial update applied by an external actor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlUpdate {
    pub commands_paused: Option<bool>,
    pub shutdown_requested: Option<bool>,
}

impl ControlUpdate {
    pub fn pause() -> Self {
        Self {
            commands_paused: Some(true),
            ..Self::default()
        }
    }

    pub fn resume() -> Self {
        Self {
            commands_paused: Some(false),
            ..Self::default()
        }
    }

    pub fn request_shutdown() -> Self {
        Self {
            shutdown_requested: Some(true),
            ..Self::default()
        }
    }

    pub fn clear_shutdown() -> Self {
        Self {
            shutdown_requested: Some(false),
            ..Self::default()
        }
    }

    fn apply(&self, state: &mut ControlState) {
        if let Some(paused) = self.commands_paused {
            state.commands_paused = paused;
        }
        if let Some(shutdown) = self.shutdown_requested {
            state.shutdown_requested = shutdown;
        }
    }
}

/// File-backed control channel
#[derive(Debug, Clone)]
pub struct ControlChannel {
    path: PathBuf,
}

impl ControlChannel {
    /// Use `collector_control.json` inside `dir`
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(CONTROL_STATE_FILENAME),
        }
    }

    /// Resolve the directory from an explicit override, the environment, or the default
    pub fn resolve(dir_override: Option<&Path>) -> Self {
        match dir_override {
            Some(dir) => Self::new(dir),
            None => {
                let dir = std::env::var(CONTROL_DIR_ENV)
                    .unwrap_or_else(|_| DEFAULT_CONTROL_DIR.to_string());
                Self::new(dir)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current state
    ///
    /// A missing or unreadable file means "not paused, not shutting down".
    pub async fn read(&self) -> ControlState {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ControlState::default();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read control state");
                return ControlState::default();
            }
        };

        match serde_json::from_str(&content) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to parse control state");
                ControlState::default()
            }
        }
    }

    /// Merge `update` into the current state and atomically replace the file
    pub async fn write(&self, update: ControlUpdate) -> Result<ControlState> {
        let mut state = self.read().await;
        update.apply(&mut state);
        state.updated_at = Utc::now().timestamp();

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    Error::ControlError(format!(
                        "Failed to create control directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let mut body = serde_json::to_string_pretty(&state)?;
        body.push('\n');

        // Unique per writer so concurrent writers never share a temp file
        let tmp_path = self.path.with_extension(format!(
            "{}.{}.tmp",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        tokio::fs::write(&tmp_path, body).await.map_err(|e| {
            Error::ControlError(format!("Failed to write {}: {}", tmp_path.display(), e))
        })?;

        if let Err(e) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(Error::ControlError(format!(
                "Failed to replace {}: {}",
                self.path.display(),
                e
            )));
        }

        debug!(path = %self.path.display(), ?state, "Control state written");
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_is_fail_open() {
        let dir = TempDir::new().unwrap();
        let channel = ControlChannel::new(dir.path());
        assert_eq!(channel.read().await, ControlState::default());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let channel = ControlChannel::new(dir.path().join("control"));

        let written = channel.write(ControlUpdate::pause()).await.unwrap();
        assert!(written.commands_paused);
        assert!(!written.shutdown_requested);
        assert!(written.updated_at > 0);

        let read = channel.read().await;
        assert_eq!(read, written);
    }

    #[tokio::test]
    async fn test_partial_update_keeps_other_flags() {
        let dir = TempDir::new().unwrap();
        let channel = ControlChannel::new(dir.path());

        channel.write(ControlUpdate::pause()).await.unwrap();
        let state = channel.write(ControlUpdate::request_shutdown()).await.unwrap();
        assert!(state.commands_paused);
        assert!(state.shutdown_requested);

        let state = channel.write(ControlUpdate::resume()).await.unwrap();
        assert!(!state.commands_paused);
        assert!(state.shutdown_requested);
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let channel = ControlChannel::new(dir.path());
        channel.write(ControlUpdate::pause()).await.unwrap();
        channel.write(ControlUpdate::resume()).await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries, vec![CONTROL_STATE_FILENAME.to_string()]);
    }

    #[tokio::test]
    async fn test_partial_json_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let channel = ControlChannel::new(dir.path());
        std::fs::write(channel.path(), r#"{"commands_paused": true}"#).unwrap();

        let state = channel.read().await;
        assert!(state.commands_paused);
        assert!(!state.shutdown_requested);
        assert_eq!(state.updated_at, 0);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_fail_open() {
        let dir = TempDir::new().unwrap();
        let channel = ControlChannel::new(dir.path());
        std::fs::write(channel.path(), "{not json").unwrap();
        assert_eq!(channel.read().await, ControlState::default());
    }
}
