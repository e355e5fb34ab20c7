//! Read-only access to a published snapshot
//!
//! A reader pins the generation it opened. Reopen to pick up a newer one.

use nwwatch_core::Result;
use sqlx::{Pool, Sqlite};
use std::path::{Path, PathBuf};

use crate::models::{CommandRecord, DeviceRecord, PingSampleRecord, RunRecord};
use crate::queries;
use crate::Database;

pub struct SnapshotReader {
    db: Database,
    path: PathBuf,
}

impl SnapshotReader {
    pub async fn open(path: &Path) -> Result<Self> {
        let db = Database::open_read_only(path).await?;
        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        self.db.pool()
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        queries::list_devices(self.db.pool()).await
    }

    pub async fn list_commands(&self) -> Result<Vec<CommandRecord>> {
        queries::list_commands(self.db.pool()).await
    }

    /// Newest runs first, at most `limit`
    pub async fn latest_runs(
        &self,
        device: &str,
        command: &str,
        limit: i64,
        include_filtered: bool,
    ) -> Result<Vec<RunRecord>> {
        queries::get_latest_runs(self.db.pool(), device, command, limit, include_filtered).await
    }

    /// Most recent run of a pair, filtered or not
    pub async fn latest_run(&self, device: &str, command: &str) -> Result<Option<RunRecord>> {
        let mut runs = self.latest_runs(device, command, 1, true).await?;
        Ok(runs.pop())
    }

    /// Ping samples at or after `since_epoch`, newest first
    pub async fn ping_samples_since(
        &self,
        device: &str,
        since_epoch: i64,
    ) -> Result<Vec<PingSampleRecord>> {
        queries::get_ping_samples(self.db.pool(), device, since_epoch).await
    }

    pub async fn close(self) -> Result<()> {
        self.db.close().await
    }
}
