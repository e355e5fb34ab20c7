//! Working store and atomic snapshot publishing
//!
//! Results land in a per-session working database. After each cycle the
//! whole store is copied with `VACUUM INTO` to a temporary file which is then
//! renamed over `current.sqlite3`, so readers only ever open a complete
//! generation.

use chrono::Utc;
use nwwatch_core::{Command, Device, Error, ResultBatch, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument};

use crate::queries;
use crate::Database;

/// File name of the published snapshot inside the data directory
pub const SNAPSHOT_FILENAME: &str = "current.sqlite3";

/// Retention limits for the working store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreSettings {
    /// Runs kept per (device, command) pair
    pub history_size: usize,
    /// Ping samples older than this, relative to the newest sample of the
    /// device, are dropped
    pub ping_window_seconds: i64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            history_size: 10,
            ping_window_seconds: 60,
        }
    }
}

/// Owns the working store and publishes snapshots of it
pub struct SnapshotPublisher {
    db: Database,
    settings: StoreSettings,
    working_path: PathBuf,
    snapshot_path: PathBuf,
    publish_lock: Mutex<()>,
    generation: AtomicU64,
}

impl SnapshotPublisher {
    /// Create a fresh session store under `data_dir`
    pub async fn create(data_dir: &Path, settings: StoreSettings) -> Result<Self> {
        let working_path = data_dir.join(format!("session_{}.sqlite3", Utc::now().timestamp()));
        let snapshot_path = data_dir.join(SNAPSHOT_FILENAME);
        Self::create_at(working_path, snapshot_path, settings).await
    }

    /// Create a store at explicit working and snapshot paths
    pub async fn create_at(
        working_path: PathBuf,
        snapshot_path: PathBuf,
        settings: StoreSettings,
    ) -> Result<Self> {
        let db = Database::open(&working_path).await?;
        db.migrate().await?;

        info!(
            working = %working_path.display(),
            snapshot = %snapshot_path.display(),
            history_size = settings.history_size,
            ping_window_seconds = settings.ping_window_seconds,
            "Snapshot store ready"
        );

        Ok(Self {
            db,
            settings,
            working_path,
            snapshot_path,
            publish_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        })
    }

    pub fn working_path(&self) -> &Path {
        &self.working_path
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Number of snapshots published so far
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Register every configured device and command so they show up in
    /// snapshots before their first result
    #[instrument(skip_all, fields(devices = devices.len(), commands = commands.len()))]
    pub async fn register(&self, devices: &[Device], commands: &[Command]) -> Result<()> {
        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| Error::DatabaseError(format!("Failed to begin transaction: {}", e)))?;

        for device in devices {
            queries::get_or_create_device(&mut tx, &device.name).await?;
        }
        for command in commands {
            queries::get_or_create_command(&mut tx, &command.text).await?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::DatabaseError(format!("Failed to commit registration: {}", e)))?;

        debug!("Registered devices and commands");
        Ok(())
    }

    /// Append a batch of results with retention applied in the same
    /// transaction
    #[instrument(skip_all, fields(runs = batch.runs.len(), pings = batch.ping_samples.len()))]
    pub async fn append(&self, batch: &ResultBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| Error::DatabaseError(format!("Failed to begin transaction: {}", e)))?;

        let keep = self.settings.history_size.max(1) as i64;
        let mut evicted_runs = 0u64;
        for run in &batch.runs {
            let device_id = queries::get_or_create_device(&mut tx, &run.device).await?;
            let command_id = queries::get_or_create_command(&mut tx, &run.command).await?;
            queries::insert_run(&mut tx, device_id, command_id, run).await?;
            evicted_runs += queries::evict_old_runs(&mut tx, device_id, command_id, keep).await?;
        }

        let mut newest: HashMap<i64, i64> = HashMap::new();
        for sample in &batch.ping_samples {
            let device_id = queries::get_or_create_device(&mut tx, &sample.device).await?;
            queries::insert_ping_sample(&mut tx, device_id, sample).await?;
            let ts = newest.entry(device_id).or_insert(sample.ts_epoch);
            *ts = (*ts).max(sample.ts_epoch);
        }

        let mut evicted_pings = 0u64;
        for (device_id, newest_ts) in newest {
            let cutoff = newest_ts - self.settings.ping_window_seconds;
            evicted_pings += queries::evict_ping_samples_before(&mut tx, device_id, cutoff).await?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::DatabaseError(format!("Failed to commit results: {}", e)))?;

        debug!(evicted_runs, evicted_pings, "Results appended");
        Ok(())
    }

    /// Publish the working store as the new current snapshot
    ///
    /// Returns the new generation number. On failure the previous snapshot
    /// stays in place and the working store is untouched.
    #[instrument(skip(self))]
    pub async fn publish(&self) -> Result<u64> {
        let _guard = self.publish_lock.lock().await;

        let tmp_path = self.snapshot_path.with_extension("sqlite3.tmp");
        if tmp_path.exists() {
            tokio::fs::remove_file(&tmp_path).await.map_err(|e| {
                Error::PublishError(format!("Failed to remove stale temp snapshot: {}", e))
            })?;
        }

        let sql = format!("VACUUM INTO '{}'", sql_quote(&tmp_path));
        if let Err(e) = sqlx::query(&sql).execute(self.db.pool()).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(Error::PublishError(format!("Failed to copy working store: {}", e)));
        }

        if let Err(e) = tokio::fs::rename(&tmp_path, &self.snapshot_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(Error::PublishError(format!(
                "Failed to replace {}: {}",
                self.snapshot_path.display(),
                e
            )));
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(generation, "Snapshot published");
        Ok(generation)
    }

    /// Publish, logging instead of returning a failure
    pub async fn publish_or_log(&self) {
        if let Err(e) = self.publish().await {
            error!(error = %e, "Snapshot publish failed; previous snapshot kept");
        }
    }

    /// Close the working store
    pub async fn close(self) -> Result<()> {
        info!(working = %self.working_path.display(), "Closing snapshot store");
        self.db.close().await
    }
}

fn sql_quote(path: &Path) -> String {
    path.display().to_string().replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SnapshotReader;
    use nwwatch_core::{Credential, DeviceEndpoint, PingSample, Run};
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn run(device: &str, command: &str, ts: i64, output: &str) -> Run {
        Run {
            device: device.to_string(),
            command: command.to_string(),
            ts_epoch: ts,
            output_text: output.to_string(),
            ok: true,
            error_message: None,
            duration_ms: 12.5,
            is_filtered: false,
            is_truncated: false,
            original_line_count: 1,
        }
    }

    async fn publisher(dir: &TempDir, settings: StoreSettings) -> SnapshotPublisher {
        SnapshotPublisher::create(dir.path(), settings)
            .await
            .expect("create publisher")
    }

    #[tokio::test]
    async fn test_history_is_capped_per_pair() {
        let dir = TempDir::new().unwrap();
        let store = publisher(
            &dir,
            StoreSettings {
                history_size: 3,
                ping_window_seconds: 60,
            },
        )
        .await;

        for ts in 0..5 {
            let batch = ResultBatch::from_runs(vec![
                run("r1", "show version", 100 + ts, &format!("v{}", ts)),
                run("r1", "show clock", 100 + ts, "clock"),
            ]);
            store.append(&batch).await.unwrap();
        }
        store.publish().await.unwrap();

        let reader = SnapshotReader::open(store.snapshot_path()).await.unwrap();
        let runs = reader.latest_runs("r1", "show version", 10, true).await.unwrap();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].output(), "v4");
        assert_eq!(runs[2].output(), "v2");

        let clock = reader.latest_runs("r1", "show clock", 10, true).await.unwrap();
        assert_eq!(clock.len(), 3);
        assert_eq!(queries::count_runs(reader.pool()).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_ping_window_relative_to_newest_sample() {
        let dir = TempDir::new().unwrap();
        let store = publisher(
            &dir,
            StoreSettings {
                history_size: 10,
                ping_window_seconds: 10,
            },
        )
        .await;

        let samples = (0..30)
            .map(|i| PingSample::reachable("r1", 1_000 + i, Some(1.0)))
            .collect();
        store
            .append(&ResultBatch::from_ping_samples(samples))
            .await
            .unwrap();
        store
            .append(&ResultBatch::from_ping_samples(vec![PingSample::reachable(
                "r2", 500, None,
            )]))
            .await
            .unwrap();
        store.publish().await.unwrap();

        let reader = SnapshotReader::open(store.snapshot_path()).await.unwrap();
        let r1 = reader.ping_samples_since("r1", 0).await.unwrap();
        assert_eq!(r1.len(), 11);
        assert_eq!(r1[0].ts_epoch, 1_029);
        assert_eq!(r1.last().unwrap().ts_epoch, 1_019);

        // Another device's window is independent
        let r2 = reader.ping_samples_since("r2", 0).await.unwrap();
        assert_eq!(r2.len(), 1);
    }

    #[tokio::test]
    async fn test_registered_devices_visible_before_results() {
        let dir = TempDir::new().unwrap();
        let store = publisher(&dir, StoreSettings::default()).await;

        let endpoint = DeviceEndpoint {
            host: "10.0.0.1".to_string(),
            port: 22,
            username: "admin".to_string(),
            credential: Credential::PasswordEnv("EDGE_PASSWORD".to_string()),
        };
        let device = Device::new("edge-1", endpoint, "cisco_ios");
        store
            .register(&[device], &[Command::new("show ip route")])
            .await
            .unwrap();
        assert_eq!(store.publish().await.unwrap(), 1);

        let reader = SnapshotReader::open(store.snapshot_path()).await.unwrap();
        let devices = reader.list_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "edge-1");
        let commands = reader.list_commands().await.unwrap();
        assert_eq!(commands[0].command_text, "show ip route");
        assert!(reader.latest_run("edge-1", "show ip route").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_reader_keeps_its_generation() {
        let dir = TempDir::new().unwrap();
        let store = publisher(&dir, StoreSettings::default()).await;

        store
            .append(&ResultBatch::from_runs(vec![run("r1", "show version", 1, "first")]))
            .await
            .unwrap();
        store.publish().await.unwrap();

        let old = SnapshotReader::open(store.snapshot_path()).await.unwrap();
        let before = old.latest_runs("r1", "show version", 10, true).await.unwrap();
        assert_eq!(before.len(), 1);

        store
            .append(&ResultBatch::from_runs(vec![run("r1", "show version", 2, "second")]))
            .await
            .unwrap();
        assert_eq!(store.publish().await.unwrap(), 2);

        // A reader that opened the previous generation still sees it intact
        let still_old = old.latest_runs("r1", "show version", 10, true).await.unwrap();
        assert_eq!(still_old.len(), 1);
        assert_eq!(still_old[0].output(), "first");

        let fresh = SnapshotReader::open(store.snapshot_path()).await.unwrap();
        let latest = fresh.latest_run("r1", "show version").await.unwrap().unwrap();
        assert_eq!(latest.output(), "second");
    }

    const PAIRS: [(&str, &str); 4] = [
        ("r1", "show version"),
        ("r1", "show clock"),
        ("r2", "show version"),
        ("r2", "show interfaces"),
    ];

    fn tagged_batch(generation: i64) -> ResultBatch {
        let marker = format!("batch-{}", generation);
        ResultBatch::from_runs(
            PAIRS
                .iter()
                .map(|(device, command)| run(device, command, 1_000 + generation, &marker))
                .collect(),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_readers_never_see_mixed_batches() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(publisher(&dir, StoreSettings::default()).await);
        store.append(&tagged_batch(0)).await.unwrap();
        store.publish().await.unwrap();

        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let store = Arc::clone(&store);
            let done = Arc::clone(&done);
            tokio::spawn(async move {
                for generation in 1..=40 {
                    store.append(&tagged_batch(generation)).await.unwrap();
                    store.publish().await.unwrap();
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        let reader = {
            let path = store.snapshot_path().to_path_buf();
            let done = Arc::clone(&done);
            tokio::spawn(async move {
                let mut checks = 0;
                loop {
                    let finished = done.load(Ordering::SeqCst);
                    let reader = SnapshotReader::open(&path)
                        .await
                        .expect("published snapshot must always open");

                    let mut markers = HashSet::new();
                    for (device, command) in PAIRS {
                        let latest = reader
                            .latest_run(device, command)
                            .await
                            .unwrap()
                            .expect("every pair has a run");
                        markers.insert(latest.output().to_string());
                    }
                    reader.close().await.unwrap();

                    assert_eq!(markers.len(), 1, "runs from several batches: {:?}", markers);
                    checks += 1;
                    if finished {
                        return (checks, markers.into_iter().next());
                    }
                }
            })
        };

        writer.await.unwrap();
        let (checks, last) = reader.await.unwrap();
        assert!(checks >= 1);
        assert_eq!(last.as_deref(), Some("batch-40"));
        assert_eq!(store.generation(), 41);
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_store_usable() {
        let dir = TempDir::new().unwrap();
        let store = publisher(&dir, StoreSettings::default()).await;

        // A non-empty directory in place of the snapshot cannot be replaced
        std::fs::create_dir_all(store.snapshot_path().join("blocker")).unwrap();

        store
            .append(&ResultBatch::from_runs(vec![run("r1", "show version", 1, "x")]))
            .await
            .unwrap();
        let err = store.publish().await.unwrap_err();
        assert!(matches!(err, Error::PublishError(_)));
        assert_eq!(store.generation(), 0);
        assert!(!store.snapshot_path().with_extension("sqlite3.tmp").exists());

        store
            .append(&ResultBatch::from_runs(vec![run("r1", "show version", 2, "y")]))
            .await
            .unwrap();

        std::fs::remove_dir_all(store.snapshot_path()).unwrap();
        assert_eq!(store.publish().await.unwrap(), 1);

        let reader = SnapshotReader::open(store.snapshot_path()).await.unwrap();
        let runs = reader.latest_runs("r1", "show version", 10, true).await.unwrap();
        assert_eq!(runs.len(), 2);
    }

    #[tokio::test]
    async fn test_session_file_naming() {
        let dir = TempDir::new().unwrap();
        let store = publisher(&dir, StoreSettings::default()).await;

        let name = store
            .working_path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .to_string();
        assert!(name.starts_with("session_"));
        assert!(name.ends_with(".sqlite3"));
        assert_eq!(store.snapshot_path(), dir.path().join("current.sqlite3"));
    }

    #[test]
    fn test_sql_quote_escapes_single_quotes() {
        assert_eq!(sql_quote(Path::new("/tmp/it's.db")), "/tmp/it''s.db");
    }
}
