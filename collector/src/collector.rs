//! The collection loop
//!
//! Two loops run side by side: the command loop (control check, due pairs,
//! execution, append, publish) and the liveness loop. Either a control-state
//! shutdown or a process signal stops both; the in-flight cycle drains, a
//! final snapshot is published and only then are connections closed.

use chrono::Utc;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use nwwatch_core::{
    ConnectionManager, Connector, ControlChannel, Prober, Result, ResultBatch, SshConnector,
    SystemPing,
};
use nwwatch_database::SnapshotPublisher;
use nwwatch_scheduler::{LivenessMonitor, Orchestrator, ProbeTarget, Scheduler, Tick};

use crate::config::Config;

pub struct Collector {
    scheduler: Scheduler,
    orchestrator: Orchestrator,
    monitor: LivenessMonitor,
    publisher: SnapshotPublisher,
    control: ControlChannel,
}

impl Collector {
    /// Build a collector speaking SSH and probing with the system `ping`
    pub async fn new(config: &Config, data_dir: &Path, control: ControlChannel) -> Result<Self> {
        let connector = Arc::new(SshConnector::new(config.host_key_policy()));
        let prober = Arc::new(SystemPing::default());
        Self::with_transport(config, data_dir, control, connector, prober).await
    }

    /// Build a collector over the given transport and prober
    pub async fn with_transport(
        config: &Config,
        data_dir: &Path,
        control: ControlChannel,
        connector: Arc<dyn Connector>,
        prober: Arc<dyn Prober>,
    ) -> Result<Self> {
        let devices = config.devices();
        let commands = config.commands();

        let publisher = SnapshotPublisher::create(data_dir, config.store_settings()).await?;
        publisher.register(&devices, &commands).await?;
        publisher.publish_or_log().await;

        let scheduler = Scheduler::new(
            devices.iter().map(|d| d.name.clone()).collect(),
            commands,
            config.interval(),
            Utc::now(),
        )?;

        let targets = devices.iter().map(ProbeTarget::from).collect();
        let monitor = LivenessMonitor::new(targets, prober, config.ping_interval());

        for device in &devices {
            debug!(device = %device.display(), "Device configured");
        }
        let connections = Arc::new(ConnectionManager::new(
            devices,
            connector,
            config.connection_settings(),
        ));
        let orchestrator = Orchestrator::new(connections, config.max_parallel);

        Ok(Self {
            scheduler,
            orchestrator,
            monitor,
            publisher,
            control,
        })
    }

    pub fn publisher(&self) -> &SnapshotPublisher {
        &self.publisher
    }

    /// Run until shutdown is requested through the control state or
    /// `signal` resolves
    pub async fn run<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Collector {
            mut scheduler,
            mut orchestrator,
            monitor,
            publisher,
            control,
        } = self;

        let initial = control.read().await;
        if initial.shutdown_requested {
            warn!(
                path = %control.path().display(),
                "Shutdown already requested in control state; clear it to keep collecting"
            );
        }
        if initial.commands_paused {
            info!("Commands start paused");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let signal_watch = {
            let mut stopped = shutdown_rx.clone();
            let shutdown_tx = shutdown_tx.clone();
            async move {
                tokio::select! {
                    _ = signal => {
                        info!("Shutdown signal received, finishing current cycle");
                        let _ = shutdown_tx.send(true);
                    }
                    _ = stopped.wait_for(|stop| *stop) => {}
                }
            }
        };

        let command_loop = command_loop(
            &mut scheduler,
            &mut orchestrator,
            &publisher,
            &control,
            shutdown_tx,
            shutdown_rx.clone(),
        );
        let ping_loop = monitor.run(&publisher, shutdown_rx);

        tokio::join!(signal_watch, command_loop, ping_loop);

        info!("Collection stopped, publishing final snapshot");
        publisher.publish_or_log().await;
        orchestrator.connections().close_all().await;
        publisher.close().await?;

        info!("Collector shut down");
        Ok(())
    }
}

async fn command_loop(
    scheduler: &mut Scheduler,
    orchestrator: &mut Orchestrator,
    publisher: &SnapshotPublisher,
    control: &ControlChannel,
    shutdown_tx: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut was_paused = false;

    loop {
        let state = control.read().await;
        match scheduler.tick(Utc::now(), &state) {
            Tick::Shutdown => {
                info!("Shutdown requested through control state");
                let _ = shutdown_tx.send(true);
                break;
            }
            Tick::Paused => {
                if !was_paused {
                    info!("Command execution paused");
                    was_paused = true;
                }
            }
            Tick::Due(due) => {
                if was_paused {
                    info!("Command execution resumed");
                    was_paused = false;
                }
                let runs = orchestrator.run_cycle(due).await;
                if !runs.is_empty() {
                    match publisher.append(&ResultBatch::from_runs(runs)).await {
                        Ok(()) => publisher.publish_or_log().await,
                        Err(e) => error!(error = %e, "Failed to store runs"),
                    }
                }
            }
        }

        if *shutdown_rx.borrow() {
            break;
        }

        let sleep = scheduler.sleep_duration(Utc::now());
        tokio::select! {
            _ = tokio::time::sleep(sleep) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        if *shutdown_rx.borrow() {
            break;
        }
    }

    let leftovers = orchestrator.drain().await;
    if !leftovers.is_empty() {
        if let Err(e) = publisher.append(&ResultBatch::from_runs(leftovers)).await {
            error!(error = %e, "Failed to store late runs");
        }
    }

    debug!("Command loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nwwatch_core::{ControlUpdate, Device, Error, Session};
    use nwwatch_database::SnapshotReader;
    use nwwatch_database::snapshot::SNAPSHOT_FILENAME;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Counters {
        command_delay: Duration,
        commands: AtomicUsize,
        finished: AtomicUsize,
        closes: AtomicUsize,
        pings: AtomicUsize,
        /// Runs visible in the published snapshot at each session close
        runs_at_close: StdMutex<Vec<usize>>,
    }

    struct FakeConnector {
        counters: Arc<Counters>,
        snapshot: PathBuf,
    }

    struct FakeSession {
        counters: Arc<Counters>,
        snapshot: PathBuf,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self, device: &Device) -> Result<Box<dyn Session>> {
            if device.name == "locked" {
                return Err(Error::AuthenticationError("Permission denied".to_string()));
            }
            Ok(Box::new(FakeSession {
                counters: Arc::clone(&self.counters),
                snapshot: self.snapshot.clone(),
            }))
        }
    }

    #[async_trait]
    impl Session for FakeSession {
        async fn send_command(&mut self, command: &str) -> Result<String> {
            self.counters.commands.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.counters.command_delay).await;
            self.counters.finished.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{} ok", command))
        }

        async fn is_alive(&mut self) -> bool {
            true
        }

        async fn close(&mut self) -> Result<()> {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
            let visible = match SnapshotReader::open(&self.snapshot).await {
                Ok(reader) => {
                    let runs = reader.latest_runs("good", "show version", 10, true).await?;
                    reader.close().await?;
                    runs.len()
                }
                Err(_) => 0,
            };
            self.counters.runs_at_close.lock().unwrap().push(visible);
            Ok(())
        }
    }

    struct FakeProber {
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl Prober for FakeProber {
        async fn probe(&self, _target: &str) -> Result<Option<f64>> {
            self.counters.pings.fetch_add(1, Ordering::SeqCst);
            Ok(Some(0.4))
        }
    }

    const CONFIG: &str = r#"
interval_seconds = 1
ping_interval_seconds = 1
min_command_interval_seconds = 1

[ssh]
max_reconnect_attempts = 1
reconnect_backoff_base = 0.01
reconnect_backoff_max = 0.02

[[commands]]
command_text = "show version"

[[devices]]
name = "good"
host = "10.0.0.1"
username = "admin"
password = "x"
device_type = "linux"

[[devices]]
name = "locked"
host = "10.0.0.2"
username = "admin"
password = "x"
device_type = "linux"
"#;

    async fn collector(dir: &TempDir, counters: &Arc<Counters>) -> Collector {
        let config = Config::from_toml(CONFIG).unwrap();
        let control = ControlChannel::new(dir.path().join("control"));
        Collector::with_transport(
            &config,
            &dir.path().join("data"),
            control,
            Arc::new(FakeConnector {
                counters: Arc::clone(counters),
                snapshot: dir.path().join("data").join(SNAPSHOT_FILENAME),
            }),
            Arc::new(FakeProber {
                counters: Arc::clone(counters),
            }),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_failing_device_does_not_block_others() {
        let dir = TempDir::new().unwrap();
        let counters = Arc::new(Counters::default());
        let collector = collector(&dir, &counters).await;
        let snapshot = collector.publisher().snapshot_path().to_path_buf();

        let stop = async {
            tokio::time::sleep(Duration::from_millis(300)).await;
        };
        collector.run(stop).await.unwrap();

        let reader = SnapshotReader::open(&snapshot).await.unwrap();
        let good = reader.latest_runs("good", "show version", 10, true).await.unwrap();
        assert!(!good.is_empty());
        assert!(good.iter().all(|r| r.ok));

        let locked = reader.latest_runs("locked", "show version", 10, true).await.unwrap();
        assert!(!locked.is_empty());
        assert!(locked.iter().all(|r| !r.ok));

        // Only the healthy device ever had a session to close
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_mid_cycle_publishes_batch_before_closing() {
        let dir = TempDir::new().unwrap();
        let counters = Arc::new(Counters {
            command_delay: Duration::from_millis(400),
            ..Counters::default()
        });
        let control = ControlChannel::new(dir.path().join("control"));
        let collector = collector(&dir, &counters).await;
        let snapshot = collector.publisher().snapshot_path().to_path_buf();

        // Request the stop while the first command is still running
        let stopper = async {
            while counters.commands.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            control.write(ControlUpdate::request_shutdown()).await.unwrap();
            assert_eq!(counters.finished.load(Ordering::SeqCst), 0);
            counters.commands.load(Ordering::SeqCst)
        };
        let never = std::future::pending::<()>();

        let (result, started_at_stop) = tokio::time::timeout(
            Duration::from_secs(10),
            async { tokio::join!(collector.run(never), stopper) },
        )
        .await
        .expect("collector did not stop");
        result.unwrap();

        // The in-flight command finished and nothing new started
        assert_eq!(started_at_stop, 1);
        assert_eq!(counters.commands.load(Ordering::SeqCst), 1);
        assert_eq!(counters.finished.load(Ordering::SeqCst), 1);

        let reader = SnapshotReader::open(&snapshot).await.unwrap();
        let runs = reader.latest_runs("good", "show version", 10, true).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].ok);

        // The session closed only after its run was published
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert_eq!(*counters.runs_at_close.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_pause_stops_runs_but_not_pings() {
        let dir = TempDir::new().unwrap();
        let counters = Arc::new(Counters::default());
        let control = ControlChannel::new(dir.path().join("control"));
        control.write(ControlUpdate::pause()).await.unwrap();
        let collector = collector(&dir, &counters).await;
        let snapshot = collector.publisher().snapshot_path().to_path_buf();

        let stop = async {
            tokio::time::sleep(Duration::from_millis(1500)).await;
        };
        collector.run(stop).await.unwrap();

        assert_eq!(counters.commands.load(Ordering::SeqCst), 0);
        assert!(counters.pings.load(Ordering::SeqCst) >= 2);

        let reader = SnapshotReader::open(&snapshot).await.unwrap();
        assert!(reader.latest_run("good", "show version").await.unwrap().is_none());
        assert!(!reader.ping_samples_since("good", 0).await.unwrap().is_empty());
    }
}
