//! Liveness monitor
//!
//! Probes every device on a fixed cadence, independent of command
//! scheduling and of the pause flag.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument};

use nwwatch_core::{Device, PingSample, Prober, ResultBatch};
use nwwatch_database::SnapshotPublisher;

/// Device name and its pre-validated probe target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub device: String,
    pub target: String,
}

impl From<&Device> for ProbeTarget {
    fn from(device: &Device) -> Self {
        Self {
            device: device.name.clone(),
            target: device.ping_target.clone(),
        }
    }
}

pub struct LivenessMonitor {
    targets: Vec<ProbeTarget>,
    prober: Arc<dyn Prober>,
    interval: Duration,
}

impl LivenessMonitor {
    pub fn new(targets: Vec<ProbeTarget>, prober: Arc<dyn Prober>, interval: Duration) -> Self {
        Self {
            targets,
            prober,
            interval,
        }
    }

    /// Probe every target once, concurrently across devices
    ///
    /// Failures become unreachable samples and are not retried this tick.
    #[instrument(skip(self), fields(targets = self.targets.len()))]
    pub async fn tick(&self) -> Vec<PingSample> {
        let mut tasks = JoinSet::new();
        for target in &self.targets {
            let target = target.clone();
            let prober = Arc::clone(&self.prober);
            tasks.spawn(async move { probe_one(prober.as_ref(), &target).await });
        }

        let mut samples = Vec::with_capacity(self.targets.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(sample) => samples.push(sample),
                Err(e) => error!(error = %e, "Probe task panicked"),
            }
        }
        samples
    }

    /// Probe, append and publish every interval until `shutdown` turns true
    pub async fn run(&self, publisher: &SnapshotPublisher, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs_f64(),
            targets = self.targets.len(),
            "Liveness monitor started"
        );

        while !*shutdown.borrow() {
            let samples = self.tick().await;
            if !samples.is_empty() {
                match publisher.append(&ResultBatch::from_ping_samples(samples)).await {
                    Ok(()) => publisher.publish_or_log().await,
                    Err(e) => error!(error = %e, "Failed to store ping samples"),
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Liveness monitor stopped");
    }
}

async fn probe_one(prober: &dyn Prober, target: &ProbeTarget) -> PingSample {
    let ts = Utc::now().timestamp();
    match prober.probe(&target.target).await {
        Ok(rtt_ms) => {
            debug!(device = %target.device, rtt_ms = ?rtt_ms, "Device reachable");
            PingSample::reachable(&target.device, ts, rtt_ms)
        }
        Err(e) => {
            debug!(device = %target.device, error = %e, "Device unreachable");
            PingSample::unreachable(&target.device, ts, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nwwatch_core::{Error, Result};
    use nwwatch_database::{SnapshotReader, StoreSettings};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct FakeProber {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Prober for FakeProber {
        async fn probe(&self, target: &str) -> Result<Option<f64>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if target.starts_with("10.") {
                Ok(Some(1.5))
            } else {
                Err(Error::ConnectionError("Ping failed".to_string()))
            }
        }
    }

    fn targets() -> Vec<ProbeTarget> {
        vec![
            ProbeTarget {
                device: "up".to_string(),
                target: "10.0.0.1".to_string(),
            },
            ProbeTarget {
                device: "down".to_string(),
                target: "192.0.2.1".to_string(),
            },
        ]
    }

    #[tokio::test]
    async fn test_tick_one_sample_per_device() {
        let prober = Arc::new(FakeProber {
            calls: AtomicUsize::new(0),
        });
        let monitor = LivenessMonitor::new(targets(), prober.clone(), Duration::from_secs(1));

        let samples = monitor.tick().await;
        assert_eq!(samples.len(), 2);
        assert_eq!(prober.calls.load(Ordering::SeqCst), 2);

        let up = samples.iter().find(|s| s.device == "up").unwrap();
        assert!(up.ok);
        assert_eq!(up.rtt_ms, Some(1.5));

        let down = samples.iter().find(|s| s.device == "down").unwrap();
        assert!(!down.ok);
        assert!(down.rtt_ms.is_none());
        assert_eq!(down.error_message.as_deref(), Some("Connection error: Ping failed"));
    }

    #[tokio::test]
    async fn test_run_publishes_until_shutdown() {
        let dir = TempDir::new().unwrap();
        let publisher = SnapshotPublisher::create(dir.path(), StoreSettings::default())
            .await
            .unwrap();
        let prober = Arc::new(FakeProber {
            calls: AtomicUsize::new(0),
        });
        let monitor = LivenessMonitor::new(targets(), prober, Duration::from_millis(20));
        let (tx, rx) = watch::channel(false);

        let stopper = async {
            tokio::time::sleep(Duration::from_millis(110)).await;
            let _ = tx.send(true);
        };
        tokio::join!(monitor.run(&publisher, rx), stopper);

        assert!(publisher.generation() >= 2);
        let reader = SnapshotReader::open(publisher.snapshot_path()).await.unwrap();
        let samples = reader.ping_samples_since("up", 0).await.unwrap();
        assert!(samples.len() >= 2);
        assert!(samples.iter().all(|s| s.ok));
    }
}
