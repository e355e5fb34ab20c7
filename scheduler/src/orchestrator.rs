//! Execution orchestrator
//!
//! Fans due pairs out over a bounded pool. Each device's pairs for a tick
//! run in one task, in dispatch order, so a device never sees more than
//! one command at a time and never in a different order than scheduled.
//!
//! A cycle waits at most the connect timeout. Device tasks still running
//! then keep going in the background; their runs are handed out with a
//! later cycle and the device gets no new work until they finish.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, instrument, warn};

use nwwatch_core::{process_output, ConnectionManager, Run};

use crate::schedule::DuePair;

/// Longest a single cycle waits for its devices
const MAX_CYCLE_DEADLINE: Duration = Duration::from_secs(86_400);

type Busy = Arc<StdMutex<HashSet<String>>>;

pub struct Orchestrator {
    connections: Arc<ConnectionManager>,
    semaphore: Arc<Semaphore>,
    cycle_deadline: Duration,
    workers: JoinSet<Vec<Run>>,
    busy: Busy,
}

impl Orchestrator {
    /// Create an orchestrator running at most `max_parallel` devices at once
    pub fn new(connections: Arc<ConnectionManager>, max_parallel: usize) -> Self {
        let cycle_deadline = connections.settings().connect_timeout.min(MAX_CYCLE_DEADLINE);
        Self {
            connections,
            semaphore: Arc::new(Semaphore::new(max_parallel.max(1))),
            cycle_deadline,
            workers: JoinSet::new(),
            busy: Arc::new(StdMutex::new(HashSet::new())),
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Devices whose work from an earlier cycle has not finished yet
    pub fn busy_devices(&self) -> usize {
        self.busy.lock().map(|busy| busy.len()).unwrap_or(0)
    }

    /// Execute due pairs and return the runs finished by the deadline
    ///
    /// Failures become runs with `ok = false`; they never abort the cycle.
    /// Runs left over from earlier cycles are included once they finish.
    #[instrument(skip_all, fields(pairs = due.len()))]
    pub async fn run_cycle(&mut self, due: Vec<DuePair>) -> Vec<Run> {
        let mut runs = Vec::new();
        self.collect_finished(&mut runs);
        if due.is_empty() {
            return runs;
        }

        for (device, pairs) in group_by_device(due) {
            self.dispatch(device, pairs);
        }

        let deadline = Instant::now() + self.cycle_deadline;
        while !self.workers.is_empty() {
            match timeout_at(deadline, self.workers.join_next()).await {
                Ok(Some(joined)) => absorb(joined, &mut runs),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        busy = self.busy_devices(),
                        deadline_ms = self.cycle_deadline.as_millis() as u64,
                        "Cycle deadline reached; unfinished devices continue in the background"
                    );
                    break;
                }
            }
        }

        let failed = runs.iter().filter(|r| !r.ok).count();
        info!(runs = runs.len(), failed, "Cycle complete");
        runs
    }

    /// Wait up to the cycle deadline for background work, then abort it
    pub async fn drain(&mut self) -> Vec<Run> {
        let mut runs = Vec::new();
        if self.workers.is_empty() {
            return runs;
        }

        let deadline = Instant::now() + self.cycle_deadline;
        loop {
            match timeout_at(deadline, self.workers.join_next()).await {
                Ok(Some(joined)) => absorb(joined, &mut runs),
                Ok(None) => break,
                Err(_) => {
                    warn!(busy = self.busy_devices(), "Aborting unfinished device work");
                    self.workers.abort_all();
                    while self.workers.join_next().await.is_some() {}
                    break;
                }
            }
        }
        runs
    }

    fn collect_finished(&mut self, runs: &mut Vec<Run>) {
        while let Some(joined) = self.workers.try_join_next() {
            absorb(joined, runs);
        }
    }

    fn dispatch(&mut self, device: String, pairs: Vec<DuePair>) {
        let claimed = match self.busy.lock() {
            Ok(mut busy) => busy.insert(device.clone()),
            Err(e) => {
                error!(device = %device, error = %e, "Busy device set poisoned");
                false
            }
        };
        if !claimed {
            debug!(device = %device, skipped = pairs.len(), "Device still busy, skipping");
            return;
        }

        let connections = Arc::clone(&self.connections);
        let semaphore = Arc::clone(&self.semaphore);
        let guard = BusyGuard {
            busy: Arc::clone(&self.busy),
            device,
        };

        self.workers.spawn(async move {
            // Held until the task ends
            let guard = guard;
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(device = %guard.device, error = %e, "Worker pool closed");
                    return Vec::new();
                }
            };

            let mut runs = Vec::with_capacity(pairs.len());
            for pair in pairs {
                runs.push(execute_pair(&connections, &pair).await);
            }
            runs
        });
    }
}

/// Releases a device for dispatch when its task ends, aborted or not
struct BusyGuard {
    busy: Busy,
    device: String,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        if let Ok(mut busy) = self.busy.lock() {
            busy.remove(&self.device);
        }
    }
}

fn absorb(joined: Result<Vec<Run>, JoinError>, runs: &mut Vec<Run>) {
    match joined {
        Ok(device_runs) => runs.extend(device_runs),
        Err(e) if e.is_cancelled() => debug!("Device worker cancelled"),
        Err(e) => error!(error = %e, "Device worker panicked"),
    }
}

async fn execute_pair(connections: &ConnectionManager, pair: &DuePair) -> Run {
    let started_at = Utc::now();
    let command = &pair.command;
    let execution = connections.execute(&pair.device, &command.text).await;
    let duration_ms = execution.duration_ms();

    match execution.output {
        Ok(raw) => {
            let processed = process_output(&raw, &command.output_rules);
            debug!(
                device = %pair.device,
                command = %command.text,
                lines = processed.original_line_count,
                filtered = processed.is_filtered,
                truncated = processed.is_truncated,
                "Output processed"
            );
            Run::success(&pair.device, &command.text, started_at, duration_ms, processed)
        }
        Err(e) => Run::failure(
            &pair.device,
            &command.text,
            started_at,
            duration_ms,
            e.to_string(),
        ),
    }
}

/// Group pairs by device, keeping first-seen device order and per-device
/// pair order
fn group_by_device(due: Vec<DuePair>) -> Vec<(String, Vec<DuePair>)> {
    let mut groups: Vec<(String, Vec<DuePair>)> = Vec::new();
    for pair in due {
        match groups.iter_mut().find(|(device, _)| *device == pair.device) {
            Some((_, pairs)) => pairs.push(pair),
            None => groups.push((pair.device.clone(), vec![pair])),
        }
    }
    groups
}
