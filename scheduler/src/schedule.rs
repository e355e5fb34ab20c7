//! Per-pair due tracking

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use nwwatch_core::{Command, ControlState, Result};

use crate::cadence::Cadence;

/// Shortest and longest loop sleep
pub const MIN_SLEEP: Duration = Duration::from_secs(1);
pub const MAX_SLEEP: Duration = Duration::from_secs(60);

/// A (device, command) pair selected for this tick
#[derive(Debug, Clone)]
pub struct DuePair {
    pub device: String,
    pub command: Arc<Command>,
}

/// Timing of one (device, command) pair
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairSchedule {
    /// None when the cadence has no future fire time
    pub next_due: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
}

/// Explicit map of per-pair timing, keyed by (device index, command index)
#[derive(Debug, Clone, Default)]
pub struct ScheduleBook {
    entries: HashMap<(usize, usize), PairSchedule>,
}

impl ScheduleBook {
    pub fn get(&self, device: usize, command: usize) -> Option<&PairSchedule> {
        self.entries.get(&(device, command))
    }

    fn set(&mut self, device: usize, command: usize, entry: PairSchedule) {
        self.entries.insert((device, command), entry);
    }

    fn earliest(&self) -> Option<DateTime<Utc>> {
        self.entries.values().filter_map(|e| e.next_due).min()
    }
}

/// What the command loop should do this tick
#[derive(Debug)]
pub enum Tick {
    /// Shutdown requested; stop after in-flight work
    Shutdown,
    /// Commands paused; nothing becomes due
    Paused,
    /// Pairs to dispatch, possibly none
    Due(Vec<DuePair>),
}

struct ScheduledCommand {
    command: Arc<Command>,
    cadence: Cadence,
}

/// Decides which pairs are due on each tick
pub struct Scheduler {
    devices: Vec<String>,
    commands: Vec<ScheduledCommand>,
    default_interval: Duration,
    book: ScheduleBook,
}

impl Scheduler {
    /// Build the schedule, seeding every pair's first due time from `now`
    pub fn new(
        devices: Vec<String>,
        commands: Vec<Command>,
        default_interval: Duration,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let mut scheduled = Vec::with_capacity(commands.len());
        for command in commands {
            let cadence = Cadence::for_command(&command, default_interval)?;
            info!(
                command = %command.text,
                cadence = %cadence.describe(),
                "Command scheduled"
            );
            scheduled.push(ScheduledCommand {
                command: Arc::new(command),
                cadence,
            });
        }

        let mut book = ScheduleBook::default();
        for d in 0..devices.len() {
            for (c, sc) in scheduled.iter().enumerate() {
                book.set(
                    d,
                    c,
                    PairSchedule {
                        next_due: sc.cadence.first_due(now),
                        last_attempt: None,
                    },
                );
            }
        }

        Ok(Self {
            devices,
            commands: scheduled,
            default_interval,
            book,
        })
    }

    pub fn book(&self) -> &ScheduleBook {
        &self.book
    }

    /// Read control state once and select due work
    ///
    /// Selected pairs are marked attempted at `now`. While paused nothing is
    /// marked, so overdue pairs run as soon as commands resume.
    pub fn tick(&mut self, now: DateTime<Utc>, control: &ControlState) -> Tick {
        if control.shutdown_requested {
            return Tick::Shutdown;
        }
        if control.commands_paused {
            return Tick::Paused;
        }
        Tick::Due(self.take_due(now))
    }

    /// Pairs whose next due time has passed, grouped by device in
    /// configuration order
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<DuePair> {
        let mut due = Vec::new();
        for (d, device) in self.devices.iter().enumerate() {
            for (c, sc) in self.commands.iter().enumerate() {
                let Some(entry) = self.book.entries.get_mut(&(d, c)) else {
                    continue;
                };
                match entry.next_due {
                    Some(next) if next <= now => {
                        entry.last_attempt = Some(now);
                        entry.next_due = sc.cadence.next_after(now);
                        due.push(DuePair {
                            device: device.clone(),
                            command: Arc::clone(&sc.command),
                        });
                    }
                    _ => {}
                }
            }
        }

        if !due.is_empty() {
            debug!(pairs = due.len(), "Pairs due");
        }
        due
    }

    /// Earliest upcoming due time across all pairs
    pub fn next_wake(&self) -> Option<DateTime<Utc>> {
        self.book.earliest()
    }

    /// How long the command loop should sleep
    ///
    /// Until the earliest due time, clamped to [1s, 60s]; the global
    /// interval when nothing is scheduled.
    pub fn sleep_duration(&self, now: DateTime<Utc>) -> Duration {
        match self.next_wake() {
            None => self.default_interval,
            Some(next) => {
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                wait.clamp(MIN_SLEEP, MAX_SLEEP)
            }
        }
    }
}
