//! Command scheduling, execution fan-out and liveness probing

pub mod cadence;
pub mod liveness;
pub mod orchestrator;
pub mod schedule;

pub use cadence::Cadence;
pub use liveness::{LivenessMonitor, ProbeTarget};
pub use orchestrator::Orchestrator;
pub use schedule::{DuePair, PairSchedule, ScheduleBook, Scheduler, Tick, MAX_SLEEP, MIN_SLEEP};
