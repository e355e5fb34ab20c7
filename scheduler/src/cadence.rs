//! Command cadence: fixed interval or cron expression

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::time::Duration;

use nwwatch_core::{Command, Error, Result};

/// How often a command runs
#[derive(Debug, Clone)]
pub enum Cadence {
    /// Every N seconds after the previous attempt
    Interval(Duration),
    /// At every fire time of a cron expression (UTC)
    Cron(Box<Schedule>),
}

impl Cadence {
    /// Cadence of a command, falling back to the global interval
    pub fn for_command(command: &Command, default_interval: Duration) -> Result<Self> {
        match (&command.schedule, command.interval_seconds) {
            (Some(_), Some(_)) => Err(Error::ConfigError(format!(
                "Command '{}' sets both schedule and interval_seconds",
                command.text
            ))),
            (Some(expr), None) => Self::cron(expr),
            (None, Some(secs)) => Ok(Cadence::Interval(Duration::from_secs(secs))),
            (None, None) => Ok(Cadence::Interval(default_interval)),
        }
    }

    /// Parse a 5-field (minute-first) or 6/7-field (second-first) expression
    pub fn cron(expr: &str) -> Result<Self> {
        let normalized = normalize_cron(expr);
        let schedule = Schedule::from_str(&normalized)
            .map_err(|e| Error::ConfigError(format!("Invalid cron expression '{}': {}", expr, e)))?;
        Ok(Cadence::Cron(Box::new(schedule)))
    }

    /// First time a pair with this cadence is due
    ///
    /// Interval commands run straight away; cron commands wait for their
    /// next fire time.
    pub fn first_due(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Cadence::Interval(_) => Some(now),
            Cadence::Cron(schedule) => schedule.after(&now).next(),
        }
    }

    /// Next due time after an attempt at `attempted_at`
    pub fn next_after(&self, attempted_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Cadence::Interval(interval) => {
                let step = ChronoDuration::from_std(*interval).ok()?;
                attempted_at.checked_add_signed(step)
            }
            Cadence::Cron(schedule) => schedule.after(&attempted_at).next(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Cadence::Interval(interval) => format!("every {}s", interval.as_secs()),
            Cadence::Cron(schedule) => format!("cron '{}'", schedule),
        }
    }
}

/// Prefix a seconds field onto classic 5-field expressions
fn normalize_cron(expr: &str) -> String {
    let trimmed = expr.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_normalize_five_field() {
        assert_eq!(normalize_cron("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron("  0 0 * * * *  "), "0 0 * * * *");
    }

    #[test]
    fn test_interval_due_immediately_then_every_step() {
        let cadence = Cadence::Interval(Duration::from_secs(5));
        let now = at(10, 0, 0);
        assert_eq!(cadence.first_due(now), Some(now));
        assert_eq!(cadence.next_after(now), Some(at(10, 0, 5)));
    }

    #[test]
    fn test_cron_waits_for_next_fire() {
        let cadence = Cadence::cron("*/15 * * * *").unwrap();
        let first = cadence.first_due(at(10, 7, 30)).unwrap();
        assert_eq!(first, at(10, 15, 0));
        let next = cadence.next_after(first).unwrap();
        assert_eq!(next.minute(), 30);
    }

    #[test]
    fn test_invalid_cron_is_config_error() {
        let err = Cadence::cron("not a cron").unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn test_for_command_precedence() {
        let default = Duration::from_secs(5);

        let plain = Command::new("show version");
        assert!(matches!(
            Cadence::for_command(&plain, default).unwrap(),
            Cadence::Interval(d) if d == default
        ));

        let mut slow = Command::new("show tech");
        slow.interval_seconds = Some(60);
        assert!(matches!(
            Cadence::for_command(&slow, default).unwrap(),
            Cadence::Interval(d) if d == Duration::from_secs(60)
        ));

        let mut both = Command::new("show clock");
        both.interval_seconds = Some(10);
        both.schedule = Some("* * * * *".to_string());
        assert!(Cadence::for_command(&both, default).is_err());
    }
}
