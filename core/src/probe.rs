//! Reachability probes

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::{Error, Result};

/// Probes one target for reachability
#[async_trait]
pub trait Prober: Send + Sync {
    /// Round-trip time in milliseconds when reachable (if the probe reports
    /// one); an error when the target did not answer
    async fn probe(&self, target: &str) -> Result<Option<f64>>;
}

/// ICMP echo through the system `ping` binary
///
/// Targets are trusted: they are validated against an allow-list when the
/// configuration is loaded and passed as a single argv entry, never through
/// a shell.
#[derive(Debug, Clone)]
pub struct SystemPing {
    /// Overall budget for one probe
    pub timeout: Duration,
}

impl Default for SystemPing {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
        }
    }
}

#[async_trait]
impl Prober for SystemPing {
    #[instrument(skip(self))]
    async fn probe(&self, target: &str) -> Result<Option<f64>> {
        let child = tokio::process::Command::new("ping")
            .args(["-c", "1", "-W", "1", target])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| {
                Error::TimeoutError(format!(
                    "Ping timed out after {}s",
                    self.timeout.as_secs_f64()
                ))
            })??;

        if !output.status.success() {
            return Err(Error::ConnectionError("Ping failed".to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let rtt = parse_rtt(&stdout);
        debug!(target = %target, rtt_ms = ?rtt, "Ping reply");
        Ok(rtt)
    }
}

/// Extract the first `time=<ms>` value from ping output
pub fn parse_rtt(output: &str) -> Option<f64> {
    output.lines().find_map(|line| {
        let (_, rest) = line.split_once("time=")?;
        let value = rest.split_whitespace().next()?;
        value.trim_end_matches("ms").parse::<f64>().ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rtt_linux() {
        let output = "PING 10.0.0.1 (10.0.0.1) 56(84) bytes of data.\n\
                      64 bytes from 10.0.0.1: icmp_seq=1 ttl=64 time=0.045 ms\n";
        assert_eq!(parse_rtt(output), Some(0.045));
    }

    #[test]
    fn test_parse_rtt_attached_unit() {
        assert_eq!(parse_rtt("64 bytes from x: icmp_seq=0 time=12ms"), Some(12.0));
    }

    #[test]
    fn test_parse_rtt_missing() {
        assert_eq!(parse_rtt("1 packets transmitted, 1 received"), None);
        assert_eq!(parse_rtt("time=abc ms"), None);
    }
}
