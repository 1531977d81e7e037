//! TCP readiness probe.
//!
//! Polls an endpoint with connect-and-close attempts until one is accepted or
//! the wait budget runs out. Each attempt's socket is dropped before the next
//! attempt starts, whether it connected or not.

use prox_common::{connect_within, HarnessError, HarnessResult, SharedSink, TracingSink};
use serde::{Deserialize, Serialize};
use std::net::ToSocketAddrs;
use std::time::{Duration, Instant};
use tracing::trace;

/// Lower bound for a single connect attempt; zero timeouts are rejected by the OS layer.
const MIN_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(1);

/// Polling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessConfig {
    /// Delay between the start of consecutive attempts.
    pub poll_interval: Duration,
    /// Total budget before giving up.
    pub max_wait: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_wait: Duration::from_secs(10),
        }
    }
}

/// Outcome of a successful probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReport {
    pub attempts: u32,
    pub elapsed: Duration,
}

/// The seam a scenario uses to wait for its proxy.
pub trait ReadinessCheck {
    fn wait_until_ready(&self, host: &str, port: u16) -> HarnessResult<ProbeReport>;
}

/// Polls a TCP endpoint until it accepts a connection.
pub struct ReadinessProbe {
    config: ReadinessConfig,
    sink: SharedSink,
}

impl ReadinessProbe {
    pub fn new(config: ReadinessConfig, sink: SharedSink) -> Self {
        Self { config, sink }
    }

    pub fn config(&self) -> ReadinessConfig {
        self.config
    }
}

impl ReadinessCheck for ReadinessProbe {
    fn wait_until_ready(&self, host: &str, port: u16) -> HarnessResult<ProbeReport> {
        let target = format!("{}:{}", host, port);
        let started = Instant::now();
        let deadline = started + self.config.max_wait;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let attempt_started = Instant::now();
            let remaining = deadline.saturating_duration_since(attempt_started);
            let attempt_timeout = self
                .config
                .poll_interval
                .min(remaining)
                .max(MIN_ATTEMPT_TIMEOUT);

            match try_connect(host, port, attempt_timeout) {
                Ok(()) => {
                    let report = ProbeReport {
                        attempts,
                        elapsed: started.elapsed(),
                    };
                    self.sink.info(
                        "endpoint_ready",
                        &format!("{} accepted a connection after {} attempt(s), {:?}", target, attempts, report.elapsed),
                    );
                    return Ok(report);
                }
                Err(reason) => {
                    self.sink.debug(
                        "probe_attempt_failed",
                        &format!("{} attempt {}: {}", target, attempts, reason),
                    );
                }
            }

            let now = Instant::now();
            if now >= deadline {
                let elapsed = started.elapsed();
                self.sink.warn(
                    "endpoint_not_ready",
                    &format!("{} not accepting connections after {} attempt(s), {:?}", target, attempts, elapsed),
                );
                return Err(HarnessError::timeout(target, "wait until ready", elapsed));
            }

            let next_attempt = (attempt_started + self.config.poll_interval).min(deadline);
            let pause = next_attempt.saturating_duration_since(now);
            if !pause.is_zero() {
                std::thread::sleep(pause);
            }
        }
    }
}

/// One-shot probe with the default sink.
pub fn wait_until_ready(
    host: &str,
    port: u16,
    poll_interval: Duration,
    max_wait: Duration,
) -> HarnessResult<ProbeReport> {
    let probe = ReadinessProbe::new(
        ReadinessConfig {
            poll_interval,
            max_wait,
        },
        TracingSink::shared("readiness"),
    );
    probe.wait_until_ready(host, port)
}

/// Connect to any resolved address of `host:port` and close immediately.
///
/// Resolution and all connects share `timeout`.
fn try_connect(host: &str, port: u16, timeout: Duration) -> Result<(), String> {
    let started = Instant::now();
    let addrs: Vec<_> = (host, port)
        .to_socket_addrs()
        .map_err(|e| format!("resolve failed: {}", e))?
        .collect();

    let remaining = timeout.saturating_sub(started.elapsed()).max(MIN_ATTEMPT_TIMEOUT);
    let stream = connect_within(addrs, remaining).map_err(|e| e.to_string())?;
    trace!("Probe connected to {:?}", stream.peer_addr());
    Ok(())
}
