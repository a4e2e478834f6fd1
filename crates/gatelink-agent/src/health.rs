//! Health-check sub-protocol
//!
//! The agent pings the gateway every `interval` and answers the gateway's own
//! pings. Any successful exchange counts as proof of life. When nothing
//! succeeds for `interval * max_missed`, the monitor runs its failure
//! callback, which closes the transport and so ends the dispatch loop.

use gatelink_proto::{
    Frame, FrameType, HealthCheck, HealthCheckResponse, HealthCheckSettings, ResultCode,
};
use gatelink_transport::{FrameSender, HandlerError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Longest interval accepted from the gateway or local config
pub const MAX_INTERVAL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthCheckConfig {
    pub interval: Duration,
    pub max_missed: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_missed: 3,
        }
    }
}

impl HealthCheckConfig {
    /// Settings chosen by the gateway at registration
    pub fn from_settings(settings: HealthCheckSettings) -> Self {
        Self::from_parts(settings.interval_secs, settings.max_missed)
    }

    /// Interval clamped to `1..=MAX_INTERVAL_SECS`, at least one miss
    pub fn from_parts(interval_secs: u64, max_missed: u32) -> Self {
        Self {
            interval: Duration::from_secs(interval_secs.clamp(1, MAX_INTERVAL_SECS)),
            max_missed: max_missed.max(1),
        }
    }

    /// How long the session may go without a successful exchange
    pub fn deadline(&self) -> Duration {
        self.interval.saturating_mul(self.max_missed.max(1))
    }
}

struct MonitorState {
    /// Set by any successful exchange, cleared by the monitor on each tick
    succeeded: AtomicBool,
    /// Shared with the agent; true while the session is healthy
    healthy: Arc<AtomicBool>,
    next_nonce: AtomicU64,
}

#[derive(Clone)]
pub struct HealthMonitor {
    state: Arc<MonitorState>,
    sender: FrameSender,
    config: HealthCheckConfig,
}

impl HealthMonitor {
    pub fn new(sender: FrameSender, config: HealthCheckConfig, healthy: Arc<AtomicBool>) -> Self {
        Self {
            state: Arc::new(MonitorState {
                succeeded: AtomicBool::new(false),
                healthy,
                next_nonce: AtomicU64::new(rand::random()),
            }),
            sender,
            config,
        }
    }

    pub fn config(&self) -> HealthCheckConfig {
        self.config
    }

    pub fn is_healthy(&self) -> bool {
        self.state.healthy.load(Ordering::Relaxed)
    }

    fn record_success(&self) {
        self.state.succeeded.store(true, Ordering::Relaxed);
    }

    /// Handler for `HealthCheckResponse` frames
    pub fn handle_response(&self, frame: Frame) -> Result<(), HandlerError> {
        let response: HealthCheckResponse = frame.message()?;
        if response.result.is_ok() {
            trace!(nonce = response.nonce, "Health check answered");
            self.record_success();
        } else {
            warn!(
                nonce = response.nonce,
                "Gateway reported unhealthy: {:?}", response.result
            );
        }
        Ok(())
    }

    /// Handler for gateway-initiated `HealthCheck` frames
    pub fn handle_request(&self, frame: Frame) -> Result<(), HandlerError> {
        let request: HealthCheck = frame.message()?;
        self.record_success();
        self.sender.send_message(
            FrameType::HealthCheckResponse,
            &HealthCheckResponse {
                nonce: request.nonce,
                result: ResultCode::Ok,
            },
        )?;
        Ok(())
    }

    /// Start the periodic exchange. `on_failure` runs at most once.
    pub fn spawn<F>(&self, on_failure: F) -> JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.state.healthy.store(true, Ordering::Relaxed);
        let monitor = self.clone();
        tokio::spawn(async move { monitor.run(on_failure).await })
    }

    async fn run<F>(self, on_failure: F)
    where
        F: FnOnce(),
    {
        let deadline = self.config.deadline();
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_success = Instant::now();

        debug!(
            interval = ?self.config.interval,
            max_missed = self.config.max_missed,
            "Health monitor started"
        );

        loop {
            ticker.tick().await;

            if self.state.succeeded.swap(false, Ordering::Relaxed) {
                last_success = Instant::now();
            } else if last_success.elapsed() >= deadline {
                warn!(
                    "No successful health check within {:?}, failing session",
                    deadline
                );
                self.state.healthy.store(false, Ordering::Relaxed);
                on_failure();
                return;
            }

            let nonce = self.state.next_nonce.fetch_add(1, Ordering::Relaxed);
            if self
                .sender
                .send_message(FrameType::HealthCheck, &HealthCheck { nonce })
                .is_err()
            {
                debug!("Transport gone, health monitor stopping");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_is_interval_times_missed() {
        let config = HealthCheckConfig {
            interval: Duration::from_secs(10),
            max_missed: 3,
        };
        assert_eq!(config.deadline(), Duration::from_secs(30));
    }

    #[test]
    fn test_server_settings_are_clamped() {
        let config = HealthCheckConfig::from_settings(HealthCheckSettings {
            interval_secs: 0,
            max_missed: 0,
        });
        assert_eq!(config.interval, Duration::from_secs(1));
        assert_eq!(config.max_missed, 1);
    }

    #[test]
    fn test_huge_server_interval_is_capped() {
        let config = HealthCheckConfig::from_settings(HealthCheckSettings {
            interval_secs: u64::MAX,
            max_missed: u32::MAX,
        });
        assert_eq!(config.interval, Duration::from_secs(MAX_INTERVAL_SECS));
        assert_eq!(
            config.deadline(),
            Duration::from_secs(MAX_INTERVAL_SECS * u32::MAX as u64)
        );

        let unclamped = HealthCheckConfig {
            interval: Duration::MAX,
            max_missed: 3,
        };
        assert_eq!(unclamped.deadline(), Duration::MAX);
    }
}
