//! Pacing between gateway sessions
//!
//! Once a session ends for a reason other than shutdown or bad credentials,
//! the agent waits here before dialing the gateway again. The pause grows
//! geometrically per failed session, is capped, and goes back to the initial
//! value as soon as a session reaches dispatching.

use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Pause after the first session that failed
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Growth per failed session; anything below 1.0 or not finite keeps the pause flat
    pub multiplier: f64,
    /// Failed sessions in a row before the agent stops (None = never)
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconnectError {
    #[error("Gateway unreachable after {0} sessions in a row")]
    MaxAttemptsReached(usize),

    #[error("Agent shut down while waiting for the gateway")]
    Cancelled,
}

/// Failed sessions since the last dispatching one, and the pause before the next
pub struct SessionBackoff {
    policy: ReconnectPolicy,
    current_backoff: Duration,
    attempt: usize,
}

impl SessionBackoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            current_backoff: policy.initial_backoff.min(policy.max_backoff),
            policy,
            attempt: 0,
        }
    }

    /// Pause before the next session, unless the agent is shutting down
    pub async fn wait(&mut self, shutdown: &CancellationToken) -> Result<(), ReconnectError> {
        self.attempt += 1;

        if let Some(limit) = self.policy.max_attempts {
            if self.attempt > limit {
                return Err(ReconnectError::MaxAttemptsReached(limit));
            }
        }

        debug!(
            session = self.attempt,
            "Next gateway session in {:?}", self.current_backoff
        );

        tokio::select! {
            _ = shutdown.cancelled() => return Err(ReconnectError::Cancelled),
            _ = tokio::time::sleep(self.current_backoff) => {}
        }

        self.current_backoff = self.grown(self.current_backoff);
        Ok(())
    }

    fn grown(&self, pause: Duration) -> Duration {
        let factor = self.policy.multiplier;
        if !factor.is_finite() || factor <= 1.0 {
            return pause;
        }
        let secs = pause.as_secs_f64() * factor;
        let cap = self.policy.max_backoff;
        if secs >= cap.as_secs_f64() {
            cap
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// A session reached dispatching; the next failure starts from scratch
    pub fn reset(&mut self) {
        if self.attempt > 0 {
            debug!(failed_sessions = self.attempt, "Gateway session healthy again");
        }
        self.current_backoff = self.policy.initial_backoff.min(self.policy.max_backoff);
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}
