//! Bounded pool of forwarder slots
//!
//! Every logical connection needs two slots, one per forwarding direction.
//! When the pool is full, `acquire` polls for headroom a bounded number of
//! times and then fails; it never waits indefinitely.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::debug;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Worker pool exhausted: {requested} slots unavailable after {attempts} attempts")]
    Exhausted { requested: u32, attempts: u32 },

    #[error("Worker pool closed")]
    Closed,
}

/// Slots held by one logical connection; released on drop
pub type PoolSlots = OwnedSemaphorePermit;

#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    retry_attempts: u32,
    retry_interval: Duration,
}

impl WorkerPool {
    pub fn new(capacity: usize, retry_attempts: u32, retry_interval: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            retry_attempts,
            retry_interval,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots not currently held
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Reserve `slots` slots, retrying while the pool is saturated
    pub async fn acquire(&self, slots: u32) -> Result<PoolSlots, PoolError> {
        let attempts = self.retry_attempts + 1;

        for attempt in 1..=attempts {
            match self.semaphore.clone().try_acquire_many_owned(slots) {
                Ok(permit) => return Ok(permit),
                Err(TryAcquireError::Closed) => return Err(PoolError::Closed),
                Err(TryAcquireError::NoPermits) => {
                    if attempt < attempts {
                        debug!(
                            "Worker pool saturated ({} of {} free), retry {}/{}",
                            self.available(),
                            self.capacity,
                            attempt,
                            self.retry_attempts
                        );
                        tokio::time::sleep(self.retry_interval).await;
                    }
                }
            }
        }

        Err(PoolError::Exhausted {
            requested: slots,
            attempts,
        })
    }

    /// Reject all future acquisitions
    pub fn close(&self) {
        self.semaphore.close();
    }
}
