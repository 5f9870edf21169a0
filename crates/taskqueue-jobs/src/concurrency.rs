//! Bound on the number of jobs executing at once.

use crate::error::{JobError, Result};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Slot-based concurrency limiter backed by a semaphore.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    slots: Arc<Semaphore>,
    max: usize,
}

/// A held execution slot. The slot is released when the permit is dropped,
/// whichever way the job's task exits.
#[derive(Debug)]
pub struct SlotPermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyLimiter {
    /// Limiter with `max` slots. A limiter without slots could never start
    /// anything, so `max` must be at least 1.
    pub fn new(max: usize) -> Result<Self> {
        if max == 0 {
            return Err(JobError::Config(
                "concurrency limit must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            slots: Arc::new(Semaphore::new(max)),
            max,
        })
    }

    /// Wait until a slot is free and take it.
    pub async fn acquire_slot(&self) -> SlotPermit {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .unwrap_or_else(|_| unreachable!("concurrency semaphore is never closed"));
        SlotPermit { _permit: permit }
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire_slot(&self) -> Option<SlotPermit> {
        self.slots
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| SlotPermit { _permit: permit })
    }

    /// Give a slot back explicitly.
    pub fn release_slot(&self, permit: SlotPermit) {
        drop(permit);
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.max - self.available()
    }
}
