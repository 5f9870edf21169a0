//! Retry decision and exponential backoff for failed executions.
//!
//! After a failed attempt a job either dead-letters (its `retry_count` has
//! reached `max_retries`) or is scheduled again at
//! `now + unit * 2^retry_count`, where `retry_count` is the value after the
//! increment. Re-dispatch happens only through a retry sweep.

use crate::error::Result;
use crate::job::JobRecord;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Scheduled for another attempt no earlier than `next_retry_time`.
    Retry { next_retry_time: DateTime<Utc> },
    /// Retry budget exhausted; the job is terminal.
    DeadLetter,
}

/// Configuration for retry backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Length of one backoff unit.
    pub unit: Duration,
    /// Optional cap on a single backoff. `None` lets it grow unbounded.
    pub max_backoff: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            unit: Duration::from_secs(1),
            max_backoff: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(unit: Duration) -> Self {
        Self {
            unit,
            max_backoff: None,
        }
    }

    /// Set the maximum backoff duration
    pub fn max_backoff(mut self, cap: Duration) -> Self {
        self.max_backoff = Some(cap);
        self
    }

    /// Backoff before attempt number `retry_count + 1`: `unit * 2^retry_count`.
    /// Only the final duration saturates, at `Duration::MAX`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let calculated = if self.unit.is_zero() {
            Duration::ZERO
        } else {
            2u128
                .checked_pow(retry_count)
                .and_then(|factor| self.unit.as_nanos().checked_mul(factor))
                .and_then(duration_from_nanos)
                .unwrap_or(Duration::MAX)
        };
        match self.max_backoff {
            Some(cap) => calculated.min(cap),
            None => calculated,
        }
    }

    /// Apply a failed attempt observed at `now` to an InProgress job.
    pub fn on_failure(&self, job: &mut JobRecord, now: DateTime<Utc>) -> Result<RetryDecision> {
        if !job.has_retries_left() {
            job.dead_letter()?;
            return Ok(RetryDecision::DeadLetter);
        }

        let delay = self.backoff(job.retry_count + 1);
        let next_retry_time = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        job.schedule_retry(next_retry_time)?;
        Ok(RetryDecision::Retry { next_retry_time })
    }
}

fn duration_from_nanos(nanos: u128) -> Option<Duration> {
    let secs = u64::try_from(nanos / 1_000_000_000).ok()?;
    Some(Duration::new(secs, (nanos % 1_000_000_000) as u32))
}
