//! Throughput gate for dispatch attempts.
//!
//! At most `max_attempts` attempts may start per `window`. Two policies:
//!
//! - [`RatePolicy::FixedWindow`]: a counter that resets once the window that
//!   opened with the first attempt has fully elapsed.
//! - [`RatePolicy::SlidingWindow`]: remembers the start time of the last
//!   `max_attempts` admissions, so no span of length `window` ever holds more
//!   than `max_attempts` of them.
//!
//! A refused caller is told how long to wait; nothing is ever dropped.
//!
//! # Example
//!
//! ```
//! use taskqueue_jobs::rate_limit::{RateDecision, RateLimiter};
//! use std::time::Duration;
//!
//! // Allow 10 dispatches per minute
//! let limiter = RateLimiter::new(10, Duration::from_secs(60));
//! assert_eq!(limiter.try_acquire(), RateDecision::Allowed);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Outcome of a [`RateLimiter::try_acquire`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// The attempt may start now and has been counted.
    Allowed,
    /// The budget is spent; retry after this long.
    Wait(Duration),
}

/// Admission policy of a [`RateLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RatePolicy {
    #[serde(alias = "fixed", alias = "fixed_window")]
    FixedWindow,
    #[default]
    #[serde(alias = "sliding", alias = "sliding_window")]
    SlidingWindow,
}

#[derive(Debug)]
enum State {
    Fixed { started: Option<Instant>, count: u32 },
    Sliding { admitted: VecDeque<Instant> },
}

/// Windowed rate limiter. Share it behind an `Arc`.
#[derive(Debug)]
pub struct RateLimiter {
    max_attempts: u32,
    window: Duration,
    state: Mutex<State>,
}

impl RateLimiter {
    /// Sliding-window limiter allowing `max_attempts` starts per `window`.
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self::with_policy(max_attempts, window, RatePolicy::SlidingWindow)
    }

    /// Fixed-window limiter allowing `max_attempts` starts per `window`.
    pub fn fixed(max_attempts: u32, window: Duration) -> Self {
        Self::with_policy(max_attempts, window, RatePolicy::FixedWindow)
    }

    pub fn with_policy(max_attempts: u32, window: Duration, policy: RatePolicy) -> Self {
        let state = match policy {
            RatePolicy::FixedWindow => State::Fixed {
                started: None,
                count: 0,
            },
            RatePolicy::SlidingWindow => State::Sliding {
                admitted: VecDeque::with_capacity(max_attempts as usize),
            },
        };
        Self {
            max_attempts,
            window,
            state: Mutex::new(state),
        }
    }

    /// Get the configured attempt budget per window.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Get the configured window duration.
    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn policy(&self) -> RatePolicy {
        match *self.lock() {
            State::Fixed { .. } => RatePolicy::FixedWindow,
            State::Sliding { .. } => RatePolicy::SlidingWindow,
        }
    }

    /// Count one attempt if the budget allows it.
    pub fn try_acquire(&self) -> RateDecision {
        let now = Instant::now();
        let window = self.window;
        let max = self.max_attempts;
        let mut state = self.lock();

        match &mut *state {
            State::Fixed { started, count } => {
                let opened = roll_fixed(started, count, now, window);
                if *count < max {
                    *count += 1;
                    RateDecision::Allowed
                } else {
                    let elapsed = now.saturating_duration_since(opened);
                    RateDecision::Wait(window.saturating_sub(elapsed))
                }
            }
            State::Sliding { admitted } => {
                evict_sliding(admitted, now, window);
                if (admitted.len() as u32) < max {
                    admitted.push_back(now);
                    RateDecision::Allowed
                } else {
                    let oldest = admitted.front().copied().unwrap_or(now);
                    let elapsed = now.saturating_duration_since(oldest);
                    RateDecision::Wait(window.saturating_sub(elapsed))
                }
            }
        }
    }

    /// Wait out refusals until an attempt is admitted. Returns how many
    /// times the caller had to wait.
    pub async fn acquire(&self) -> u32 {
        let mut waits = 0;
        while let RateDecision::Wait(delay) = self.try_acquire() {
            waits += 1;
            tokio::time::sleep(delay).await;
        }
        waits
    }

    /// Attempts that would be admitted right now.
    pub fn remaining(&self) -> u32 {
        let now = Instant::now();
        let window = self.window;
        let mut state = self.lock();

        let used = match &mut *state {
            State::Fixed { started, count } => {
                roll_fixed(started, count, now, window);
                *count
            }
            State::Sliding { admitted } => {
                evict_sliding(admitted, now, window);
                admitted.len() as u32
            }
        };
        self.max_attempts.saturating_sub(used)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Open a fresh window if none is open or the open one has expired.
fn roll_fixed(started: &mut Option<Instant>, count: &mut u32, now: Instant, window: Duration) -> Instant {
    match *started {
        Some(opened) if now.saturating_duration_since(opened) < window => opened,
        _ => {
            *started = Some(now);
            *count = 0;
            now
        }
    }
}

/// Forget admissions that fell out of the trailing window.
fn evict_sliding(admitted: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while admitted
        .front()
        .is_some_and(|&at| now.saturating_duration_since(at) >= window)
    {
        admitted.pop_front();
    }
}
