//! Dispatcher configuration with environment variable support.
//!
//! Every field can be set through a `TASKQUEUE_`-prefixed environment
//! variable (`TASKQUEUE_MAX_CONCURRENT_JOBS=8`, `TASKQUEUE_WINDOW_MS=30000`,
//! ...). A `.env` file in the working directory is loaded first.
//!
//! # Example
//!
//! ```
//! use taskqueue_jobs::DispatchConfig;
//!
//! let config = DispatchConfig::default()
//!     .max_concurrent_jobs(8)
//!     .max_jobs_per_window(100);
//! assert!(config.validate().is_ok());
//! ```

use crate::error::{JobError, Result};
use crate::job::{JobPriority, MAX_RETRIES_LIMIT};
use crate::rate_limit::{RateLimiter, RatePolicy};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Prefix for every configuration variable.
pub const ENV_PREFIX: &str = "TASKQUEUE_";

/// Tunables for a [`Dispatcher`](crate::Dispatcher).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Jobs allowed to execute at once.
    pub max_concurrent_jobs: usize,
    /// Dispatch attempts allowed per rate window.
    pub max_jobs_per_window: u32,
    /// Rate window length in milliseconds.
    pub window_ms: u64,
    /// How the rate window is measured.
    pub rate_policy: RatePolicy,
    /// One backoff unit in milliseconds.
    pub backoff_unit_ms: u64,
    /// Optional cap on a single backoff, in milliseconds.
    pub max_backoff_ms: Option<u64>,
    /// Optional execution deadline in milliseconds.
    pub execution_timeout_ms: Option<u64>,
    /// Retry budget for submissions that do not name one.
    pub default_max_retries: u32,
    /// Priority for submissions that do not name one.
    pub default_priority: JobPriority,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 3,
            max_jobs_per_window: 10,
            window_ms: 60_000,
            rate_policy: RatePolicy::default(),
            backoff_unit_ms: 1_000,
            max_backoff_ms: None,
            execution_timeout_ms: None,
            default_max_retries: 3,
            default_priority: JobPriority::Medium,
        }
    }
}

impl DispatchConfig {
    /// Load `.env`, then read `TASKQUEUE_*` variables over the defaults.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let config: Self = envy::prefixed(ENV_PREFIX)
            .from_env()
            .map_err(|e| JobError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read configuration from explicit `(KEY, value)` pairs, using the same
    /// `TASKQUEUE_` names as [`from_env`](Self::from_env).
    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Self = envy::prefixed(ENV_PREFIX)
            .from_iter(vars)
            .map_err(|e| JobError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_jobs == 0 {
            return Err(JobError::Config(
                "max_concurrent_jobs must be at least 1".to_string(),
            ));
        }
        if self.max_jobs_per_window == 0 {
            return Err(JobError::Config(
                "max_jobs_per_window must be at least 1".to_string(),
            ));
        }
        if self.default_max_retries > MAX_RETRIES_LIMIT {
            return Err(JobError::Config(format!(
                "default_max_retries must not exceed {}",
                MAX_RETRIES_LIMIT
            )));
        }
        if self.window_ms == 0 {
            return Err(JobError::Config("window_ms must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn max_concurrent_jobs(mut self, n: usize) -> Self {
        self.max_concurrent_jobs = n;
        self
    }

    pub fn max_jobs_per_window(mut self, n: u32) -> Self {
        self.max_jobs_per_window = n;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.window_ms = ceil_millis(window);
        self
    }

    pub fn rate_policy(mut self, policy: RatePolicy) -> Self {
        self.rate_policy = policy;
        self
    }

    pub fn backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit_ms = ceil_millis(unit);
        self
    }

    pub fn max_backoff(mut self, cap: Duration) -> Self {
        self.max_backoff_ms = Some(ceil_millis(cap));
        self
    }

    pub fn execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout_ms = Some(ceil_millis(timeout));
        self
    }

    pub fn default_max_retries(mut self, n: u32) -> Self {
        self.default_max_retries = n;
        self
    }

    pub fn default_priority(mut self, priority: JobPriority) -> Self {
        self.default_priority = priority;
        self
    }

    pub fn window_duration(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.execution_timeout_ms.map(Duration::from_millis)
    }

    pub fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::with_policy(
            self.max_jobs_per_window,
            self.window_duration(),
            self.rate_policy,
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::new(Duration::from_millis(self.backoff_unit_ms));
        match self.max_backoff_ms {
            Some(cap) => policy.max_backoff(Duration::from_millis(cap)),
            None => policy,
        }
    }
}

/// Whole milliseconds, rounding a partial millisecond up so that a non-zero
/// duration never turns into zero.
fn ceil_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos().div_ceil(1_000_000)).unwrap_or(u64::MAX)
}

/// Deployment profile, read from `TASKQUEUE_ENV`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Custom(String),
}

impl Environment {
    /// Detect the current environment from `TASKQUEUE_ENV`.
    ///
    /// "production"/"prod" and "development"/"dev" map to their variants,
    /// unset means development, anything else is `Custom`.
    pub fn current() -> Self {
        match std::env::var("TASKQUEUE_ENV").as_deref() {
            Ok("production") | Ok("prod") => Self::Production,
            Ok("development") | Ok("dev") | Err(_) => Self::Development,
            Ok(other) => Self::Custom(other.to_string()),
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Custom(name) => name,
        }
    }

    /// Get the default log level for this environment.
    pub fn default_log_level(&self) -> &'static str {
        match self {
            Self::Development => "debug",
            Self::Production | Self::Custom(_) => "info",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
