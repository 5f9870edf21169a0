//! In-process background job dispatch.
//!
//! Jobs are persisted through a [`JobStore`], queued by priority, and
//! dispatched by a [`Dispatcher`] under two simultaneous limits: at most N
//! attempts started per time window and at most M jobs executing at once.
//! Failed attempts are retried with exponential backoff until the job's
//! retry budget is spent, after which it is dead-lettered.
//!
//! # Example
//!
//! ```no_run
//! use taskqueue_jobs::{DispatchConfig, Dispatcher, FnExecutor, InMemoryStore, JobRecord, NewJob};
//!
//! # async fn run() -> taskqueue_jobs::Result<()> {
//! let executor = FnExecutor(|job: JobRecord| async move {
//!     println!("running {}", job.task_name);
//!     Ok::<(), taskqueue_jobs::JobError>(())
//! });
//! let dispatcher = Dispatcher::new(InMemoryStore::new(), executor, &DispatchConfig::default())?;
//!
//! dispatcher.submit(NewJob::new("send_email", r#"{"to":"a@b.c"}"#)).await?;
//! let report = dispatcher.drain().await?;
//! assert_eq!(report.completed, 1);
//! # Ok(())
//! # }
//! ```

pub mod concurrency;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod job;
pub mod notifier;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod service;
pub mod store;

pub use concurrency::{ConcurrencyLimiter, SlotPermit};
pub use config::{DispatchConfig, Environment};
pub use dispatcher::{Dispatcher, DrainReport};
pub use error::{JobError, Result};
pub use executor::{FnExecutor, HandlerRegistry, Job, JobContext, JobExecutor};
pub use job::{JobId, JobPriority, JobRecord, JobStatus, NewJob};
pub use notifier::{LogNotifier, NoopNotifier, StatusNotifier};
pub use queue::DispatchQueue;
pub use rate_limit::{RateDecision, RateLimiter, RatePolicy};
pub use retry::{RetryDecision, RetryPolicy};
pub use service::{JobService, JobStats};
pub use store::memory::InMemoryStore;
pub use store::{CreateJob, JobStore};

#[cfg(feature = "postgres")]
pub use store::postgres::PostgresStore;
