use crate::error::Result;
use crate::job::{JobId, JobPriority, JobRecord, NewJob};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

/// A submission with every default applied, ready to be persisted.
#[derive(Debug, Clone)]
pub struct CreateJob {
    pub task_name: String,
    pub task_data: String,
    pub priority: JobPriority,
    pub max_retries: u32,
}

impl CreateJob {
    pub fn from_new(job: NewJob, default_priority: JobPriority, default_max_retries: u32) -> Self {
        Self {
            task_name: job.task_name,
            task_data: job.task_data,
            priority: job.priority.unwrap_or(default_priority),
            max_retries: job.max_retries.unwrap_or(default_max_retries),
        }
    }
}

/// Durable storage for job records. The store is the source of truth for
/// status; the dispatcher only holds scheduling copies.
///
/// Implementations serialize their own per-row updates. The dispatcher never
/// relies on multi-row transactions.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new Pending record and return it with its assigned id.
    async fn create(&self, job: CreateJob) -> Result<JobRecord>;

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>>;

    /// Every record, newest first.
    async fn list_all(&self) -> Result<Vec<JobRecord>>;

    /// Pending records ordered by priority, then creation time.
    async fn list_pending(&self) -> Result<Vec<JobRecord>>;

    /// Failed records due at `now` with retry budget left, ordered by
    /// priority, then creation time.
    async fn list_retriable_failed(&self, now: DateTime<Utc>) -> Result<Vec<JobRecord>>;

    /// Replace the mutable fields of an existing record.
    async fn update(&self, job: &JobRecord) -> Result<()>;

    async fn is_reachable(&self) -> bool;
}

/// Dispatch order shared by every store listing.
pub(crate) fn dispatch_order(a: &JobRecord, b: &JobRecord) -> std::cmp::Ordering {
    a.priority
        .cmp(&b.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
}
