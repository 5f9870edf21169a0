use crate::job::{JobId, JobStatus};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job store unavailable")]
    StoreUnavailable,

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job {id}: illegal transition from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {id} cannot be queued while {status}")]
    InvalidState { id: JobId, status: JobStatus },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Job serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl JobError {
    /// Whether this error means the store could not be reached or written.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, JobError::StoreUnavailable | JobError::Backend(_))
    }
}

pub type Result<T> = std::result::Result<T, JobError>;
