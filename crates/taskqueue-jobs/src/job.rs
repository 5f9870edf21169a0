use crate::error::{JobError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier assigned by the [`JobStore`](crate::store::JobStore) on creation.
pub type JobId = Uuid;

/// Longest accepted task name.
pub const MAX_TASK_NAME_LEN: usize = 255;

/// Largest accepted retry budget; retry counters are stored as signed
/// 32-bit integers.
pub const MAX_RETRIES_LIMIT: u32 = i32::MAX as u32;

/// Dispatch priority. Variants are declared in dispatch order, so the derived
/// `Ord` puts `High` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum JobPriority {
    #[serde(alias = "high", alias = "HIGH")]
    High,
    #[default]
    #[serde(alias = "medium", alias = "MEDIUM")]
    Medium,
    #[serde(alias = "low", alias = "LOW")]
    Low,
}

impl JobPriority {
    pub const ALL: [JobPriority; 3] = [JobPriority::High, JobPriority::Medium, JobPriority::Low];

    /// Rank used for ordering: High=0, Medium=1, Low=2.
    pub fn rank(self) -> u8 {
        match self {
            JobPriority::High => 0,
            JobPriority::Medium => 1,
            JobPriority::Low => 2,
        }
    }

    pub fn from_rank(rank: u8) -> Option<Self> {
        Self::ALL.get(rank as usize).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobPriority::High => "high",
            JobPriority::Medium => "medium",
            JobPriority::Low => "low",
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobPriority {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(JobPriority::High),
            "medium" => Ok(JobPriority::Medium),
            "low" => Ok(JobPriority::Low),
            other => Err(JobError::Validation(format!("unknown priority '{}'", other))),
        }
    }
}

/// Lifecycle state of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    DeadLetter,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::InProgress,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::DeadLetter,
    ];

    /// Completed and DeadLetter never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::DeadLetter)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::DeadLetter => "dead_letter",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| JobError::Validation(format!("unknown status '{}'", s)))
    }
}

/// A job submission, before the store has assigned an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub task_name: String,
    pub task_data: String,
    #[serde(default)]
    pub priority: Option<JobPriority>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl NewJob {
    pub fn new(task_name: impl Into<String>, task_data: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            task_data: task_data.into(),
            priority: None,
            max_retries: None,
        }
    }

    pub fn priority(mut self, priority: JobPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.task_name.trim().is_empty() {
            return Err(JobError::Validation("task name must not be empty".to_string()));
        }
        if self.task_name.chars().count() > MAX_TASK_NAME_LEN {
            return Err(JobError::Validation(format!(
                "task name exceeds {} characters",
                MAX_TASK_NAME_LEN
            )));
        }
        if self.max_retries.is_some_and(|n| n > MAX_RETRIES_LIMIT) {
            return Err(JobError::Validation(format!(
                "max_retries exceeds {}",
                MAX_RETRIES_LIMIT
            )));
        }
        Ok(())
    }
}

/// The unit of work and its dispatch state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub task_name: String,
    pub task_data: String,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub next_retry_time: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Build a fresh Pending record. Stores call this from `create`.
    pub fn pending(
        id: JobId,
        task_name: String,
        task_data: String,
        priority: JobPriority,
        max_retries: u32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_name,
            task_data,
            priority,
            status: JobStatus::Pending,
            retry_count: 0,
            max_retries,
            created_at,
            next_retry_time: None,
        }
    }

    /// Pending jobs, and Failed jobs awaiting another attempt, may be queued.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Failed)
    }

    /// Failed, due at `now`, and still inside its retry budget.
    pub fn is_retry_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Failed
            && self.retry_count <= self.max_retries
            && self.next_retry_time.is_some_and(|at| at <= now)
    }

    /// Whether another failure still leaves a retry.
    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub(crate) fn start(&mut self) -> Result<()> {
        self.transition(JobStatus::InProgress, self.is_dispatchable())?;
        self.next_retry_time = None;
        Ok(())
    }

    pub(crate) fn complete(&mut self) -> Result<()> {
        self.transition(JobStatus::Completed, self.status == JobStatus::InProgress)
    }

    pub(crate) fn schedule_retry(&mut self, at: DateTime<Utc>) -> Result<()> {
        let allowed = self.status == JobStatus::InProgress && self.has_retries_left();
        self.transition(JobStatus::Failed, allowed)?;
        self.retry_count += 1;
        self.next_retry_time = Some(at);
        Ok(())
    }

    pub(crate) fn dead_letter(&mut self) -> Result<()> {
        self.transition(JobStatus::DeadLetter, self.status == JobStatus::InProgress)?;
        self.next_retry_time = None;
        Ok(())
    }

    fn transition(&mut self, to: JobStatus, allowed: bool) -> Result<()> {
        if !allowed {
            return Err(JobError::InvalidTransition {
                id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_record(priority: JobPriority, created_at: DateTime<Utc>) -> JobRecord {
    JobRecord::pending(
        Uuid::new_v4(),
        "test".to_string(),
        String::new(),
        priority,
        3,
        created_at,
    )
}
