use crate::error::{JobError, Result};
use crate::job::{JobId, JobPriority, JobRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Runs the work behind a job. `Ok` completes the job; any `Err` counts as a
/// failed attempt and goes through the retry policy.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &JobRecord) -> Result<()>;
}

#[async_trait]
impl<E: JobExecutor + ?Sized> JobExecutor for Arc<E> {
    async fn execute(&self, job: &JobRecord) -> Result<()> {
        (**self).execute(job).await
    }
}

/// Adapts an async closure into a [`JobExecutor`].
pub struct FnExecutor<F>(pub F);

#[async_trait]
impl<F, Fut> JobExecutor for FnExecutor<F>
where
    F: Fn(JobRecord) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn execute(&self, job: &JobRecord) -> Result<()> {
        (self.0)(job.clone()).await
    }
}

/// Run `executor` with an optional deadline. Overrunning the deadline and
/// panicking both count as a failed attempt.
pub(crate) async fn execute_with_timeout(
    executor: &dyn JobExecutor,
    job: &JobRecord,
    timeout: Option<Duration>,
) -> Result<()> {
    let attempt = AssertUnwindSafe(executor.execute(job))
        .catch_unwind()
        .map(|outcome| {
            outcome.unwrap_or_else(|_| Err(JobError::Execution("executor panicked".to_string())))
        });

    match timeout {
        Some(limit) => tokio::time::timeout(limit, attempt)
            .await
            .unwrap_or(Err(JobError::Timeout(limit))),
        None => attempt.await,
    }
}

/// Context passed to job execution
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub attempt: u32,
    pub priority: JobPriority,
    pub created_at: DateTime<Utc>,
}

impl JobContext {
    fn for_record(job: &JobRecord) -> Self {
        Self {
            job_id: job.id,
            attempt: job.retry_count + 1,
            priority: job.priority,
            created_at: job.created_at,
        }
    }
}

/// A typed job handler, selected by its task name.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// The task name this handler serves
    const NAME: &'static str;

    /// The data required by the job, carried as JSON in `task_data`
    type Data: Serialize + DeserializeOwned + Send + Sync + Debug;

    /// Execute the job
    async fn execute(&self, ctx: JobContext, data: Self::Data) -> Result<()>;
}

/// A type-erased job handler
#[async_trait]
trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext, data: &str) -> Result<()>;
}

#[async_trait]
impl<J: Job> JobHandler for J {
    async fn handle(&self, ctx: JobContext, data: &str) -> Result<()> {
        let data: J::Data = serde_json::from_str(data)?;
        self.execute(ctx, data).await
    }
}

/// Executor that routes each job to the handler registered for its task name.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn JobHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job handler
    pub async fn register<J: Job>(&self, job: J) {
        let mut handlers = self.handlers.write().await;
        handlers.insert(J::NAME.to_string(), Arc::new(job));
    }

    pub async fn is_registered(&self, task_name: &str) -> bool {
        self.handlers.read().await.contains_key(task_name)
    }
}

#[async_trait]
impl JobExecutor for HandlerRegistry {
    async fn execute(&self, job: &JobRecord) -> Result<()> {
        let handler = self.handlers.read().await.get(&job.task_name).cloned();
        match handler {
            Some(handler) => handler.handle(JobContext::for_record(job), &job.task_data).await,
            None => Err(JobError::UnknownJobType(job.task_name.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::test_record;
    use serde::Deserialize;
    use std::sync::Mutex;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct EmailData {
        to: String,
    }

    #[derive(Clone, Default)]
    struct EmailJob {
        sent: Arc<Mutex<Vec<(String, u32)>>>,
    }

    #[async_trait]
    impl Job for EmailJob {
        const NAME: &'static str = "send_email";
        type Data = EmailData;

        async fn execute(&self, ctx: JobContext, data: Self::Data) -> Result<()> {
            self.sent.lock().unwrap().push((data.to, ctx.attempt));
            Ok(())
        }
    }

    fn email_record(data: &str) -> JobRecord {
        let mut job = test_record(JobPriority::Medium, Utc::now());
        job.task_name = EmailJob::NAME.to_string();
        job.task_data = data.to_string();
        job
    }

    #[tokio::test]
    async fn registry_routes_by_task_name() {
        let registry = HandlerRegistry::new();
        let email = EmailJob::default();
        registry.register(email.clone()).await;
        assert!(registry.is_registered("send_email").await);

        let mut job = email_record(r#"{"to":"user@example.com"}"#);
        job.retry_count = 2;
        registry.execute(&job).await.unwrap();

        let sent = email.sent.lock().unwrap();
        assert_eq!(sent.as_slice(), &[("user@example.com".to_string(), 3)]);
    }

    #[tokio::test]
    async fn unknown_task_name_fails() {
        let registry = HandlerRegistry::new();
        let job = email_record("{}");
        assert!(matches!(
            registry.execute(&job).await,
            Err(JobError::UnknownJobType(name)) if name == "send_email"
        ));
    }

    #[tokio::test]
    async fn malformed_payload_fails() {
        let registry = HandlerRegistry::new();
        registry.register(EmailJob::default()).await;
        let job = email_record("not json");
        assert!(matches!(
            registry.execute(&job).await,
            Err(JobError::Serialization(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn overrunning_executor_times_out() {
        let slow = FnExecutor(|_job: JobRecord| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<(), JobError>(())
        });
        let job = test_record(JobPriority::Low, Utc::now());
        let result = execute_with_timeout(&slow, &job, Some(Duration::from_secs(5))).await;
        assert!(matches!(result, Err(JobError::Timeout(d)) if d == Duration::from_secs(5)));

        assert!(execute_with_timeout(&slow, &job, None).await.is_ok());
    }

    #[tokio::test]
    async fn panicking_executor_is_a_failure() {
        let boom = FnExecutor(|job: JobRecord| async move {
            if job.retry_count == 0 {
                panic!("handler bug");
            }
            Ok::<(), JobError>(())
        });
        let job = test_record(JobPriority::High, Utc::now());
        assert!(matches!(
            execute_with_timeout(&boom, &job, None).await,
            Err(JobError::Execution(_))
        ));
    }
}
