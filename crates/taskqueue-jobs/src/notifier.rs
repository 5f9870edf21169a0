use crate::error::Result;
use crate::job::{JobId, JobStatus};
use async_trait::async_trait;

/// External sink told about every Completed, Failed and DeadLetter
/// transition. Delivery is best effort: an error is logged by the dispatcher
/// and the already-persisted transition stands.
#[async_trait]
pub trait StatusNotifier: Send + Sync {
    async fn notify(&self, job_id: JobId, status: JobStatus) -> Result<()>;
}

/// Notifier that only emits a tracing event.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl StatusNotifier for LogNotifier {
    async fn notify(&self, job_id: JobId, status: JobStatus) -> Result<()> {
        tracing::info!(%job_id, %status, "job status changed");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl StatusNotifier for NoopNotifier {
    async fn notify(&self, _job_id: JobId, _status: JobStatus) -> Result<()> {
        Ok(())
    }
}
