//! Submission, trigger, and stats operations over a [`Dispatcher`].
//!
//! Triggers are fire-and-forget: they move jobs from the store into the
//! queue and make sure one background drain is running. A trigger that
//! arrives while a drain is running only enqueues; the running drain picks
//! the new jobs up.

use crate::dispatcher::Dispatcher;
use crate::error::{JobError, Result};
use crate::job::{JobId, JobRecord, JobStatus, NewJob};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Job counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub total_jobs: usize,
    pub pending_jobs: usize,
    pub in_progress_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub dead_letter_jobs: usize,
}

impl JobStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a JobRecord>) -> Self {
        let mut stats = Self::default();
        for record in records {
            stats.total_jobs += 1;
            match record.status {
                JobStatus::Pending => stats.pending_jobs += 1,
                JobStatus::InProgress => stats.in_progress_jobs += 1,
                JobStatus::Completed => stats.completed_jobs += 1,
                JobStatus::Failed => stats.failed_jobs += 1,
                JobStatus::DeadLetter => stats.dead_letter_jobs += 1,
            }
        }
        stats
    }

    /// Jobs that may still be dispatched again.
    pub fn unsettled(&self) -> usize {
        self.pending_jobs + self.in_progress_jobs + self.failed_jobs
    }
}

#[derive(Clone)]
pub struct JobService {
    dispatcher: Dispatcher,
    draining: Arc<watch::Sender<bool>>,
}

impl JobService {
    pub fn new(dispatcher: Dispatcher) -> Self {
        let (draining, _) = watch::channel(false);
        Self {
            dispatcher,
            draining: Arc::new(draining),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub async fn submit(&self, job: NewJob) -> Result<JobRecord> {
        self.dispatcher.submit(job).await
    }

    /// Submit jobs in order, stopping at the first failure.
    pub async fn submit_batch(&self, jobs: Vec<NewJob>) -> Result<Vec<JobRecord>> {
        let mut created = Vec::with_capacity(jobs.len());
        for job in jobs {
            created.push(self.dispatcher.submit(job).await?);
        }
        Ok(created)
    }

    /// Queue every Pending job and make sure a drain is running. Returns how
    /// many jobs were newly queued.
    pub async fn trigger_processing(&self) -> Result<usize> {
        let added = self.dispatcher.collect_pending().await?;
        self.ensure_draining();
        Ok(added)
    }

    /// Queue every Failed job due for retry and make sure a drain is running.
    pub async fn trigger_retry_failed(&self) -> Result<usize> {
        let added = self.dispatcher.collect_retriable(Utc::now()).await?;
        self.ensure_draining();
        Ok(added)
    }

    pub fn is_draining(&self) -> bool {
        *self.draining.borrow()
    }

    /// Wait until no background drain is running.
    pub async fn wait_idle(&self) {
        let mut idle = self.draining.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = idle.wait_for(|running| !*running).await;
    }

    /// All jobs, newest first.
    pub async fn list_jobs(&self) -> Result<Vec<JobRecord>> {
        self.dispatcher.store().list_all().await
    }

    pub async fn get_job(&self, id: JobId) -> Result<JobRecord> {
        self.dispatcher
            .store()
            .get(id)
            .await?
            .ok_or(JobError::NotFound(id))
    }

    pub async fn stats(&self) -> Result<JobStats> {
        let jobs = self.dispatcher.store().list_all().await?;
        Ok(JobStats::from_records(&jobs))
    }

    /// Trigger a retry sweep every `interval` until the handle is aborted.
    pub fn spawn_retry_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match service.trigger_retry_failed().await {
                    Ok(0) => {}
                    Ok(added) => tracing::debug!(added, "retry sweep queued jobs"),
                    Err(err) => tracing::error!(error = %err, "retry sweep failed"),
                }
            }
        })
    }

    fn ensure_draining(&self) {
        if !claim(&self.draining) {
            return;
        }

        let dispatcher = self.dispatcher.clone();
        let draining = self.draining.clone();
        tokio::spawn(async move {
            loop {
                let result = dispatcher.drain().await;
                if let Err(err) = &result {
                    tracing::error!(error = %err, "background drain failed");
                }
                draining.send_replace(false);

                // A trigger may have queued jobs after the last pop but before
                // the flag cleared; go again unless another drain took over.
                if result.is_err() || dispatcher.queue().is_empty() || !claim(&draining) {
                    break;
                }
            }
        });
    }
}

/// Flip the draining flag from false to true. Returns whether this caller
/// won the flip.
fn claim(draining: &watch::Sender<bool>) -> bool {
    draining.send_if_modified(|running| {
        if *running {
            false
        } else {
            *running = true;
            true
        }
    })
}
