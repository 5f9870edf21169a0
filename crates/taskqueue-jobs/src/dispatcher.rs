use crate::concurrency::{ConcurrencyLimiter, SlotPermit};
use crate::config::DispatchConfig;
use crate::error::{JobError, Result};
use crate::executor::{execute_with_timeout, JobExecutor};
use crate::job::{JobPriority, JobRecord, NewJob};
use crate::notifier::{LogNotifier, StatusNotifier};
use crate::queue::DispatchQueue;
use crate::rate_limit::{RateDecision, RateLimiter};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::{CreateJob, JobStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinSet;

/// How a dispatched job settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Completed,
    Retried,
    DeadLettered,
}

/// Tally of one drain cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Jobs moved to InProgress and handed to the executor.
    pub dispatched: usize,
    pub completed: usize,
    /// Failures that were scheduled for another attempt.
    pub retried: usize,
    pub dead_lettered: usize,
    /// Times the rate limiter sent a job back to the queue.
    pub rate_limited: usize,
    /// Executed jobs whose outcome could not be persisted. The outcome is
    /// held and written again at the start of the next cycle.
    pub settle_errors: usize,
    /// Held outcomes from earlier cycles that were persisted in this one.
    /// They are also counted as completed, retried or dead-lettered.
    pub recovered: usize,
}

impl DrainReport {
    /// Add another cycle's counts to this one.
    pub fn absorb(&mut self, other: DrainReport) {
        self.dispatched += other.dispatched;
        self.completed += other.completed;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.rate_limited += other.rate_limited;
        self.settle_errors += other.settle_errors;
        self.recovered += other.recovered;
    }

    fn record(&mut self, settled: Settled) {
        match settled {
            Settled::Completed => self.completed += 1,
            Settled::Retried => self.retried += 1,
            Settled::DeadLettered => self.dead_lettered += 1,
        }
    }
}

/// The dispatch engine: a priority queue drained under a rate limit and a
/// concurrency bound, with retry scheduling for failed attempts.
///
/// Cloning is cheap and every clone shares the same queue and limiters.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    executor: Arc<dyn JobExecutor>,
    notifier: Arc<dyn StatusNotifier>,
    queue: Arc<DispatchQueue>,
    rate_limiter: Arc<RateLimiter>,
    concurrency: ConcurrencyLimiter,
    retry_policy: RetryPolicy,
    execution_timeout: Option<Duration>,
    default_priority: JobPriority,
    default_max_retries: u32,
    /// Settled jobs whose outcome the store refused, still claimed in `queue`.
    held: Arc<Mutex<Vec<(JobRecord, Settled)>>>,
}

impl Dispatcher {
    /// Create a dispatcher over a store and an executor
    pub fn new<S, E>(store: S, executor: E, config: &DispatchConfig) -> Result<Self>
    where
        S: JobStore + 'static,
        E: JobExecutor + 'static,
    {
        Self::from_shared(Arc::new(store), Arc::new(executor), config)
    }

    /// Like [`new`](Self::new), for collaborators that are already shared.
    pub fn from_shared(
        store: Arc<dyn JobStore>,
        executor: Arc<dyn JobExecutor>,
        config: &DispatchConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            executor,
            notifier: Arc::new(LogNotifier),
            queue: Arc::new(DispatchQueue::new()),
            rate_limiter: Arc::new(config.rate_limiter()),
            concurrency: ConcurrencyLimiter::new(config.max_concurrent_jobs)?,
            retry_policy: config.retry_policy(),
            execution_timeout: config.timeout(),
            default_priority: config.default_priority,
            default_max_retries: config.default_max_retries,
            held: Arc::default(),
        })
    }

    pub fn with_notifier<N: StatusNotifier + 'static>(mut self, notifier: N) -> Self {
        self.notifier = Arc::new(notifier);
        self
    }

    /// Replace the rate limiter, e.g. to share one budget between dispatchers.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = limiter;
        self
    }

    pub fn with_concurrency_limiter(mut self, limiter: ConcurrencyLimiter) -> Self {
        self.concurrency = limiter;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn concurrency_limiter(&self) -> &ConcurrencyLimiter {
        &self.concurrency
    }

    /// Outcomes executed but not yet persisted.
    pub fn unsaved_outcomes(&self) -> usize {
        self.held().len()
    }

    /// Persist a new Pending job and queue it for dispatch.
    ///
    /// Fails with [`JobError::StoreUnavailable`] without creating anything
    /// when the store cannot be reached.
    pub async fn submit(&self, job: NewJob) -> Result<JobRecord> {
        job.validate()?;
        if !self.store.is_reachable().await {
            tracing::error!(task_name = %job.task_name, "store unreachable, submission rejected");
            return Err(JobError::StoreUnavailable);
        }

        let request = CreateJob::from_new(job, self.default_priority, self.default_max_retries);
        let record = self.store.create(request).await?;
        self.queue.push(record.clone())?;

        tracing::info!(
            job_id = %record.id,
            task_name = %record.task_name,
            priority = %record.priority,
            max_retries = record.max_retries,
            "job submitted"
        );
        Ok(record)
    }

    /// Queue every Pending job in the store. Returns how many were added.
    pub async fn collect_pending(&self) -> Result<usize> {
        let pending = self.store.list_pending().await?;
        self.enqueue_all(pending)
    }

    /// Queue every Failed job whose retry is due at `now`. Returns how many
    /// were added.
    pub async fn collect_retriable(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.store.list_retriable_failed(now).await?;
        self.enqueue_all(due)
    }

    /// Collect Pending jobs, then drain.
    pub async fn process_pending(&self) -> Result<DrainReport> {
        let added = self.collect_pending().await?;
        tracing::debug!(added, "collected pending jobs");
        self.drain().await
    }

    /// Collect Failed jobs due for retry, then drain.
    pub async fn process_failed(&self) -> Result<DrainReport> {
        let added = self.collect_retriable(Utc::now()).await?;
        tracing::debug!(added, "collected retriable jobs");
        self.drain().await
    }

    /// Dispatch queued jobs until the queue is observed empty, then wait for
    /// every dispatched job to settle.
    ///
    /// Outcomes held from an earlier cycle are written first. A store
    /// failure while starting a job ends the cycle: that job keeps its stored
    /// state for a later sweep, jobs already running still settle, and the
    /// error is returned.
    pub async fn drain(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        self.persist_held(&mut report).await;
        let mut running: JoinSet<Result<Settled>> = JoinSet::new();
        let mut aborted = None;

        loop {
            if self.queue.is_empty() {
                break;
            }
            // The slot comes first so a rate admission is followed by an
            // immediate start.
            let slot = self.concurrency.acquire_slot().await;
            let Some(job) = self.queue.pop() else {
                break;
            };

            if let RateDecision::Wait(delay) = self.rate_limiter.try_acquire() {
                report.rate_limited += 1;
                tracing::debug!(
                    job_id = %job.id,
                    wait_ms = delay.as_millis() as u64,
                    "rate limit reached, job requeued"
                );
                drop(slot);
                if let Err(err) = self.queue.requeue(job) {
                    aborted = Some(err);
                    break;
                }
                tokio::time::sleep(delay).await;
                continue;
            }

            let id = job.id;
            match self.start(job).await {
                Ok(started) => {
                    report.dispatched += 1;
                    let this = self.clone();
                    running.spawn(async move { this.run(started, slot).await });
                }
                Err(err) => {
                    self.queue.release(id);
                    if err.is_store_failure() {
                        tracing::error!(job_id = %id, error = %err, "store failure while starting job, ending drain");
                    } else {
                        tracing::warn!(job_id = %id, error = %err, "job no longer dispatchable, ending drain");
                    }
                    aborted = Some(err);
                    break;
                }
            }
        }

        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(Ok(settled)) => report.record(settled),
                Ok(Err(err)) => {
                    report.settle_errors += 1;
                    tracing::error!(error = %err, "could not persist job outcome, holding it for the next cycle");
                }
                Err(err) => {
                    report.settle_errors += 1;
                    tracing::error!(error = %err, "job task did not finish");
                }
            }
        }

        match aborted {
            Some(err) => Err(err),
            None => {
                tracing::info!(
                    dispatched = report.dispatched,
                    completed = report.completed,
                    retried = report.retried,
                    dead_lettered = report.dead_lettered,
                    "drain cycle finished"
                );
                Ok(report)
            }
        }
    }

    fn enqueue_all(&self, jobs: Vec<JobRecord>) -> Result<usize> {
        let mut added = 0;
        for job in jobs {
            if self.queue.push(job)? {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Re-read the job from the store and persist it as InProgress.
    async fn start(&self, queued: JobRecord) -> Result<JobRecord> {
        let mut job = self
            .store
            .get(queued.id)
            .await?
            .ok_or(JobError::NotFound(queued.id))?;
        if !job.is_dispatchable() {
            return Err(JobError::InvalidState {
                id: job.id,
                status: job.status,
            });
        }

        job.start()?;
        self.store.update(&job).await?;

        tracing::info!(
            job_id = %job.id,
            task_name = %job.task_name,
            priority = %job.priority,
            attempt = job.retry_count + 1,
            "job dispatched"
        );
        Ok(job)
    }

    /// Execute a started job and persist its outcome. The slot is held until
    /// this returns.
    async fn run(self, mut job: JobRecord, slot: SlotPermit) -> Result<Settled> {
        let _slot = slot;
        let outcome =
            execute_with_timeout(self.executor.as_ref(), &job, self.execution_timeout).await;

        let settled = match self.settle(&mut job, outcome) {
            Ok(settled) => settled,
            Err(err) => {
                self.queue.release(job.id);
                return Err(err);
            }
        };

        if let Err(err) = self.store.update(&job).await {
            // The claim stays, so no sweep queues the job again meanwhile.
            self.hold(vec![(job, settled)]);
            return Err(err);
        }
        self.queue.release(job.id);
        self.announce(&job).await;
        Ok(settled)
    }

    /// Write held outcomes, keeping whatever the store still refuses.
    async fn persist_held(&self, report: &mut DrainReport) {
        let held = std::mem::take(&mut *self.held());
        let mut pending = held.into_iter();

        while let Some((job, settled)) = pending.next() {
            match self.store.update(&job).await {
                Ok(()) => {
                    self.queue.release(job.id);
                    report.recovered += 1;
                    report.record(settled);
                    tracing::info!(job_id = %job.id, status = %job.status, "held job outcome persisted");
                    self.announce(&job).await;
                }
                Err(err) => {
                    tracing::warn!(job_id = %job.id, error = %err, "held job outcome still not persisted");
                    let mut rest = vec![(job, settled)];
                    rest.extend(pending);
                    self.hold(rest);
                    break;
                }
            }
        }
    }

    fn hold(&self, outcomes: Vec<(JobRecord, Settled)>) {
        self.held().extend(outcomes);
    }

    fn held(&self) -> MutexGuard<'_, Vec<(JobRecord, Settled)>> {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn announce(&self, job: &JobRecord) {
        if let Err(err) = self.notifier.notify(job.id, job.status).await {
            tracing::warn!(job_id = %job.id, status = %job.status, error = %err, "status notification failed");
        }
    }

    fn settle(&self, job: &mut JobRecord, outcome: Result<()>) -> Result<Settled> {
        let err = match outcome {
            Ok(()) => {
                job.complete()?;
                tracing::info!(job_id = %job.id, "job completed");
                return Ok(Settled::Completed);
            }
            Err(err) => err,
        };

        match self.retry_policy.on_failure(job, Utc::now())? {
            RetryDecision::Retry { next_retry_time } => {
                tracing::warn!(
                    job_id = %job.id,
                    retry_count = job.retry_count,
                    max_retries = job.max_retries,
                    %next_retry_time,
                    error = %err,
                    "job failed, retry scheduled"
                );
                Ok(Settled::Retried)
            }
            RetryDecision::DeadLetter => {
                tracing::warn!(
                    job_id = %job.id,
                    retry_count = job.retry_count,
                    error = %err,
                    "job failed, retries exhausted, moved to dead letter"
                );
                Ok(Settled::DeadLettered)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::FnExecutor;
    use crate::job::{JobId, JobStatus};
    use crate::notifier::NoopNotifier;
    use crate::store::memory::InMemoryStore;
    use crate::concurrency::ConcurrencyLimiter;
    use crate::store::CreateJob;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn succeed() -> FnExecutor<impl Fn(JobRecord) -> futures_util::future::Ready<Result<()>>> {
        FnExecutor(|_job: JobRecord| futures_util::future::ready(Ok(())))
    }

    fn fail() -> FnExecutor<impl Fn(JobRecord) -> futures_util::future::Ready<Result<()>>> {
        FnExecutor(|_job: JobRecord| {
            futures_util::future::ready(Err(JobError::Execution("boom".to_string())))
        })
    }

    #[derive(Clone, Default)]
    struct RecordingNotifier {
        seen: Arc<Mutex<Vec<(JobId, JobStatus)>>>,
        fail: bool,
    }

    #[async_trait]
    impl StatusNotifier for RecordingNotifier {
        async fn notify(&self, job_id: JobId, status: JobStatus) -> Result<()> {
            self.seen.lock().unwrap().push((job_id, status));
            if self.fail {
                return Err(JobError::Notification("sink down".to_string()));
            }
            Ok(())
        }
    }

    /// Store that refuses to write the first `refusals` Completed records.
    #[derive(Clone)]
    struct RefusingStore {
        inner: InMemoryStore,
        refusals: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl JobStore for RefusingStore {
        async fn create(&self, job: CreateJob) -> Result<JobRecord> {
            self.inner.create(job).await
        }

        async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
            self.inner.get(id).await
        }

        async fn list_all(&self) -> Result<Vec<JobRecord>> {
            self.inner.list_all().await
        }

        async fn list_pending(&self) -> Result<Vec<JobRecord>> {
            self.inner.list_pending().await
        }

        async fn list_retriable_failed(&self, now: DateTime<Utc>) -> Result<Vec<JobRecord>> {
            self.inner.list_retriable_failed(now).await
        }

        async fn update(&self, job: &JobRecord) -> Result<()> {
            let refuse = job.status == JobStatus::Completed
                && self
                    .refusals
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
            if refuse {
                return Err(JobError::StoreUnavailable);
            }
            self.inner.update(job).await
        }

        async fn is_reachable(&self) -> bool {
            self.inner.is_reachable().await
        }
    }

    #[tokio::test]
    async fn empty_drain_is_a_no_op() {
        let dispatcher =
            Dispatcher::new(InMemoryStore::new(), succeed(), &DispatchConfig::default()).unwrap();
        let report = dispatcher.drain().await.unwrap();
        assert_eq!(report, DrainReport::default());
        assert_eq!(dispatcher.drain().await.unwrap(), DrainReport::default());
    }

    #[tokio::test]
    async fn successful_job_completes_and_notifies() {
        let store = InMemoryStore::new();
        let notifier = RecordingNotifier::default();
        let dispatcher = Dispatcher::new(store.clone(), succeed(), &DispatchConfig::default())
            .unwrap()
            .with_notifier(notifier.clone());

        let job = dispatcher.submit(NewJob::new("email", "{}")).await.unwrap();
        let report = dispatcher.drain().await.unwrap();

        assert_eq!(report.dispatched, 1);
        assert_eq!(report.completed, 1);
        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(
            notifier.seen.lock().unwrap().as_slice(),
            &[(job.id, JobStatus::Completed)]
        );
        assert_eq!(dispatcher.queue().claimed(), 0);
        assert_eq!(dispatcher.concurrency_limiter().in_flight(), 0);
    }

    #[tokio::test]
    async fn failure_schedules_retry_without_requeueing() {
        let store = InMemoryStore::new();
        let dispatcher = Dispatcher::new(store.clone(), fail(), &DispatchConfig::default())
            .unwrap()
            .with_notifier(NoopNotifier);

        let job = dispatcher.submit(NewJob::new("email", "{}")).await.unwrap();
        let before = Utc::now();
        let report = dispatcher.drain().await.unwrap();
        assert_eq!(report.retried, 1);
        assert!(dispatcher.queue().is_empty());

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.retry_count, 1);
        let next = stored.next_retry_time.unwrap();
        assert!(next >= before + chrono::Duration::seconds(2));
    }

    #[tokio::test]
    async fn notification_failure_keeps_transition() {
        let store = InMemoryStore::new();
        let notifier = RecordingNotifier {
            fail: true,
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(store.clone(), succeed(), &DispatchConfig::default())
            .unwrap()
            .with_notifier(notifier.clone());

        let job = dispatcher.submit(NewJob::new("email", "{}")).await.unwrap();
        let report = dispatcher.drain().await.unwrap();

        assert_eq!(report.completed, 1);
        assert_eq!(report.settle_errors, 0);
        assert_eq!(notifier.seen.lock().unwrap().len(), 1);
        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn unreachable_store_rejects_submission() {
        let store = InMemoryStore::new();
        let dispatcher =
            Dispatcher::new(store.clone(), succeed(), &DispatchConfig::default()).unwrap();
        store.set_reachable(false);

        let result = dispatcher.submit(NewJob::new("email", "{}")).await;
        assert!(matches!(result, Err(JobError::StoreUnavailable)));

        store.set_reachable(true);
        assert!(store.is_empty());
        assert!(dispatcher.queue().is_empty());
    }

    #[tokio::test]
    async fn store_outage_while_draining_leaves_job_pending() {
        let store = InMemoryStore::new();
        let dispatcher =
            Dispatcher::new(store.clone(), succeed(), &DispatchConfig::default()).unwrap();
        let job = dispatcher.submit(NewJob::new("email", "{}")).await.unwrap();

        store.set_reachable(false);
        assert!(matches!(
            dispatcher.drain().await,
            Err(JobError::StoreUnavailable)
        ));
        store.set_reachable(true);

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);

        // the next sweep picks it up again
        assert_eq!(dispatcher.collect_pending().await.unwrap(), 1);
        assert_eq!(dispatcher.drain().await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn unsaved_outcome_is_written_on_a_later_cycle() {
        let memory = InMemoryStore::new();
        let store = RefusingStore {
            inner: memory.clone(),
            refusals: Arc::new(AtomicUsize::new(2)),
        };
        let notifier = RecordingNotifier::default();
        let dispatcher = Dispatcher::new(store, succeed(), &DispatchConfig::default())
            .unwrap()
            .with_notifier(notifier.clone());
        let job = dispatcher.submit(NewJob::new("email", "{}")).await.unwrap();

        let first = dispatcher.drain().await.unwrap();
        assert_eq!(first.dispatched, 1);
        assert_eq!(first.settle_errors, 1);
        assert_eq!(first.completed, 0);
        let stored = memory.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::InProgress);
        assert_eq!(dispatcher.unsaved_outcomes(), 1);
        assert_eq!(dispatcher.queue().claimed(), 1);
        assert!(notifier.seen.lock().unwrap().is_empty());

        // still refused: the outcome stays held and nothing runs again
        let second = dispatcher.process_pending().await.unwrap();
        assert_eq!(second, DrainReport::default());
        assert_eq!(dispatcher.unsaved_outcomes(), 1);

        let third = dispatcher.process_failed().await.unwrap();
        assert_eq!(third.recovered, 1);
        assert_eq!(third.completed, 1);
        assert_eq!(third.dispatched, 0);
        let stored = memory.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(dispatcher.unsaved_outcomes(), 0);
        assert_eq!(dispatcher.queue().claimed(), 0);
        assert_eq!(
            notifier.seen.lock().unwrap().as_slice(),
            &[(job.id, JobStatus::Completed)]
        );
    }

    #[tokio::test]
    async fn empty_drain_does_not_wait_for_a_slot() {
        let limiter = ConcurrencyLimiter::new(1).unwrap();
        let dispatcher = Dispatcher::new(InMemoryStore::new(), succeed(), &DispatchConfig::default())
            .unwrap()
            .with_concurrency_limiter(limiter.clone());

        let _busy = limiter.acquire_slot().await;
        let report = tokio::time::timeout(Duration::from_secs(2), dispatcher.drain())
            .await
            .expect("empty drain returns while every slot is taken")
            .unwrap();
        assert_eq!(report, DrainReport::default());
    }

    #[tokio::test]
    async fn invalid_submission_is_rejected_before_the_store() {
        let store = InMemoryStore::new();
        let dispatcher =
            Dispatcher::new(store.clone(), succeed(), &DispatchConfig::default()).unwrap();
        assert!(matches!(
            dispatcher.submit(NewJob::new("", "{}")).await,
            Err(JobError::Validation(_))
        ));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn submission_defaults_come_from_config() {
        let config = DispatchConfig::default()
            .default_priority(JobPriority::Low)
            .default_max_retries(7);
        let dispatcher = Dispatcher::new(InMemoryStore::new(), succeed(), &config).unwrap();

        let defaulted = dispatcher.submit(NewJob::new("a", "")).await.unwrap();
        assert_eq!(defaulted.priority, JobPriority::Low);
        assert_eq!(defaulted.max_retries, 7);

        let explicit = dispatcher
            .submit(NewJob::new("b", "").priority(JobPriority::High).max_retries(1))
            .await
            .unwrap();
        assert_eq!(explicit.priority, JobPriority::High);
        assert_eq!(explicit.max_retries, 1);
    }

    #[tokio::test]
    async fn collect_pending_does_not_duplicate_queued_jobs() {
        let store = InMemoryStore::new();
        let dispatcher =
            Dispatcher::new(store.clone(), succeed(), &DispatchConfig::default()).unwrap();
        dispatcher.submit(NewJob::new("a", "")).await.unwrap();
        dispatcher.submit(NewJob::new("b", "")).await.unwrap();

        assert_eq!(dispatcher.collect_pending().await.unwrap(), 0);
        assert_eq!(dispatcher.queue().len(), 2);
        assert_eq!(dispatcher.process_pending().await.unwrap().dispatched, 2);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = DispatchConfig::default().max_concurrent_jobs(0);
        assert!(matches!(
            Dispatcher::new(InMemoryStore::new(), succeed(), &config),
            Err(JobError::Config(_))
        ));
    }
}
