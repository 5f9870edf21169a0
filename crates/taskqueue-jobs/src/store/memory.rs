use super::{dispatch_order, CreateJob, JobStore};
use crate::error::{JobError, Result};
use crate::job::{JobId, JobRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

/// In-memory job store (not persistent, for testing/dev)
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    jobs: Arc<RwLock<HashMap<JobId, JobRecord>>>,
    reachable: Arc<AtomicBool>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self {
            jobs: Arc::default(),
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store going away. While unreachable every operation
    /// fails with [`JobError::StoreUnavailable`].
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.jobs.read().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, JobRecord>>> {
        self.check_reachable()?;
        self.jobs
            .read()
            .map_err(|_| JobError::Backend("Lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, JobRecord>>> {
        self.check_reachable()?;
        self.jobs
            .write()
            .map_err(|_| JobError::Backend("Lock poisoned".to_string()))
    }

    fn check_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(JobError::StoreUnavailable)
        }
    }

    fn select(&self, filter: impl Fn(&JobRecord) -> bool) -> Result<Vec<JobRecord>> {
        let mut selected: Vec<JobRecord> =
            self.read()?.values().filter(|job| filter(job)).cloned().collect();
        selected.sort_by(dispatch_order);
        Ok(selected)
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn create(&self, job: CreateJob) -> Result<JobRecord> {
        let record = JobRecord::pending(
            Uuid::new_v4(),
            job.task_name,
            job.task_data,
            job.priority,
            job.max_retries,
            Utc::now(),
        );
        self.write()?.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn list_all(&self) -> Result<Vec<JobRecord>> {
        let mut all: Vec<JobRecord> = self.read()?.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }

    async fn list_pending(&self) -> Result<Vec<JobRecord>> {
        self.select(|job| job.status == crate::job::JobStatus::Pending)
    }

    async fn list_retriable_failed(&self, now: DateTime<Utc>) -> Result<Vec<JobRecord>> {
        self.select(|job| job.is_retry_due(now))
    }

    async fn update(&self, job: &JobRecord) -> Result<()> {
        let mut jobs = self.write()?;
        match jobs.get_mut(&job.id) {
            Some(stored) => {
                *stored = job.clone();
                Ok(())
            }
            None => Err(JobError::NotFound(job.id)),
        }
    }

    async fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobPriority, JobStatus};
    use chrono::Duration;

    fn create(name: &str, priority: JobPriority) -> CreateJob {
        CreateJob {
            task_name: name.to_string(),
            task_data: String::new(),
            priority,
            max_retries: 3,
        }
    }

    #[tokio::test]
    async fn pending_listing_is_in_dispatch_order() {
        let store = InMemoryStore::new();
        let low = store.create(create("a", JobPriority::Low)).await.unwrap();
        let high = store.create(create("b", JobPriority::High)).await.unwrap();
        let medium = store.create(create("c", JobPriority::Medium)).await.unwrap();

        let ids: Vec<JobId> = store
            .list_pending()
            .await
            .unwrap()
            .into_iter()
            .map(|job| job.id)
            .collect();
        assert_eq!(ids, vec![high.id, medium.id, low.id]);
    }

    #[tokio::test]
    async fn retriable_listing_filters_time_and_budget() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        let mut due = store.create(create("due", JobPriority::Medium)).await.unwrap();
        due.status = JobStatus::Failed;
        due.retry_count = 1;
        due.next_retry_time = Some(now - Duration::seconds(1));
        store.update(&due).await.unwrap();

        let mut later = store.create(create("later", JobPriority::High)).await.unwrap();
        later.status = JobStatus::Failed;
        later.retry_count = 1;
        later.next_retry_time = Some(now + Duration::seconds(30));
        store.update(&later).await.unwrap();

        let mut dead = store.create(create("dead", JobPriority::High)).await.unwrap();
        dead.status = JobStatus::DeadLetter;
        store.update(&dead).await.unwrap();

        let ready = store.list_retriable_failed(now).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, due.id);
    }

    #[tokio::test]
    async fn unreachable_store_rejects_everything() {
        let store = InMemoryStore::new();
        store.set_reachable(false);
        assert!(!store.is_reachable().await);
        assert!(matches!(
            store.create(create("x", JobPriority::Low)).await,
            Err(JobError::StoreUnavailable)
        ));
        store.set_reachable(true);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn update_of_unknown_job_is_not_found() {
        let store = InMemoryStore::new();
        let ghost = crate::job::test_record(JobPriority::Low, Utc::now());
        assert!(matches!(
            store.update(&ghost).await,
            Err(JobError::NotFound(id)) if id == ghost.id
        ));
    }
}
