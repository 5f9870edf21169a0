//! In-memory priority queue of jobs awaiting dispatch.
//!
//! Jobs come out highest priority first, then oldest `created_at` first, then
//! in insertion order. The queue does not look at `next_retry_time`; callers
//! only push jobs that are dispatchable right now.

use crate::error::{JobError, Result};
use crate::job::{JobId, JobPriority, JobRecord};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug)]
struct Entry {
    priority: JobPriority,
    created_at: DateTime<Utc>,
    seq: u64,
    job: JobRecord,
}

impl Entry {
    fn key(&self) -> (JobPriority, DateTime<Utc>, u64) {
        (self.priority, self.created_at, self.seq)
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // BinaryHeap is a max-heap; the smallest key must compare greatest.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

#[derive(Debug, Default)]
struct Inner {
    heap: BinaryHeap<Entry>,
    /// Ids currently in `heap`.
    queued: HashSet<JobId>,
    /// Ids popped for dispatch and not yet released.
    claimed: HashSet<JobId>,
    next_seq: u64,
}

impl Inner {
    fn insert(&mut self, job: JobRecord) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queued.insert(job.id);
        self.heap.push(Entry {
            priority: job.priority,
            created_at: job.created_at,
            seq,
            job,
        });
    }
}

/// Mutex-guarded priority queue. The guard is never held across an `.await`.
#[derive(Debug, Default)]
pub struct DispatchQueue {
    inner: Mutex<Inner>,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job. Returns `false` without inserting when the same job is
    /// already queued or is being dispatched.
    pub fn push(&self, job: JobRecord) -> Result<bool> {
        ensure_dispatchable(&job)?;
        let mut inner = self.lock();
        if inner.queued.contains(&job.id) || inner.claimed.contains(&job.id) {
            return Ok(false);
        }
        inner.insert(job);
        Ok(true)
    }

    /// Remove the next job to dispatch and claim it until [`release`](Self::release).
    pub fn pop(&self) -> Option<JobRecord> {
        let mut inner = self.lock();
        let entry = inner.heap.pop()?;
        inner.queued.remove(&entry.job.id);
        inner.claimed.insert(entry.job.id);
        Some(entry.job)
    }

    /// Hand a claimed job back, e.g. after the rate limiter turned it away.
    pub fn requeue(&self, job: JobRecord) -> Result<()> {
        ensure_dispatchable(&job)?;
        let mut inner = self.lock();
        inner.claimed.remove(&job.id);
        if !inner.queued.contains(&job.id) {
            inner.insert(job);
        }
        Ok(())
    }

    /// Drop the claim on a job that has left the dispatch path.
    pub fn release(&self, id: JobId) {
        self.lock().claimed.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }

    /// Number of jobs popped and not yet released.
    pub fn claimed(&self) -> usize {
        self.lock().claimed.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Queue operations never panic half-way, so a poisoned guard still
        // holds a consistent heap.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn ensure_dispatchable(job: &JobRecord) -> Result<()> {
    if job.is_dispatchable() {
        Ok(())
    } else {
        Err(JobError::InvalidState {
            id: job.id,
            status: job.status,
        })
    }
}
