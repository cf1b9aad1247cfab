//! Job storage boundary and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use jobforge_core::{Job, JobError, JobId, JobState, claim_ordering};

use crate::db::PoolError;

/// Job store abstraction.
///
/// Implementations own claim exclusivity: `claim_next` must never hand the
/// same job to two callers, and `save` must only succeed when the stored
/// state still matches what the caller last observed.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new `pending` or `scheduled` job. A second job with the same
    /// idempotency key is a no-op that reports the existing id.
    async fn enqueue(&self, job: Job) -> Result<Enqueued, JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Atomically pick the best eligible job at `now`, apply `claim_at(now)`
    /// and persist it. Returns `None` when nothing is eligible.
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError>;

    /// Persist `job` if the stored copy is still in `expected` state.
    ///
    /// `not_before` gates a `retrying` job until the given instant and is
    /// ignored for every other state.
    async fn save(
        &self,
        job: &Job,
        expected: JobState,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<(), JobStoreError>;

    /// List jobs in a state, oldest first.
    async fn list_by_state(&self, state: JobState, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// List jobs of a type, oldest first.
    async fn list_by_type(&self, job_type: &str, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Get job counts per state.
    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Outcome of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Created(JobId),
    /// The idempotency key was already taken by this job.
    Duplicate(JobId),
}

impl Enqueued {
    pub fn id(&self) -> JobId {
        match self {
            Enqueued::Created(id) | Enqueued::Duplicate(id) => *id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Enqueued::Duplicate(_))
    }
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {job_id} cannot be enqueued in state {state}")]
    NotEnqueueable { job_id: JobId, state: JobState },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Transition(#[from] JobError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    /// Whether repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(_) => true,
            Self::Pool(e) => e.is_retryable(),
            Self::NotFound(_)
            | Self::NotEnqueueable { .. }
            | Self::Conflict(_)
            | Self::Transition(_) => false,
        }
    }
}

/// Job counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub scheduled: usize,
    pub running: usize,
    pub retrying: usize,
    pub completed: usize,
    pub dead: usize,
}

impl JobStats {
    pub(crate) fn add(&mut self, state: JobState, count: usize) {
        match state {
            JobState::Pending => self.pending += count,
            JobState::Scheduled => self.scheduled += count,
            JobState::Running => self.running += count,
            JobState::Retrying => self.retrying += count,
            JobState::Completed => self.completed += count,
            JobState::Dead => self.dead += count,
            JobState::Failed => {}
        }
    }
}

pub(crate) fn ensure_enqueueable(job: &Job) -> Result<(), JobStoreError> {
    match job.state() {
        JobState::Pending | JobState::Scheduled => Ok(()),
        state => Err(JobStoreError::NotEnqueueable {
            job_id: job.id(),
            state,
        }),
    }
}

#[derive(Debug, Clone)]
struct Entry {
    job: Job,
    not_before: Option<DateTime<Utc>>,
}

impl Entry {
    fn claimable_at(&self, now: DateTime<Utc>) -> bool {
        self.job.can_run_at(now) && self.not_before.is_none_or(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Entry>,
    by_idempotency_key: HashMap<String, JobId>,
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Retry gate currently stored for a job.
    pub fn not_before(&self, job_id: JobId) -> Option<DateTime<Utc>> {
        self.read()
            .ok()
            .and_then(|inner| inner.jobs.get(&job_id).and_then(|e| e.not_before))
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, JobStoreError> {
        self.inner
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, JobStoreError> {
        self.inner
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    fn collect<P>(&self, limit: usize, predicate: P) -> Result<Vec<Job>, JobStoreError>
    where
        P: Fn(&Job) -> bool,
    {
        let inner = self.read()?;
        let mut result: Vec<Job> = inner
            .jobs
            .values()
            .filter(|e| predicate(&e.job))
            .map(|e| e.job.clone())
            .collect();
        result.sort_by_key(|j| (j.created_at(), j.id()));
        result.truncate(limit);
        Ok(result)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: Job) -> Result<Enqueued, JobStoreError> {
        ensure_enqueueable(&job)?;
        let mut inner = self.write()?;
        if let Some(existing) = inner.by_idempotency_key.get(job.idempotency_key()) {
            return Ok(Enqueued::Duplicate(*existing));
        }
        if inner.jobs.contains_key(&job.id()) {
            return Err(JobStoreError::Conflict(format!("job {} already exists", job.id())));
        }
        let id = job.id();
        inner
            .by_idempotency_key
            .insert(job.idempotency_key().to_string(), id);
        inner.jobs.insert(
            id,
            Entry {
                job,
                not_before: None,
            },
        );
        Ok(Enqueued::Created(id))
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.jobs.get(&job_id).map(|e| e.job.clone()))
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        let mut inner = self.write()?;

        let next = inner
            .jobs
            .values()
            .filter(|e| e.claimable_at(now))
            .min_by(|a, b| claim_ordering(&a.job, &b.job))
            .map(|e| e.job.id());

        let Some(job_id) = next else {
            return Ok(None);
        };
        let Some(entry) = inner.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        entry.job.claim_at(now)?;
        entry.not_before = None;
        Ok(Some(entry.job.clone()))
    }

    async fn save(
        &self,
        job: &Job,
        expected: JobState,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<(), JobStoreError> {
        let mut inner = self.write()?;
        let entry = inner
            .jobs
            .get_mut(&job.id())
            .ok_or(JobStoreError::NotFound(job.id()))?;

        if entry.job.state() != expected {
            return Err(JobStoreError::Conflict(format!(
                "job {} is {}, expected {}",
                job.id(),
                entry.job.state(),
                expected
            )));
        }

        entry.job = job.clone();
        entry.not_before = not_before.filter(|_| job.state() == JobState::Retrying);
        Ok(())
    }

    async fn list_by_state(&self, state: JobState, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        self.collect(limit, |j| j.state() == state)
    }

    async fn list_by_type(&self, job_type: &str, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        self.collect(limit, |j| j.job_type() == job_type)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let inner = self.read()?;
        let mut stats = JobStats::default();
        for entry in inner.jobs.values() {
            stats.add(entry.job.state(), 1);
        }
        Ok(stats)
    }
}

#[async_trait]
impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    async fn enqueue(&self, job: Job) -> Result<Enqueued, JobStoreError> {
        (**self).enqueue(job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id).await
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next(now).await
    }

    async fn save(
        &self,
        job: &Job,
        expected: JobState,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<(), JobStoreError> {
        (**self).save(job, expected, not_before).await
    }

    async fn list_by_state(&self, state: JobState, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_state(state, limit).await
    }

    async fn list_by_type(&self, job_type: &str, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_type(job_type, limit).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats().await
    }
}
