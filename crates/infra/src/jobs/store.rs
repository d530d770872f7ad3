//! Job storage: the durable queue + state store shared by gateway and workers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use scribe_core::{DomainError, Job, JobId, JobState, WorkerId};

/// Job store abstraction.
///
/// Every state-changing operation is a compare-and-set against the stored
/// state, so concurrent callers racing on the same job get exactly one winner.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Durably record a new job. Returns once the job is persisted.
    async fn insert(&self, job: Job) -> Result<JobId, JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// `Pending -> Running` for one specific job.
    async fn start(
        &self,
        job_id: JobId,
        worker: WorkerId,
        lease: Duration,
    ) -> Result<Job, JobStoreError>;

    /// Atomically claim the oldest claimable job of `queue`: a pending job, or
    /// a running one whose lease expired. Returns None if nothing is claimable.
    async fn claim_next(
        &self,
        queue: &str,
        worker: WorkerId,
        lease: Duration,
    ) -> Result<Option<ClaimedJob>, JobStoreError>;

    /// Extend the claim held by `worker`.
    async fn heartbeat(
        &self,
        job_id: JobId,
        worker: WorkerId,
        lease: Duration,
    ) -> Result<(), JobStoreError>;

    /// Checkpoint that `attempt` is about to run.
    async fn record_attempt(
        &self,
        job_id: JobId,
        worker: WorkerId,
        attempt: u32,
    ) -> Result<(), JobStoreError>;

    /// Checkpoint the diagnostics of a failed `attempt`.
    async fn record_failure(
        &self,
        job_id: JobId,
        worker: WorkerId,
        attempt: u32,
        failure: &str,
    ) -> Result<(), JobStoreError>;

    /// `Running -> Succeeded`, recording the result.
    async fn complete(
        &self,
        job_id: JobId,
        worker: WorkerId,
        result: &str,
    ) -> Result<Job, JobStoreError>;

    /// `Running -> Failed`, recording the error.
    async fn fail(&self, job_id: JobId, worker: WorkerId, error: &str)
    -> Result<Job, JobStoreError>;
}

/// A job handed to a worker by [`JobStore::claim_next`].
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: Job,
    /// The job was already running under a worker whose lease expired.
    pub resumed: bool,
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {job_id} rejected the change: {source}")]
    Rejected {
        job_id: JobId,
        #[source]
        source: DomainError,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    pub fn rejected(job_id: JobId, source: DomainError) -> Self {
        Self::Rejected { job_id, source }
    }

    /// True when another worker won the race for this job.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            JobStoreError::Rejected {
                source: DomainError::InvalidTransition { .. } | DomainError::NotOwner,
                ..
            }
        )
    }
}

/// Absolute lease deadline for a lease starting at `now`.
pub(crate) fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// In-memory job store for tests/dev. Not durable across restarts.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored jobs, whatever their state.
    pub fn len(&self) -> usize {
        self.read().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job map lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job map lock poisoned".to_string()))
    }

    /// Apply `change` to a copy of the job and store it only if it succeeds.
    fn modify<F>(&self, job_id: JobId, change: F) -> Result<Job, JobStoreError>
    where
        F: FnOnce(&mut Job, DateTime<Utc>) -> Result<(), DomainError>,
    {
        let mut jobs = self.write()?;
        let stored = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;

        let mut next = stored.clone();
        change(&mut next, Utc::now()).map_err(|e| JobStoreError::rejected(job_id, e))?;
        *stored = next.clone();
        Ok(next)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.get(&job_id).cloned())
    }

    async fn start(
        &self,
        job_id: JobId,
        worker: WorkerId,
        lease: Duration,
    ) -> Result<Job, JobStoreError> {
        self.modify(job_id, |job, now| {
            job.start(worker, lease_deadline(now, lease), now)
        })
    }

    async fn claim_next(
        &self,
        queue: &str,
        worker: WorkerId,
        lease: Duration,
    ) -> Result<Option<ClaimedJob>, JobStoreError> {
        let mut jobs = self.write()?;
        let now = Utc::now();

        // Oldest claimable job first
        let candidate = jobs
            .values()
            .filter(|j| j.queue == queue && j.is_claimable(now))
            .min_by_key(|j| j.created_at)
            .map(|j| j.id);

        let Some(job_id) = candidate else {
            return Ok(None);
        };
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };

        let until = lease_deadline(now, lease);
        let resumed = job.state == JobState::Running;
        if resumed {
            job.reclaim(worker, until, now)
        } else {
            job.start(worker, until, now)
        }
        .map_err(|e| JobStoreError::rejected(job_id, e))?;

        Ok(Some(ClaimedJob {
            job: job.clone(),
            resumed,
        }))
    }

    async fn heartbeat(
        &self,
        job_id: JobId,
        worker: WorkerId,
        lease: Duration,
    ) -> Result<(), JobStoreError> {
        self.modify(job_id, |job, now| {
            job.heartbeat(worker, lease_deadline(now, lease), now)
        })
        .map(|_| ())
    }

    async fn record_attempt(
        &self,
        job_id: JobId,
        worker: WorkerId,
        attempt: u32,
    ) -> Result<(), JobStoreError> {
        self.modify(job_id, |job, now| {
            job.ensure_owner(worker)?;
            job.record_attempt(attempt, now)
        })
        .map(|_| ())
    }

    async fn record_failure(
        &self,
        job_id: JobId,
        worker: WorkerId,
        attempt: u32,
        failure: &str,
    ) -> Result<(), JobStoreError> {
        self.modify(job_id, |job, now| {
            job.ensure_owner(worker)?;
            job.record_failure(attempt, failure, now)
        })
        .map(|_| ())
    }

    async fn complete(
        &self,
        job_id: JobId,
        worker: WorkerId,
        result: &str,
    ) -> Result<Job, JobStoreError> {
        self.modify(job_id, |job, now| {
            job.ensure_owner(worker)?;
            job.complete(result, now)
        })
    }

    async fn fail(
        &self,
        job_id: JobId,
        worker: WorkerId,
        error: &str,
    ) -> Result<Job, JobStoreError> {
        self.modify(job_id, |job, now| {
            job.ensure_owner(worker)?;
            job.fail(error, now)
        })
    }
}

#[async_trait]
impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    async fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).insert(job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id).await
    }

    async fn start(
        &self,
        job_id: JobId,
        worker: WorkerId,
        lease: Duration,
    ) -> Result<Job, JobStoreError> {
        (**self).start(job_id, worker, lease).await
    }

    async fn claim_next(
        &self,
        queue: &str,
        worker: WorkerId,
        lease: Duration,
    ) -> Result<Option<ClaimedJob>, JobStoreError> {
        (**self).claim_next(queue, worker, lease).await
    }

    async fn heartbeat(
        &self,
        job_id: JobId,
        worker: WorkerId,
        lease: Duration,
    ) -> Result<(), JobStoreError> {
        (**self).heartbeat(job_id, worker, lease).await
    }

    async fn record_attempt(
        &self,
        job_id: JobId,
        worker: WorkerId,
        attempt: u32,
    ) -> Result<(), JobStoreError> {
        (**self).record_attempt(job_id, worker, attempt).await
    }

    async fn record_failure(
        &self,
        job_id: JobId,
        worker: WorkerId,
        attempt: u32,
        failure: &str,
    ) -> Result<(), JobStoreError> {
        (**self)
            .record_failure(job_id, worker, attempt, failure)
            .await
    }

    async fn complete(
        &self,
        job_id: JobId,
        worker: WorkerId,
        result: &str,
    ) -> Result<Job, JobStoreError> {
        (**self).complete(job_id, worker, result).await
    }

    async fn fail(
        &self,
        job_id: JobId,
        worker: WorkerId,
        error: &str,
    ) -> Result<Job, JobStoreError> {
        (**self).fail(job_id, worker, error).await
    }
}
