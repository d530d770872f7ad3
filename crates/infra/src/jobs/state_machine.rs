//! Durable job state machine: store-backed transitions plus waiting.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info};

use scribe_core::{Job, JobId, JobInput, WorkerId};

use super::notify::CompletionHub;
use super::store::{ClaimedJob, JobStore, JobStoreError};

/// How often a waiter re-reads the store when no notification arrives.
/// Covers jobs finished by workers in another process.
pub const DEFAULT_WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Why a wait ended without a terminal job.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WaitError {
    #[error("deadline exceeded after {waited:?} waiting for job {job_id}")]
    DeadlineExceeded { job_id: JobId, waited: Duration },
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Drives jobs through `Pending -> Running -> Succeeded | Failed` on top of a
/// [`JobStore`], and wakes waiters when a job becomes terminal.
///
/// The store does the compare-and-set; this type adds logging and the
/// completion signal. Not `Clone`; share it behind an `Arc`.
pub struct JobStateMachine<S> {
    store: S,
    hub: CompletionHub,
    poll_interval: Duration,
}

impl<S: JobStore> JobStateMachine<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            hub: CompletionHub::default(),
            poll_interval: DEFAULT_WAIT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Record a new pending job. Durable once this returns.
    pub async fn create(
        &self,
        id: JobId,
        input: JobInput,
        queue: &str,
    ) -> Result<Job, JobStoreError> {
        let job = Job::new(id, input, queue, Utc::now());
        self.store.insert(job.clone()).await?;
        info!(job_id = %id, queue, input = %job.input, "job created");
        Ok(job)
    }

    /// `Pending -> Running` for a specific job. Losers of a race get a
    /// rejection (see [`JobStoreError::is_conflict`]).
    pub async fn start(
        &self,
        job_id: JobId,
        worker: WorkerId,
        lease: Duration,
    ) -> Result<Job, JobStoreError> {
        let job = self.store.start(job_id, worker, lease).await?;
        debug!(job_id = %job_id, worker = %worker, "job started");
        Ok(job)
    }

    /// Claim the next job of `queue` for `worker`.
    pub async fn claim_next(
        &self,
        queue: &str,
        worker: WorkerId,
        lease: Duration,
    ) -> Result<Option<ClaimedJob>, JobStoreError> {
        self.store.claim_next(queue, worker, lease).await
    }

    pub async fn heartbeat(
        &self,
        job_id: JobId,
        worker: WorkerId,
        lease: Duration,
    ) -> Result<(), JobStoreError> {
        self.store.heartbeat(job_id, worker, lease).await
    }

    pub async fn record_attempt(
        &self,
        job_id: JobId,
        worker: WorkerId,
        attempt: u32,
    ) -> Result<(), JobStoreError> {
        self.store.record_attempt(job_id, worker, attempt).await
    }

    /// Keep the failure text of `attempt` with the job while it is retried.
    pub async fn record_failure(
        &self,
        job_id: JobId,
        worker: WorkerId,
        attempt: u32,
        failure: &str,
    ) -> Result<(), JobStoreError> {
        self.store
            .record_failure(job_id, worker, attempt, failure)
            .await
    }

    /// `Running -> Succeeded`.
    pub async fn complete(
        &self,
        job_id: JobId,
        worker: WorkerId,
        result: &str,
    ) -> Result<Job, JobStoreError> {
        let job = self.store.complete(job_id, worker, result).await?;
        self.hub.publish(job_id);
        info!(job_id = %job_id, attempts = job.attempt_count, "job succeeded");
        Ok(job)
    }

    /// `Running -> Failed`.
    pub async fn fail(
        &self,
        job_id: JobId,
        worker: WorkerId,
        error: &str,
    ) -> Result<Job, JobStoreError> {
        let job = self.store.fail(job_id, worker, error).await?;
        self.hub.publish(job_id);
        info!(job_id = %job_id, attempts = job.attempt_count, error, "job failed");
        Ok(job)
    }

    pub async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.store.get(job_id).await
    }

    /// Block until the job is terminal or `deadline` elapses.
    ///
    /// Any number of waiters may wait on one id. A waiter arriving after the
    /// job finished returns immediately. Dropping the future abandons the
    /// wait; the job itself is unaffected either way.
    pub async fn wait(&self, job_id: JobId, deadline: Duration) -> Result<Job, WaitError> {
        // Subscribe before the first read so a completion between the two
        // cannot be missed.
        let mut rx = self.hub.subscribe();

        match tokio::time::timeout(deadline, self.wait_terminal(job_id, &mut rx)).await {
            Ok(result) => result,
            Err(_) => Err(WaitError::DeadlineExceeded {
                job_id,
                waited: deadline,
            }),
        }
    }

    async fn wait_terminal(
        &self,
        job_id: JobId,
        rx: &mut broadcast::Receiver<JobId>,
    ) -> Result<Job, WaitError> {
        loop {
            match self.store.get(job_id).await? {
                Some(job) if job.state.is_terminal() => return Ok(job),
                Some(_) => {}
                None => return Err(WaitError::NotFound(job_id)),
            }

            let tick = tokio::time::sleep(self.poll_interval);
            tokio::pin!(tick);
            loop {
                tokio::select! {
                    signal = rx.recv() => match signal {
                        Ok(id) if id == job_id => break,
                        Ok(_) => continue,
                        Err(RecvError::Lagged(_)) => break,
                        Err(RecvError::Closed) => {
                            (&mut tick).await;
                            break;
                        }
                    },
                    _ = &mut tick => break,
                }
            }
        }
    }
}
