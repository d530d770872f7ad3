//! Submission gateway: turns a request into a durable job and, optionally,
//! blocks the caller until it finishes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use scribe_core::{Job, JobId, JobInput, JobOutcome};

use super::state_machine::{JobStateMachine, WaitError};
use super::store::{JobStore, JobStoreError};
use crate::uploads::{UploadError, UploadStore};

/// Errors a submitting caller can see.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// Malformed or missing input; no job was created.
    #[error("invalid input: {0}")]
    Validation(String),
    /// The upload or the job record could not be persisted.
    #[error("storage error: {0}")]
    Storage(String),
    /// Retries were exhausted; `error` holds the final diagnostics.
    #[error("job {job_id} failed: {error}")]
    Failed { job_id: JobId, error: String },
    /// The caller stopped waiting. The job itself keeps running.
    #[error("deadline exceeded after {waited:?} waiting for job {job_id}")]
    DeadlineExceeded { job_id: JobId, waited: Duration },
    #[error("job not found: {0}")]
    NotFound(JobId),
}

impl From<JobStoreError> for GatewayError {
    fn from(e: JobStoreError) -> Self {
        match e {
            JobStoreError::NotFound(id) => GatewayError::NotFound(id),
            other => GatewayError::Storage(other.to_string()),
        }
    }
}

impl From<UploadError> for GatewayError {
    fn from(e: UploadError) -> Self {
        GatewayError::Storage(e.to_string())
    }
}

impl From<WaitError> for GatewayError {
    fn from(e: WaitError) -> Self {
        match e {
            WaitError::DeadlineExceeded { job_id, waited } => {
                GatewayError::DeadlineExceeded { job_id, waited }
            }
            WaitError::NotFound(id) => GatewayError::NotFound(id),
            WaitError::Store(e) => e.into(),
        }
    }
}

/// Entry point for callers: persists uploads, creates jobs, waits on them.
pub struct JobGateway<S> {
    machine: Arc<JobStateMachine<S>>,
    uploads: UploadStore,
    queue: String,
}

impl<S: JobStore> JobGateway<S> {
    pub fn new(machine: Arc<JobStateMachine<S>>, uploads: UploadStore, queue: impl Into<String>) -> Self {
        Self {
            machine,
            uploads,
            queue: queue.into(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Persist an uploaded file and return where it was written.
    pub async fn accept_upload(
        &self,
        original_name: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, GatewayError> {
        if bytes.is_empty() {
            return Err(GatewayError::Validation("uploaded file is empty".into()));
        }
        Ok(self.uploads.save(original_name, bytes).await?)
    }

    /// Create a pending job for a readable input file.
    #[instrument(skip(self, input), fields(queue = %self.queue), err)]
    pub async fn submit(&self, input: impl Into<PathBuf>) -> Result<JobId, GatewayError> {
        let input = JobInput::new(input).map_err(|e| GatewayError::Validation(e.to_string()))?;
        ensure_readable(&input).await?;

        let job_id = JobId::new();
        self.machine.create(job_id, input, &self.queue).await?;
        Ok(job_id)
    }

    /// `submit` + `wait`: the transcript on success, a descriptive error on
    /// failure, or `DeadlineExceeded` if `timeout` runs out first.
    pub async fn submit_and_wait(
        &self,
        input: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Result<String, GatewayError> {
        let job_id = self.submit(input).await?;
        self.wait(job_id, timeout).await
    }

    /// Persist an upload, submit it, and wait for the transcript.
    ///
    /// The upload is removed again if no job could be created for it.
    pub async fn transcribe_upload(
        &self,
        original_name: &str,
        bytes: &[u8],
        timeout: Duration,
    ) -> Result<String, GatewayError> {
        let path = self.accept_upload(original_name, bytes).await?;
        info!(path = %path.display(), "upload accepted");

        let job_id = match self.submit(&path).await {
            Ok(job_id) => job_id,
            Err(e) => {
                if let Err(discard) = self.uploads.discard(&path).await {
                    warn!(error = %discard, "orphaned upload left behind");
                }
                return Err(e);
            }
        };
        self.wait(job_id, timeout).await
    }

    /// Wait for an existing job's outcome.
    pub async fn wait(&self, job_id: JobId, timeout: Duration) -> Result<String, GatewayError> {
        let job = self.machine.wait(job_id, timeout).await?;
        match job.outcome() {
            Some(JobOutcome::Succeeded(text)) => Ok(text),
            Some(JobOutcome::Failed(error)) => Err(GatewayError::Failed { job_id, error }),
            None => Err(GatewayError::Storage(format!(
                "job {job_id} reported done in state {}",
                job.state
            ))),
        }
    }

    /// Current record of a job, terminal or not.
    pub async fn find(&self, job_id: JobId) -> Result<Option<Job>, GatewayError> {
        Ok(self.machine.get(job_id).await?)
    }
}

async fn ensure_readable(input: &JobInput) -> Result<(), GatewayError> {
    let path = input.path();
    let unreadable = |reason: String| {
        GatewayError::Validation(format!("input {} is not readable: {reason}", path.display()))
    };

    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| unreadable(e.to_string()))?;
    let metadata = file.metadata().await.map_err(|e| unreadable(e.to_string()))?;
    if !metadata.is_file() {
        return Err(unreadable("not a regular file".into()));
    }
    Ok(())
}
