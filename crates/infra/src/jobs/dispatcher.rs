//! Worker loop: claim a job, run the transcriber under the retry policy,
//! record the terminal state.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use scribe_core::{DomainError, Job, JobId, RetryPolicy, WorkerId};

use super::executor::{AttemptFailure, PolicyExecutor, ResumePoint};
use super::state_machine::JobStateMachine;
use super::store::{ClaimedJob, JobStore, JobStoreError};
use crate::transcriber::Transcriber;

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Name for logging
    pub name: String,
    /// Only jobs of this queue are claimed
    pub queue: String,
    /// Concurrent worker tasks
    pub workers: usize,
    /// Idle delay between claims when the queue is empty
    pub poll_interval: Duration,
    /// Claim lease, renewed every `lease / 3` while a job runs. A worker that
    /// cannot renew it for `2 * lease / 3` abandons the job.
    pub lease: Duration,
    pub policy: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "transcribe-dispatcher".to_string(),
            queue: "TRANSCRIBE_QUEUE".to_string(),
            workers: 2,
            poll_interval: Duration::from_millis(500),
            lease: Duration::from_secs(30),
            policy: RetryPolicy::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Dispatcher runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DispatcherStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    /// Jobs taken over from a worker whose lease expired
    pub jobs_resumed: u64,
    pub current_running: usize,
}

fn lock(stats: &Mutex<DispatcherStats>) -> MutexGuard<'_, DispatcherStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to control running dispatcher workers.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl DispatcherHandle {
    /// Stop claiming new jobs and wait for every worker to finish the job
    /// it is currently running. Returns the final statistics.
    pub async fn shutdown(self) -> DispatcherStats {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "dispatcher worker panicked");
            }
        }
        lock(&self.stats).clone()
    }

    /// Get current dispatcher statistics.
    pub fn stats(&self) -> DispatcherStats {
        lock(&self.stats).clone()
    }
}

/// Aborts the heartbeat task when the job finishes, whichever way it does.
struct HeartbeatGuard(JoinHandle<()>);

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Background job dispatcher.
///
/// Each worker claims the oldest claimable job of the configured queue,
/// executes it through the [`Transcriber`] under the retry policy, and
/// records `Succeeded` or `Failed`. Claims are atomic in the store, and a
/// worker drops its running attempt as soon as it can no longer prove it
/// holds the claim, so workers here and in other processes never run one job
/// concurrently.
pub struct JobDispatcher<S> {
    machine: Arc<JobStateMachine<S>>,
    transcriber: Arc<dyn Transcriber>,
    executor: PolicyExecutor,
    config: DispatcherConfig,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl<S: JobStore + 'static> JobDispatcher<S> {
    pub fn new(
        machine: Arc<JobStateMachine<S>>,
        transcriber: Arc<dyn Transcriber>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            machine,
            transcriber,
            executor: PolicyExecutor::new(config.policy.clone()),
            config,
            stats: Arc::new(Mutex::new(DispatcherStats::default())),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn stats(&self) -> DispatcherStats {
        lock(&self.stats).clone()
    }

    /// Spawn `config.workers` worker tasks.
    pub fn spawn(self) -> DispatcherHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let dispatcher = Arc::new(self);

        let joins = (0..dispatcher.config.workers.max(1))
            .map(|_| {
                let dispatcher = dispatcher.clone();
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move { dispatcher.worker_loop(WorkerId::new(), shutdown).await })
            })
            .collect();

        info!(
            name = %dispatcher.config.name,
            queue = %dispatcher.config.queue,
            workers = dispatcher.config.workers,
            "dispatcher started"
        );

        DispatcherHandle {
            shutdown: shutdown_tx,
            joins,
            stats,
        }
    }

    async fn worker_loop(&self, worker: WorkerId, mut shutdown: watch::Receiver<bool>) {
        debug!(name = %self.config.name, worker = %worker, "worker started");

        loop {
            let stop = *shutdown.borrow();
            if stop {
                break;
            }

            let idle = match self.run_once(worker).await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) if e.is_conflict() => {
                    warn!(name = %self.config.name, worker = %worker, error = %e, "job lost to another worker");
                    false
                }
                Err(e) => {
                    error!(name = %self.config.name, worker = %worker, error = %e, "dispatch failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    changed = shutdown.changed() => {
                        // Handle dropped without an explicit shutdown
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        debug!(name = %self.config.name, worker = %worker, "worker stopped");
    }

    /// Claim and fully process at most one job as `worker`.
    ///
    /// Returns the terminal job, or `None` when nothing was claimable.
    pub async fn run_once(&self, worker: WorkerId) -> Result<Option<Job>, JobStoreError> {
        // Taken before the claim so the lease is never assumed to last longer
        // than it does in the store.
        let claimed_at = Instant::now();
        let claimed = self
            .machine
            .claim_next(&self.config.queue, worker, self.config.lease)
            .await?;

        match claimed {
            Some(claimed) => self.process(claimed, worker, claimed_at).await.map(Some),
            None => Ok(None),
        }
    }

    async fn process(
        &self,
        claimed: ClaimedJob,
        worker: WorkerId,
        claimed_at: Instant,
    ) -> Result<Job, JobStoreError> {
        let ClaimedJob { job, resumed } = claimed;
        let job_id = job.id;

        if resumed {
            warn!(job_id = %job_id, worker = %worker, attempts = job.attempt_count, "resuming job after expired lease");
        } else {
            debug!(job_id = %job_id, worker = %worker, "job claimed");
        }

        {
            let mut stats = lock(&self.stats);
            stats.current_running += 1;
            if resumed {
                stats.jobs_resumed += 1;
            }
        }

        let result = self.execute(job, worker, claimed_at).await;

        let mut stats = lock(&self.stats);
        stats.current_running = stats.current_running.saturating_sub(1);
        if let Ok(job) = &result {
            stats.jobs_processed += 1;
            match job.error {
                None => stats.jobs_succeeded += 1,
                Some(_) => stats.jobs_failed += 1,
            }
        }
        result
    }

    async fn execute(
        &self,
        job: Job,
        worker: WorkerId,
        claimed_at: Instant,
    ) -> Result<Job, JobStoreError> {
        let job_id = job.id;
        let input = job.input.path().to_path_buf();
        let (lost_tx, mut lost) = watch::channel(false);
        let lost_tx = Arc::new(lost_tx);
        let _heartbeat = self.start_heartbeat(job_id, worker, claimed_at, lost_tx.clone());

        let run = self.executor.execute_from(
            ResumePoint::new(job.attempt_count, job.last_failure.clone()),
            |attempt| {
                let machine = self.machine.clone();
                let transcriber = self.transcriber.clone();
                let input = input.clone();
                let lost_tx = lost_tx.clone();
                async move {
                    if let Err(e) = machine.record_attempt(job_id, worker, attempt).await {
                        if e.is_conflict() {
                            lost_tx.send_replace(true);
                        }
                        return Err(AttemptFailure::Checkpoint(e));
                    }
                    debug!(job_id = %job_id, attempt, "running transcriber");
                    Ok::<_, AttemptFailure>(transcriber.run(&input).await?)
                }
            },
            |attempt, failure| {
                let machine = self.machine.clone();
                async move {
                    if let Err(e) = machine
                        .record_failure(job_id, worker, attempt, &failure)
                        .await
                    {
                        warn!(job_id = %job_id, attempt, error = %e, "failed to checkpoint attempt failure");
                    }
                }
            },
        );

        // Dropping `run` kills the in-flight attempt.
        let outcome = tokio::select! {
            outcome = run => outcome,
            _ = claim_lost(&mut lost) => return Err(abandon(job_id, worker)),
        };
        if *lost.borrow() {
            return Err(abandon(job_id, worker));
        }

        let finished = match outcome {
            Ok(text) => self.machine.complete(job_id, worker, &text).await,
            Err(terminal) => self.machine.fail(job_id, worker, &terminal.to_string()).await,
        };

        if let Err(e) = &finished {
            if e.is_conflict() {
                warn!(job_id = %job_id, worker = %worker, "lost the job to another worker");
            }
        }
        finished
    }

    /// Renew the lease every `lease / 3`. Flags `lost` and stops when another
    /// worker owns the job, or when no renewal succeeded for `2 * lease / 3`.
    fn start_heartbeat(
        &self,
        job_id: JobId,
        worker: WorkerId,
        claimed_at: Instant,
        lost: Arc<watch::Sender<bool>>,
    ) -> HeartbeatGuard {
        let machine = self.machine.clone();
        let lease = self.config.lease;
        let every = lease / 3;
        let give_up_after = lease.saturating_sub(every);

        HeartbeatGuard(tokio::spawn(async move {
            let mut renewed_at = claimed_at;
            loop {
                tokio::time::sleep(every).await;
                let sent_at = Instant::now();
                let renewed = tokio::time::timeout(every, machine.heartbeat(job_id, worker, lease))
                    .await
                    .unwrap_or_else(|_| Err(JobStoreError::Storage("heartbeat timed out".into())));

                match renewed {
                    Ok(()) => renewed_at = sent_at,
                    Err(e) if e.is_conflict() => {
                        warn!(job_id = %job_id, worker = %worker, error = %e, "claim taken over");
                        lost.send_replace(true);
                        return;
                    }
                    Err(e) => {
                        warn!(job_id = %job_id, worker = %worker, error = %e, "heartbeat failed");
                        if renewed_at.elapsed() >= give_up_after {
                            warn!(job_id = %job_id, worker = %worker, "lease could not be renewed in time");
                            lost.send_replace(true);
                            return;
                        }
                    }
                }
            }
        }))
    }
}

/// Resolves once the claim is flagged as lost.
async fn claim_lost(lost: &mut watch::Receiver<bool>) {
    if lost.wait_for(|lost| *lost).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn abandon(job_id: JobId, worker: WorkerId) -> JobStoreError {
    warn!(job_id = %job_id, worker = %worker, "claim lost, abandoning the job");
    JobStoreError::rejected(job_id, DomainError::NotOwner)
}
