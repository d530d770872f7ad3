//! The job entity and its state machine.
//!
//! ```text
//! Pending ──start/claim──▶ Running ──complete──▶ Succeeded
//!                             │
//!                             └──────fail──────▶ Failed
//! ```
//!
//! Transitions only move forward. A `Running` job whose lease expired may be
//! reclaimed by another worker; that changes the owner, never the state.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, WorkerId};
use crate::value_object::ValueObject;

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Submitted, waiting to be claimed
    Pending,
    /// Claimed by a worker, step in progress
    Running,
    /// Step produced a result
    Succeeded,
    /// All attempts exhausted
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }

    /// Whether `self -> next` is one of the three legal edges.
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Running)
                | (JobState::Running, JobState::Succeeded)
                | (JobState::Running, JobState::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "running" => Ok(JobState::Running),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            other => Err(DomainError::validation(format!("unknown job state: {other}"))),
        }
    }
}

/// Locator of the media a job transcribes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobInput(PathBuf);

impl ValueObject for JobInput {}

impl JobInput {
    /// Rejects empty and whitespace-only locators. Readability is checked by
    /// the submission gateway, which owns the filesystem.
    pub fn new(path: impl Into<PathBuf>) -> DomainResult<Self> {
        let path = path.into();
        if path.as_os_str().is_empty() || path.to_string_lossy().trim().is_empty() {
            return Err(DomainError::validation("input locator must not be empty"));
        }
        Ok(Self(path))
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for JobInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Terminal outcome, as handed to a waiting caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded(String),
    Failed(String),
}

/// A durable transcription job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub input: JobInput,
    /// Task queue the job was submitted to
    pub queue: String,
    pub state: JobState,
    /// Attempts started so far (checkpointed before each attempt runs)
    pub attempt_count: u32,
    pub result: Option<String>,
    pub error: Option<String>,
    /// Diagnostics of the most recent failed attempt
    #[serde(default)]
    pub last_failure: Option<String>,
    /// Worker currently holding the claim
    pub worker_id: Option<WorkerId>,
    /// Claim expires at this instant unless heartbeated
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Entity for Job {
    type Id = JobId;

    fn id(&self) -> &JobId {
        &self.id
    }
}

impl Job {
    /// Create a new pending job.
    pub fn new(id: JobId, input: JobInput, queue: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            input,
            queue: queue.into(),
            state: JobState::Pending,
            attempt_count: 0,
            result: None,
            error: None,
            last_failure: None,
            worker_id: None,
            lease_expires_at: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    fn ensure(&self, next: JobState) -> DomainResult<()> {
        if self.state.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::transition(self.state, next))
        }
    }

    /// `Pending -> Running`, taking the claim for `worker`.
    pub fn start(
        &mut self,
        worker: WorkerId,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure(JobState::Running)?;
        self.state = JobState::Running;
        self.worker_id = Some(worker);
        self.lease_expires_at = Some(lease_until);
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// True when the claim of a running job lapsed (its worker is presumed dead).
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Running && self.lease_expires_at.is_none_or(|at| at <= now)
    }

    /// Whether a worker may claim this job right now.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending || self.lease_expired(now)
    }

    /// Take over a running job whose lease expired. The state stays `Running`.
    pub fn reclaim(
        &mut self,
        worker: WorkerId,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if self.state != JobState::Running {
            return Err(DomainError::transition(self.state, JobState::Running));
        }
        if !self.lease_expired(now) {
            return Err(DomainError::NotOwner);
        }
        self.worker_id = Some(worker);
        self.lease_expires_at = Some(lease_until);
        self.updated_at = now;
        Ok(())
    }

    /// Fails unless `worker` holds the claim.
    pub fn ensure_owner(&self, worker: WorkerId) -> DomainResult<()> {
        if self.worker_id == Some(worker) {
            Ok(())
        } else {
            Err(DomainError::NotOwner)
        }
    }

    /// Extend the lease. Only the current owner may do so.
    pub fn heartbeat(
        &mut self,
        worker: WorkerId,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if self.state != JobState::Running {
            return Err(DomainError::transition(self.state, JobState::Running));
        }
        self.ensure_owner(worker)?;
        self.lease_expires_at = Some(lease_until);
        self.updated_at = now;
        Ok(())
    }

    /// Checkpoint that attempt `attempt` is about to run.
    pub fn record_attempt(&mut self, attempt: u32, now: DateTime<Utc>) -> DomainResult<()> {
        if self.state != JobState::Running {
            return Err(DomainError::transition(self.state, JobState::Running));
        }
        if attempt <= self.attempt_count {
            return Err(DomainError::StaleAttempt {
                attempt,
                recorded: self.attempt_count,
            });
        }
        self.attempt_count = attempt;
        self.updated_at = now;
        Ok(())
    }

    /// Checkpoint why the current attempt failed, so a worker that resumes
    /// the job after the budget is spent can still report it.
    pub fn record_failure(
        &mut self,
        attempt: u32,
        failure: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if self.state != JobState::Running {
            return Err(DomainError::transition(self.state, JobState::Running));
        }
        if attempt != self.attempt_count {
            return Err(DomainError::StaleAttempt {
                attempt,
                recorded: self.attempt_count,
            });
        }
        self.last_failure = Some(failure.into());
        self.updated_at = now;
        Ok(())
    }

    /// `Running -> Succeeded`.
    pub fn complete(&mut self, result: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure(JobState::Succeeded)?;
        self.state = JobState::Succeeded;
        self.result = Some(result.into());
        self.finish(now);
        Ok(())
    }

    /// `Running -> Failed`.
    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure(JobState::Failed)?;
        self.state = JobState::Failed;
        self.error = Some(error.into());
        self.finish(now);
        Ok(())
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        self.lease_expires_at = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// The terminal outcome, if the job finished.
    pub fn outcome(&self) -> Option<JobOutcome> {
        match self.state {
            JobState::Succeeded => Some(JobOutcome::Succeeded(
                self.result.clone().unwrap_or_default(),
            )),
            JobState::Failed => Some(JobOutcome::Failed(self.error.clone().unwrap_or_default())),
            JobState::Pending | JobState::Running => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    fn pending_job() -> Job {
        Job::new(
            JobId::new(),
            JobInput::new("/tmp/audio.m4a").unwrap(),
            "TRANSCRIBE_QUEUE",
            Utc::now(),
        )
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(JobInput::new("").is_err());
        assert!(JobInput::new("   ").is_err());
        assert!(JobInput::new("a.wav").is_ok());
    }

    #[test]
    fn identity_survives_state_changes() {
        let mut job = pending_job();
        let id = *Entity::id(&job);
        let now = Utc::now();

        job.start(WorkerId::new(), now, now).unwrap();
        job.fail("boom", now).unwrap();
        assert_eq!(*Entity::id(&job), id);
    }

    #[test]
    fn job_lifecycle() {
        let mut job = pending_job();
        let now = Utc::now();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempt_count, 0);

        job.start(WorkerId::new(), now + Duration::seconds(30), now).unwrap();
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.started_at, Some(now));

        job.record_attempt(1, now).unwrap();
        job.complete("hello world", now).unwrap();

        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.outcome(), Some(JobOutcome::Succeeded("hello world".into())));
        assert!(job.error.is_none());
        assert_eq!(job.completed_at, Some(now));
    }

    #[test]
    fn start_twice_is_rejected() {
        let mut job = pending_job();
        let now = Utc::now();
        job.start(WorkerId::new(), now, now).unwrap();

        let err = job.start(WorkerId::new(), now, now).unwrap_err();
        assert_eq!(
            err,
            DomainError::InvalidTransition {
                from: JobState::Running,
                to: JobState::Running
            }
        );
    }

    #[test]
    fn terminal_states_are_immutable() {
        let mut job = pending_job();
        let now = Utc::now();
        job.start(WorkerId::new(), now, now).unwrap();
        job.fail("boom", now).unwrap();

        assert!(job.complete("late", now).is_err());
        assert!(job.fail("again", now).is_err());
        assert_eq!(job.error.as_deref(), Some("boom"));
        assert!(job.result.is_none());
    }

    #[test]
    fn complete_requires_running() {
        let mut job = pending_job();
        assert!(job.complete("x", Utc::now()).is_err());
        assert!(job.fail("x", Utc::now()).is_err());
        assert_eq!(job.state, JobState::Pending);
    }

    #[test]
    fn reclaim_only_after_lease_expiry() {
        let mut job = pending_job();
        let now = Utc::now();
        let first = WorkerId::new();
        let second = WorkerId::new();
        job.start(first, now + Duration::seconds(10), now).unwrap();

        assert!(!job.is_claimable(now));
        assert_eq!(
            job.reclaim(second, now + Duration::seconds(20), now),
            Err(DomainError::NotOwner)
        );

        let later = now + Duration::seconds(11);
        assert!(job.is_claimable(later));
        job.reclaim(second, later + Duration::seconds(10), later).unwrap();
        assert_eq!(job.worker_id, Some(second));
        assert_eq!(job.state, JobState::Running);

        assert_eq!(
            job.heartbeat(first, later + Duration::seconds(30), later),
            Err(DomainError::NotOwner)
        );
        job.heartbeat(second, later + Duration::seconds(30), later).unwrap();
    }

    #[test]
    fn failure_is_recorded_against_the_current_attempt() {
        let mut job = pending_job();
        let now = Utc::now();
        job.start(WorkerId::new(), now, now).unwrap();
        job.record_attempt(1, now).unwrap();

        job.record_failure(1, "exit status: 1, stderr: CUDA out of memory", now)
            .unwrap();
        assert_eq!(
            job.last_failure.as_deref(),
            Some("exit status: 1, stderr: CUDA out of memory")
        );

        assert_eq!(
            job.record_failure(2, "from the future", now),
            Err(DomainError::StaleAttempt {
                attempt: 2,
                recorded: 1
            })
        );
        assert!(job.error.is_none());

        job.fail("gave up", now).unwrap();
        assert!(job.record_failure(1, "late", now).is_err());
    }

    #[test]
    fn attempts_only_move_forward() {
        let mut job = pending_job();
        let now = Utc::now();
        job.start(WorkerId::new(), now, now).unwrap();
        job.record_attempt(1, now).unwrap();
        job.record_attempt(2, now).unwrap();

        assert_eq!(
            job.record_attempt(2, now),
            Err(DomainError::StaleAttempt {
                attempt: 2,
                recorded: 2
            })
        );
        assert_eq!(job.attempt_count, 2);
    }

    #[test]
    fn state_parses_from_storage_form() {
        for state in [
            JobState::Pending,
            JobState::Running,
            JobState::Succeeded,
            JobState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("done".parse::<JobState>().is_err());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Start,
        Attempt(u32),
        Complete,
        Fail,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Start),
            (1u32..8).prop_map(Op::Attempt),
            Just(Op::Complete),
            Just(Op::Fail),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: whatever operations are thrown at a job, the observed
        /// states walk Pending -> Running -> {Succeeded | Failed} and the
        /// result/error fields are exclusive and written at most once.
        #[test]
        fn transitions_only_follow_the_lifecycle(ops in prop::collection::vec(op(), 0..24)) {
            let mut job = pending_job();
            let now = Utc::now();
            let mut seen = vec![job.state];

            for op in ops {
                let before = job.clone();
                let applied = match op {
                    Op::Start => job.start(WorkerId::new(), now, now),
                    Op::Attempt(n) => job.record_attempt(n, now),
                    Op::Complete => job.complete("text", now),
                    Op::Fail => job.fail("error", now),
                };

                if applied.is_err() {
                    prop_assert_eq!(&job, &before);
                }
                if before.state.is_terminal() {
                    prop_assert_eq!(&job, &before);
                }
                if seen.last() != Some(&job.state) {
                    seen.push(job.state);
                }
                prop_assert!(!(job.result.is_some() && job.error.is_some()));
            }

            let allowed: [&[JobState]; 4] = [
                &[JobState::Pending],
                &[JobState::Pending, JobState::Running],
                &[JobState::Pending, JobState::Running, JobState::Succeeded],
                &[JobState::Pending, JobState::Running, JobState::Failed],
            ];
            prop_assert!(allowed.iter().any(|path| *path == seen.as_slice()));
        }
    }
}
