//! Retry/timeout executor for a single job step.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use scribe_core::RetryPolicy;

use super::store::JobStoreError;
use crate::transcriber::ExecutionError;

/// Why one attempt did not produce a value.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AttemptFailure {
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("checkpoint failed: {0}")]
    Checkpoint(JobStoreError),
}

impl AttemptFailure {
    /// Everything is retried except a checkpoint that lost the claim: another
    /// worker owns the job now, so this one must stop.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AttemptFailure::Checkpoint(e) if e.is_conflict())
    }
}

/// Where a step picks up: attempts a previous owner already started, and the
/// failure it last checkpointed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumePoint {
    pub completed: u32,
    pub last_failure: Option<String>,
}

impl ResumePoint {
    pub fn new(completed: u32, last_failure: Option<String>) -> Self {
        Self {
            completed,
            last_failure,
        }
    }
}

/// Attempts are exhausted. `last_error` is the final attempt's failure text
/// and is what ends up in the job's `error` field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("step failed after {attempts} attempt(s): {last_error}")]
pub struct TerminalError {
    pub attempts: u32,
    pub last_error: String,
}

/// Runs an operation under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct PolicyExecutor {
    policy: RetryPolicy,
}

impl PolicyExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` from the first attempt.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, TerminalError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AttemptFailure>>,
    {
        self.execute_from(ResumePoint::default(), op, |_, _| async {})
            .await
    }

    /// Run `op` starting after the attempts a previous owner of the job
    /// already started.
    ///
    /// `op` receives the 1-indexed attempt number. Each attempt runs under
    /// `per_attempt_timeout`; an expired attempt's future is dropped. Every
    /// failed attempt, timeouts included, is handed to `on_failure` before
    /// anything else happens. After a failed attempt `n < max_attempts` the
    /// executor sleeps `delay_for_attempt(n)`. When resuming, the backoff owed
    /// for attempt `completed` is slept first. A failure that is not
    /// retryable ends the step at once.
    pub async fn execute_from<T, F, Fut, R, RFut>(
        &self,
        resume: ResumePoint,
        mut op: F,
        mut on_failure: R,
    ) -> Result<T, TerminalError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AttemptFailure>>,
        R: FnMut(u32, String) -> RFut,
        RFut: Future<Output = ()>,
    {
        let max = self.policy.max_attempts;
        let completed = resume.completed;
        if completed >= max {
            let last_error = match resume.last_failure {
                Some(failure) => failure,
                None => format!(
                    "retry budget of {max} attempt(s) exhausted before the job was resumed"
                ),
            };
            return Err(TerminalError {
                attempts: completed,
                last_error,
            });
        }

        if completed > 0 {
            let delay = self.policy.delay_for_attempt(completed);
            debug!(completed, delay_ms = delay.as_millis() as u64, "resuming after backoff");
            tokio::time::sleep(delay).await;
        }

        let mut attempt = completed + 1;
        loop {
            let outcome = match tokio::time::timeout(self.policy.per_attempt_timeout, op(attempt))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(AttemptFailure::Timeout(self.policy.per_attempt_timeout)),
            };

            let failure = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "attempt succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(failure) => failure,
            };

            if !failure.is_retryable() {
                warn!(attempt, error = %failure, "attempt cannot be retried");
                return Err(TerminalError {
                    attempts: attempt,
                    last_error: failure.to_string(),
                });
            }

            on_failure(attempt, failure.to_string()).await;

            if !self.policy.should_retry(attempt) {
                warn!(attempt, max, error = %failure, "attempts exhausted");
                return Err(TerminalError {
                    attempts: attempt,
                    last_error: failure.to_string(),
                });
            }

            let delay = self.policy.delay_for_attempt(attempt);
            warn!(
                attempt,
                max,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_core::{DomainError, JobId};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_attempts,
            per_attempt_timeout: Duration::from_secs(10),
        }
    }

    fn fail(n: u32) -> AttemptFailure {
        ExecutionError::new("exit status: 1", format!("diag {n}")).into()
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_op_runs_exactly_max_attempts() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let executor = PolicyExecutor::new(policy(5));

        let recorded = calls.clone();
        let err = executor
            .execute(|n| {
                let recorded = recorded.clone();
                async move {
                    recorded.lock().unwrap().push((n, Instant::now()));
                    Err::<(), _>(fail(n))
                }
            })
            .await
            .unwrap_err();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 5);
        assert_eq!(err.attempts, 5);
        assert!(err.last_error.contains("diag 5"), "{}", err.last_error);

        let gaps: Vec<_> = calls.windows(2).map(|w| w[1].1 - w[0].1).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn success_on_attempt_k_stops_there() {
        let calls = Arc::new(Mutex::new(0u32));
        let executor = PolicyExecutor::new(policy(5));

        let counter = calls.clone();
        let text = executor
            .execute(|n| {
                let counter = counter.clone();
                async move {
                    *counter.lock().unwrap() += 1;
                    if n < 3 { Err(fail(n)) } else { Ok("done") }
                }
            })
            .await
            .unwrap();

        assert_eq!(text, "done");
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempts_time_out_and_are_retried() {
        let executor = PolicyExecutor::new(RetryPolicy {
            per_attempt_timeout: Duration::from_secs(1),
            ..policy(3)
        });

        let result = executor
            .execute(|n| async move {
                if n == 1 {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok::<_, AttemptFailure>(n)
            })
            .await
            .unwrap();

        assert_eq!(result, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn final_timeout_is_reported_as_the_last_error() {
        let executor = PolicyExecutor::new(RetryPolicy {
            per_attempt_timeout: Duration::from_millis(10),
            ..policy(2)
        });

        let err = executor
            .execute(|_| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, AttemptFailure>(())
            })
            .await
            .unwrap_err();

        assert_eq!(err.attempts, 2);
        assert!(err.last_error.contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn resume_continues_numbering_and_backoff() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let executor = PolicyExecutor::new(policy(5));
        let started = Instant::now();

        let recorded = seen.clone();
        let err = executor
            .execute_from(
                ResumePoint::new(3, None),
                |n| {
                    let recorded = recorded.clone();
                    async move {
                        recorded.lock().unwrap().push((n, Instant::now() - started));
                        Err::<(), _>(fail(n))
                    }
                },
                |_, _| async {},
            )
            .await
            .unwrap_err();

        assert_eq!(err.attempts, 5);
        let seen = seen.lock().unwrap();
        // 400ms owed after attempt 3, then 800ms after attempt 4
        assert_eq!(
            *seen,
            vec![
                (4, Duration::from_millis(400)),
                (5, Duration::from_millis(1200)),
            ]
        );
    }

    #[tokio::test]
    async fn exhausted_budget_fails_without_running() {
        let executor = PolicyExecutor::new(policy(2));
        let calls = Arc::new(Mutex::new(0u32));

        let counter = calls.clone();
        let err = executor
            .execute_from(
                ResumePoint::new(2, None),
                |_| {
                    let counter = counter.clone();
                    async move {
                        *counter.lock().unwrap() += 1;
                        Ok::<_, AttemptFailure>(())
                    }
                },
                |_, _| async {},
            )
            .await
            .unwrap_err();

        assert_eq!(*calls.lock().unwrap(), 0);
        assert_eq!(err.attempts, 2);
        assert!(err.last_error.contains("exhausted"));
    }

    #[tokio::test]
    async fn exhausted_budget_reports_the_checkpointed_failure() {
        let executor = PolicyExecutor::new(policy(2));

        let err = executor
            .execute_from(
                ResumePoint::new(2, Some("stderr: CUDA out of memory".into())),
                |_| async { Ok::<_, AttemptFailure>(()) },
                |_, _| async {},
            )
            .await
            .unwrap_err();

        assert_eq!(err.attempts, 2);
        assert_eq!(err.last_error, "stderr: CUDA out of memory");
        assert!(err.to_string().contains("after 2 attempt(s)"));
    }

    #[tokio::test(start_paused = true)]
    async fn every_failure_is_reported_including_timeouts() {
        let executor = PolicyExecutor::new(RetryPolicy {
            per_attempt_timeout: Duration::from_millis(50),
            ..policy(2)
        });
        let reported = Arc::new(Mutex::new(Vec::new()));

        let sink = reported.clone();
        executor
            .execute_from(
                ResumePoint::default(),
                |n| async move {
                    if n == 1 {
                        Err(fail(n))
                    } else {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        Ok(())
                    }
                },
                |n, text| {
                    let sink = sink.clone();
                    async move { sink.lock().unwrap().push((n, text)) }
                },
            )
            .await
            .unwrap_err();

        let reported = reported.lock().unwrap();
        assert_eq!(reported.len(), 2);
        assert_eq!(reported[0].0, 1);
        assert!(reported[0].1.contains("diag 1"), "{}", reported[0].1);
        assert_eq!(reported[1].0, 2);
        assert!(reported[1].1.contains("timed out"), "{}", reported[1].1);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_claim_stops_retrying() {
        let executor = PolicyExecutor::new(policy(5));
        let calls = Arc::new(Mutex::new(0u32));
        let started = Instant::now();

        let counter = calls.clone();
        let err = executor
            .execute(|_| {
                let counter = counter.clone();
                async move {
                    *counter.lock().unwrap() += 1;
                    Err::<(), _>(AttemptFailure::Checkpoint(JobStoreError::rejected(
                        JobId::new(),
                        DomainError::NotOwner,
                    )))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(err.attempts, 1);
        assert_eq!(Instant::now(), started, "no backoff after a lost claim");
    }

    #[test]
    fn only_a_lost_claim_is_not_retryable() {
        let id = JobId::new();
        assert!(fail(1).is_retryable());
        assert!(AttemptFailure::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(
            AttemptFailure::Checkpoint(JobStoreError::Storage("blip".into())).is_retryable()
        );
        assert!(
            !AttemptFailure::Checkpoint(JobStoreError::rejected(id, DomainError::NotOwner))
                .is_retryable()
        );
    }
}
