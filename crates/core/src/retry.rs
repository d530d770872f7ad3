//! Retry policy for the single execution step of a job.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::value_object::ValueObject;

/// Retry policy configuration.
///
/// Attached to a job's step when execution begins. It is configuration, not
/// durable state: a resumed job is driven by whatever policy the resuming
/// worker was started with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the second attempt
    pub initial_backoff: Duration,
    /// Factor applied to the delay after every failed attempt
    pub backoff_multiplier: f64,
    /// Total attempts, the first one included (>= 1)
    pub max_attempts: u32,
    /// Deadline for a single attempt
    pub per_attempt_timeout: Duration,
}

impl ValueObject for RetryPolicy {}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            max_attempts: 5,
            per_attempt_timeout: Duration::from_secs(60 * 60),
        }
    }
}

impl RetryPolicy {
    /// Create a validated policy.
    pub fn new(
        initial_backoff: Duration,
        backoff_multiplier: f64,
        max_attempts: u32,
        per_attempt_timeout: Duration,
    ) -> DomainResult<Self> {
        let policy = Self {
            initial_backoff,
            backoff_multiplier,
            max_attempts,
            per_attempt_timeout,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Policy with no backoff at all, for tests and local runs.
    pub fn immediate(max_attempts: u32, per_attempt_timeout: Duration) -> Self {
        Self {
            initial_backoff: Duration::ZERO,
            backoff_multiplier: 1.0,
            max_attempts,
            per_attempt_timeout,
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.max_attempts == 0 {
            return Err(DomainError::validation("max_attempts must be at least 1"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(DomainError::validation(
                "backoff_multiplier must be a finite number >= 1.0",
            ));
        }
        if self.per_attempt_timeout.is_zero() {
            return Err(DomainError::validation("per_attempt_timeout must be positive"));
        }
        Ok(())
    }

    /// Delay to sleep after failed attempt `attempt` (1-indexed):
    /// `initial_backoff * backoff_multiplier^(attempt-1)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exp = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
        Duration::try_from_secs_f64(self.initial_backoff.as_secs_f64() * exp)
            .unwrap_or(Duration::MAX)
    }

    /// Check if another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_attempts: 5,
            per_attempt_timeout: Duration::from_secs(1),
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn default_matches_the_transcription_schedule() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(16));
        assert_eq!(policy.per_attempt_timeout, Duration::from_secs(3600));
    }

    #[test]
    fn immediate_policy_never_sleeps() {
        let policy = RetryPolicy::immediate(3, Duration::from_secs(1));

        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(3), Duration::ZERO);
    }

    #[test]
    fn huge_exponents_saturate() {
        let policy = RetryPolicy {
            backoff_multiplier: 10.0,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(400), Duration::MAX);
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn validation_rejects_nonsense() {
        let one_sec = Duration::from_secs(1);

        assert!(RetryPolicy::new(one_sec, 2.0, 0, one_sec).is_err());
        assert!(RetryPolicy::new(one_sec, 0.5, 3, one_sec).is_err());
        assert!(RetryPolicy::new(one_sec, f64::NAN, 3, one_sec).is_err());
        assert!(RetryPolicy::new(one_sec, 2.0, 3, Duration::ZERO).is_err());
        assert!(RetryPolicy::new(one_sec, 2.0, 3, one_sec).is_ok());
    }
}
