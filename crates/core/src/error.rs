//! Domain error model.

use thiserror::Error;

use crate::job::JobState;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic failures only (validation, illegal transitions). Storage and
/// process failures belong to the infrastructure layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. empty input locator).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A state transition was attempted from a state that does not allow it.
    #[error("invalid transition: job is {from}, cannot move to {to}")]
    InvalidTransition { from: JobState, to: JobState },

    /// The job is claimed by a different worker.
    #[error("job is owned by another worker")]
    NotOwner,

    /// An attempt number did not advance the recorded attempt count.
    #[error("stale attempt {attempt}: {recorded} already recorded")]
    StaleAttempt { attempt: u32, recorded: u32 },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn transition(from: JobState, to: JobState) -> Self {
        Self::InvalidTransition { from, to }
    }
}
