//! `scribe-core` — job domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! the job entity and its state machine, identifiers, and the retry policy.

pub mod entity;
pub mod error;
pub mod id;
pub mod job;
pub mod retry;
pub mod value_object;

pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{JobId, WorkerId};
pub use job::{Job, JobInput, JobOutcome, JobState};
pub use retry::RetryPolicy;
pub use value_object::ValueObject;
