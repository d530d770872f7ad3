//! Durable transcription jobs.
//!
//! ## Design
//!
//! - A job moves strictly `Pending -> Running -> Succeeded | Failed`
//! - Every transition is a compare-and-set in the store, so racing workers
//!   get exactly one winner
//! - Workers hold a lease, renewed by heartbeat; an expired lease lets another
//!   worker resume the job from its last checkpointed attempt
//! - Callers block on a job id until it is terminal or their deadline passes
//!
//! ## Components
//!
//! - `JobStore`: persistence (in-memory or Postgres)
//! - `JobStateMachine`: transitions, completion signal, `wait`
//! - `PolicyExecutor`: retry with exponential backoff and per-attempt timeout
//! - `JobDispatcher`: worker tasks that claim and execute jobs
//! - `JobGateway`: upload, submit, submit-and-wait

pub mod dispatcher;
pub mod executor;
pub mod gateway;
pub mod notify;
pub mod postgres;
pub mod state_machine;
pub mod store;

pub use dispatcher::{DispatcherConfig, DispatcherHandle, DispatcherStats, JobDispatcher};
pub use executor::{AttemptFailure, PolicyExecutor, ResumePoint, TerminalError};
pub use gateway::{GatewayError, JobGateway};
pub use notify::CompletionHub;
pub use postgres::PostgresJobStore;
pub use state_machine::{JobStateMachine, WaitError};
pub use store::{ClaimedJob, InMemoryJobStore, JobStore, JobStoreError};
