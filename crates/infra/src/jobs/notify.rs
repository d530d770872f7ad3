//! In-process completion notifications.
//!
//! Lossy by nature: a waiter that lags or subscribes late falls back to
//! reading the store, which stays the source of truth.

use tokio::sync::broadcast;

use scribe_core::JobId;

/// Fan-out of "job reached a terminal state" signals, keyed by job id.
#[derive(Debug, Clone)]
pub struct CompletionHub {
    tx: broadcast::Sender<JobId>,
}

impl CompletionHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Announce that `job_id` is terminal. No-op without subscribers.
    pub fn publish(&self, job_id: JobId) {
        let _ = self.tx.send(job_id);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobId> {
        self.tx.subscribe()
    }
}

impl Default for CompletionHub {
    fn default() -> Self {
        Self::new(1024)
    }
}
