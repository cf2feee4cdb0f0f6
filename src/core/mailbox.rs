//! Result mailbox: where workers leave terminal outcomes for pollers.
//!
//! Keyed by task id rather than by queue message, since the message is gone
//! once a worker consumes it.

use async_trait::async_trait;

use crate::core::message::TaskOutcome;
use crate::core::BackendError;
use crate::util::serde::TaskId;

/// Abstraction for result mailbox backends.
#[async_trait]
pub trait Mailbox: Send + Sync + 'static {
    /// Store the outcome for `outcome.task_id` unless one is already stored.
    /// Returns `true` if this call stored it.
    async fn deliver(&self, outcome: TaskOutcome) -> Result<bool, BackendError>;

    /// Load the outcome stored for `task_id`.
    async fn fetch(&self, task_id: &TaskId) -> Result<Option<TaskOutcome>, BackendError>;

    /// Drop outcomes that finished before `finished_before_ms`.
    async fn purge(&self, finished_before_ms: u128) -> Result<usize, BackendError>;
}
