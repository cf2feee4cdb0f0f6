//! In-memory result mailbox.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::mailbox::Mailbox;
use crate::core::message::TaskOutcome;
use crate::core::BackendError;
use crate::util::serde::TaskId;

/// Simple in-memory mailbox for development and testing.
#[derive(Debug, Default)]
pub struct InMemoryMailbox {
    outcomes: Mutex<HashMap<TaskId, TaskOutcome>>,
}

impl InMemoryMailbox {
    /// Create an empty mailbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored outcomes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outcomes.lock().len()
    }

    /// Whether no outcome is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outcomes.lock().is_empty()
    }
}

#[async_trait]
impl Mailbox for InMemoryMailbox {
    async fn deliver(&self, outcome: TaskOutcome) -> Result<bool, BackendError> {
        let mut outcomes = self.outcomes.lock();
        if outcomes.contains_key(&outcome.task_id) {
            return Ok(false);
        }
        outcomes.insert(outcome.task_id.clone(), outcome);
        Ok(true)
    }

    async fn fetch(&self, task_id: &TaskId) -> Result<Option<TaskOutcome>, BackendError> {
        Ok(self.outcomes.lock().get(task_id).cloned())
    }

    async fn purge(&self, finished_before_ms: u128) -> Result<usize, BackendError> {
        let mut outcomes = self.outcomes.lock();
        let before = outcomes.len();
        outcomes.retain(|_, outcome| outcome.finished_at_ms >= finished_before_ms);
        Ok(before - outcomes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::OutcomeStatus;

    fn outcome(task: &str, status: OutcomeStatus, finished_at_ms: u128) -> TaskOutcome {
        TaskOutcome {
            task_id: task.into(),
            logical_key: "k".into(),
            status,
            result_ref: None,
            attempt: 1,
            finished_at_ms,
        }
    }

    #[tokio::test]
    async fn first_delivery_wins() {
        let mailbox = InMemoryMailbox::new();
        assert!(mailbox.deliver(outcome("t", OutcomeStatus::Completed, 1)).await.unwrap());
        assert!(!mailbox.deliver(outcome("t", OutcomeStatus::Cancelled, 2)).await.unwrap());
        let stored = mailbox.fetch(&"t".into()).await.unwrap().unwrap();
        assert_eq!(stored.status, OutcomeStatus::Completed);
    }

    #[tokio::test]
    async fn purge_removes_old_outcomes() {
        let mailbox = InMemoryMailbox::new();
        mailbox.deliver(outcome("old", OutcomeStatus::Failed, 10)).await.unwrap();
        mailbox.deliver(outcome("new", OutcomeStatus::Completed, 100)).await.unwrap();
        assert_eq!(mailbox.purge(50).await.unwrap(), 1);
        assert!(mailbox.fetch(&"old".into()).await.unwrap().is_none());
        assert_eq!(mailbox.len(), 1);
    }
}
