//! Submission and result polling.
//!
//! `submit` turns a payload into a task message and remembers which logical
//! key its task id belongs to. `poll` never touches the task queue: it reads
//! the result mailbox by task id and falls back to the ledger by logical key.
//! Once a terminal status has been observed for a handle it is cached, so
//! later polls can never contradict it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::core::broker::QueueBroker;
use crate::core::cancellation::CancellationChannel;
use crate::core::executor::TaskPayload;
use crate::core::ledger::{FailureKind, IdempotencyLedger, LedgerStatus};
use crate::core::mailbox::Mailbox;
use crate::core::message::{ErrorPayload, OutcomeStatus, TaskMessage, TaskOutcome};
use crate::core::RelayError;
use crate::util::backoff::retry_transient;
use crate::util::clock::now_ms;
use crate::util::serde::{LogicalKey, TaskId};

/// Tunables for a [`Submitter`].
#[derive(Debug, Clone)]
pub struct SubmitterSettings {
    /// Pause between result-store checks inside one `poll`.
    pub poll_interval: Duration,
    /// Longest a single `poll` call blocks.
    pub max_poll_wait: Duration,
    /// Task timeout when the caller does not give one.
    pub default_timeout: Duration,
}

impl Default for SubmitterSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            max_poll_wait: Duration::from_secs(5),
            default_timeout: Duration::from_secs(300),
        }
    }
}

/// Per-submission options.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Overall time the caller is willing to wait for a result.
    pub timeout: Option<Duration>,
    /// Ordering group for FIFO queues.
    pub group_id: Option<String>,
}

/// Caller-side reference to a submitted task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    /// Correlation id of the submission.
    pub task_id: TaskId,
    /// Ledger key of the work item.
    pub logical_key: LogicalKey,
    /// Submission time in milliseconds since epoch.
    pub submitted_at_ms: u128,
    /// Object-store key if the payload was offloaded.
    pub payload_ref: Option<String>,
}

/// Result of a [`Submitter::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    /// No terminal result yet.
    Pending,
    /// The task completed with these result bytes.
    Done(Vec<u8>),
    /// The task failed with this error message.
    Failed(String),
    /// The task was cancelled before finishing.
    Cancelled,
}

impl PollStatus {
    /// Whether the status is final.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Read-only status of a logical key for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum HealthStatus {
    /// The ledger has no record for the key.
    Unknown,
    /// An attempt holds the key.
    Running {
        /// Attempt number.
        attempt: u32,
        /// Whether its heartbeat is older than the ledger's stale timeout.
        stale: bool,
    },
    /// Terminal success.
    Completed,
    /// Terminal failure.
    Failed,
    /// Cancelled on request.
    Cancelled,
}

#[derive(Debug)]
struct Tracked {
    logical_key: LogicalKey,
    deadline: Instant,
    cancel_requested: bool,
    terminal: Option<PollStatus>,
    settled_at: Option<Instant>,
}

impl Tracked {
    /// Whether the entry has been idle for longer than `retention`: settled
    /// that long ago, or never settled and past its deadline by that much.
    fn expired(&self, retention: Duration, now: Instant) -> bool {
        let since = self.settled_at.unwrap_or(self.deadline);
        now.saturating_duration_since(since) > retention
    }
}

/// Orchestrator-facing submission and polling loop.
pub struct Submitter {
    broker: QueueBroker,
    cancellation: CancellationChannel,
    ledger: Arc<dyn IdempotencyLedger>,
    mailbox: Arc<dyn Mailbox>,
    settings: SubmitterSettings,
    tracked: Mutex<HashMap<TaskId, Tracked>>,
}

impl std::fmt::Debug for Submitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Submitter")
            .field("settings", &self.settings)
            .field("tracked", &self.tracked.lock().len())
            .finish_non_exhaustive()
    }
}

impl Submitter {
    /// Create a submitter.
    #[must_use]
    pub fn new(
        broker: QueueBroker,
        cancellation: CancellationChannel,
        ledger: Arc<dyn IdempotencyLedger>,
        mailbox: Arc<dyn Mailbox>,
        settings: SubmitterSettings,
    ) -> Self {
        Self {
            broker,
            cancellation,
            ledger,
            mailbox,
            settings,
            tracked: Mutex::new(HashMap::new()),
        }
    }

    /// Submit `payload` under `logical_key` with a timeout.
    ///
    /// # Errors
    ///
    /// `RelayError::TransportExhausted` when the task may or may not have been
    /// enqueued; `RelayError::Backend` on a permanent rejection.
    pub async fn submit(
        &self,
        payload: Vec<u8>,
        logical_key: impl Into<LogicalKey>,
        timeout: Duration,
    ) -> Result<TaskHandle, RelayError> {
        let options = SubmitOptions {
            timeout: Some(timeout),
            group_id: None,
        };
        self.submit_with(payload, logical_key, options).await
    }

    /// Submit with explicit options.
    ///
    /// # Errors
    ///
    /// Same as [`Submitter::submit`].
    pub async fn submit_with(
        &self,
        payload: Vec<u8>,
        logical_key: impl Into<LogicalKey>,
        options: SubmitOptions,
    ) -> Result<TaskHandle, RelayError> {
        let logical_key = logical_key.into();
        let task_id = TaskId::generate();
        let mut message = TaskMessage::new(task_id.clone(), logical_key.clone(), payload);
        if let Some(group) = options.group_id {
            message = message.with_group(group);
        }
        let submitted_at_ms = message.enqueued_at_ms;

        let receipt = self.broker.send(message).await?;

        let timeout = options.timeout.unwrap_or(self.settings.default_timeout);
        self.tracked.lock().insert(
            task_id.clone(),
            Tracked {
                logical_key: logical_key.clone(),
                deadline: Instant::now() + timeout,
                cancel_requested: false,
                terminal: None,
                settled_at: None,
            },
        );
        tracing::info!(
            task_id = %task_id,
            logical_key = %logical_key,
            offloaded = receipt.payload_ref.is_some(),
            "task submitted"
        );
        Ok(TaskHandle {
            task_id,
            logical_key,
            submitted_at_ms,
            payload_ref: receipt.payload_ref,
        })
    }

    /// Submit a serde payload encoded as JSON.
    ///
    /// # Errors
    ///
    /// `RelayError::Codec` if the payload does not serialize, otherwise the
    /// same as [`Submitter::submit`].
    pub async fn submit_json<P: TaskPayload>(
        &self,
        payload: &P,
        logical_key: impl Into<LogicalKey>,
        options: SubmitOptions,
    ) -> Result<TaskHandle, RelayError> {
        let bytes = serde_json::to_vec(payload)?;
        self.submit_with(bytes, logical_key, options).await
    }

    /// Check for a result, waiting at most `min(max_poll_wait, time left)`.
    /// Once the handle's deadline has passed, a single non-blocking check is
    /// made and `Pending` means the caller should give up or keep waiting on
    /// its own terms.
    ///
    /// # Errors
    ///
    /// `RelayError::UnknownTask` for handles this submitter did not issue (or
    /// already forgot); transport and ledger errors otherwise.
    pub async fn poll(&self, handle: &TaskHandle) -> Result<PollStatus, RelayError> {
        let (logical_key, deadline) = {
            let tracked = self.tracked.lock();
            let entry = tracked
                .get(&handle.task_id)
                .ok_or_else(|| RelayError::UnknownTask(handle.task_id.clone()))?;
            if let Some(status) = &entry.terminal {
                return Ok(status.clone());
            }
            (entry.logical_key.clone(), entry.deadline)
        };

        let started = Instant::now();
        let give_up = started + deadline.saturating_duration_since(started).min(self.settings.max_poll_wait);

        loop {
            if let Some(status) = self.check_once(&handle.task_id, &logical_key).await? {
                return Ok(self.settle(&handle.task_id, status));
            }
            let now = Instant::now();
            if now >= give_up {
                tracing::trace!(task_id = %handle.task_id, "poll window elapsed, still pending");
                return Ok(PollStatus::Pending);
            }
            tokio::time::sleep(self.settings.poll_interval.min(give_up - now)).await;
        }
    }

    /// Poll until the task is terminal or its deadline passes.
    ///
    /// # Errors
    ///
    /// Same as [`Submitter::poll`].
    pub async fn wait(&self, handle: &TaskHandle) -> Result<PollStatus, RelayError> {
        loop {
            let status = self.poll(handle).await?;
            if status.is_terminal() || self.deadline_passed(&handle.task_id) {
                return Ok(status);
            }
        }
    }

    /// Ask the worker running `handle` to stop. Advisory: the task may still
    /// complete, and polling reports whichever terminal result was recorded
    /// first.
    ///
    /// # Errors
    ///
    /// `RelayError::UnknownTask` for foreign handles; transport errors when
    /// the notice could not be published.
    pub async fn request_cancel(&self, handle: &TaskHandle) -> Result<(), RelayError> {
        {
            let mut tracked = self.tracked.lock();
            let entry = tracked
                .get_mut(&handle.task_id)
                .ok_or_else(|| RelayError::UnknownTask(handle.task_id.clone()))?;
            if entry.terminal.is_some() {
                tracing::debug!(task_id = %handle.task_id, "cancel ignored, task already terminal");
                return Ok(());
            }
            entry.cancel_requested = true;
        }
        self.cancellation.publish(&handle.task_id).await?;
        Ok(())
    }

    /// Publish a cancellation notice for any task id, tracked or not.
    ///
    /// # Errors
    ///
    /// Transport errors when the notice could not be published.
    pub async fn terminate(&self, task_id: &TaskId) -> Result<(), RelayError> {
        self.cancellation.publish(task_id).await?;
        Ok(())
    }

    /// Whether cancellation was requested for `handle`.
    #[must_use]
    pub fn cancel_requested(&self, handle: &TaskHandle) -> bool {
        self.tracked
            .lock()
            .get(&handle.task_id)
            .is_some_and(|entry| entry.cancel_requested)
    }

    /// Stop tracking `handle`.
    pub fn forget(&self, handle: &TaskHandle) -> bool {
        self.tracked.lock().remove(&handle.task_id).is_some()
    }

    /// Stop tracking handles that settled, or passed their deadline, more
    /// than `retention` ago. Returns how many were dropped.
    pub fn prune(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let mut tracked = self.tracked.lock();
        let before = tracked.len();
        tracked.retain(|_, entry| !entry.expired(retention, now));
        let pruned = before - tracked.len();
        if pruned > 0 {
            tracing::debug!(pruned, remaining = tracked.len(), "pruned settled task handles");
        }
        pruned
    }

    /// Number of handles being tracked.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.tracked.lock().len()
    }

    /// Ledger status of `logical_key`, without any waiting.
    ///
    /// # Errors
    ///
    /// Ledger errors.
    pub async fn health(&self, logical_key: &LogicalKey) -> Result<HealthStatus, RelayError> {
        let Some(record) = self.ledger.get(logical_key).await? else {
            return Ok(HealthStatus::Unknown);
        };
        Ok(match (record.status, record.failure) {
            (LedgerStatus::Running, _) => HealthStatus::Running {
                attempt: record.attempt_count,
                stale: record.is_stale(self.ledger.stale_after(), now_ms()),
            },
            (LedgerStatus::Completed, _) => HealthStatus::Completed,
            (LedgerStatus::Failed, Some(FailureKind::Cancelled)) => HealthStatus::Cancelled,
            (LedgerStatus::Failed, _) => HealthStatus::Failed,
        })
    }

    fn deadline_passed(&self, task_id: &TaskId) -> bool {
        self.tracked
            .lock()
            .get(task_id)
            .map_or(true, |entry| Instant::now() >= entry.deadline)
    }

    fn settle(&self, task_id: &TaskId, status: PollStatus) -> PollStatus {
        let mut tracked = self.tracked.lock();
        match tracked.get_mut(task_id) {
            Some(entry) => {
                if entry.terminal.is_none() {
                    entry.settled_at = Some(Instant::now());
                }
                entry.terminal.get_or_insert(status).clone()
            }
            None => status,
        }
    }

    async fn check_once(
        &self,
        task_id: &TaskId,
        logical_key: &LogicalKey,
    ) -> Result<Option<PollStatus>, RelayError> {
        let retry = &self.broker.settings().retry;
        let outcome = retry_transient("fetch_outcome", retry, || self.mailbox.fetch(task_id)).await?;
        let outcome = match outcome {
            Some(outcome) => Some(outcome),
            None => self
                .ledger
                .get(logical_key)
                .await?
                .and_then(|record| record.outcome_for(task_id)),
        };
        match outcome {
            Some(outcome) => self.resolve(&outcome).await.map(Some),
            None => Ok(None),
        }
    }

    async fn resolve(&self, outcome: &TaskOutcome) -> Result<PollStatus, RelayError> {
        match outcome.status {
            OutcomeStatus::Cancelled => Ok(PollStatus::Cancelled),
            OutcomeStatus::Completed => {
                let bytes = match &outcome.result_ref {
                    Some(key) => self.load_blob(key).await?,
                    None => Vec::new(),
                };
                Ok(PollStatus::Done(bytes))
            }
            OutcomeStatus::Failed => {
                let message = match &outcome.result_ref {
                    Some(key) => match self.load_blob(key).await {
                        Ok(bytes) => serde_json::from_slice::<ErrorPayload>(&bytes)
                            .map_or_else(|_| String::from_utf8_lossy(&bytes).into_owned(), |p| p.message),
                        Err(e) => {
                            tracing::warn!(task_id = %outcome.task_id, error = %e, "error blob unavailable");
                            "task failed".into()
                        }
                    },
                    None => "task failed without a stored result".into(),
                };
                Ok(PollStatus::Failed(message))
            }
        }
    }

    async fn load_blob(&self, key: &str) -> Result<Vec<u8>, RelayError> {
        let store = self.broker.object_store();
        retry_transient("get_result", &self.broker.settings().retry, || store.get(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!PollStatus::Pending.is_terminal());
        assert!(PollStatus::Done(Vec::new()).is_terminal());
        assert!(PollStatus::Failed("x".into()).is_terminal());
        assert!(PollStatus::Cancelled.is_terminal());
    }

    #[test]
    fn health_serializes_with_state_tag() {
        let json = serde_json::to_value(HealthStatus::Running {
            attempt: 2,
            stale: true,
        })
        .unwrap();
        assert_eq!(json["state"], "running");
        assert_eq!(json["attempt"], 2);
        assert_eq!(json["stale"], true);
    }
}
