//! Cooperative cancellation over a side channel.
//!
//! Cancellation notices travel on their own queue, separate from the task
//! queue. Every worker runs a [`CancellationListener`] that matches notices
//! against its [`WorkerLeases`] by task id and trips the matching token. The
//! channel is advisory and at-least-once, so duplicate and stale notices are
//! expected and harmless.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::core::broker::QueueBroker;
use crate::core::message::{CancellationNotice, Delivery, TaskMessage};
use crate::core::RelayError;
use crate::util::clock::{is_older_than, now_ms};
use crate::util::serde::{LogicalKey, TaskId};

/// In-memory map of the tasks currently executing on this worker.
///
/// Insertions happen on dispatch and removals on completion, while lookups
/// come from the listener, so the map sits behind a mutex.
#[derive(Debug, Default)]
pub struct WorkerLeases {
    inner: Mutex<HashMap<TaskId, CancellationToken>>,
}

impl WorkerLeases {
    /// Create an empty lease map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task and return its cancellation token, or `None` if the
    /// task is already executing here.
    pub fn register(&self, task_id: &TaskId) -> Option<CancellationToken> {
        let mut leases = self.inner.lock();
        if leases.contains_key(task_id) {
            return None;
        }
        let token = CancellationToken::new();
        leases.insert(task_id.clone(), token.clone());
        Some(token)
    }

    /// Forget a task. Returns `true` if it was registered.
    pub fn release(&self, task_id: &TaskId) -> bool {
        self.inner.lock().remove(task_id).is_some()
    }

    /// Trip the token of a locally running task. Returns `false` if the task
    /// is not running here.
    pub fn cancel(&self, task_id: &TaskId) -> bool {
        let token = self.inner.lock().get(task_id).cloned();
        token.is_some_and(|token| {
            token.cancel();
            true
        })
    }

    /// Trip every registered token.
    pub fn cancel_all(&self) {
        for token in self.inner.lock().values() {
            token.cancel();
        }
    }

    /// Whether `task_id` is running here.
    #[must_use]
    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.inner.lock().contains_key(task_id)
    }

    /// Number of tasks running here.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether nothing is running here.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Producer and consumer side of the cancellation queue.
#[derive(Debug, Clone)]
pub struct CancellationChannel {
    broker: QueueBroker,
}

impl CancellationChannel {
    /// Wrap the broker of the cancellation queue.
    #[must_use]
    pub const fn new(broker: QueueBroker) -> Self {
        Self { broker }
    }

    /// Publish a notice asking whoever runs `task_id` to stop.
    ///
    /// # Errors
    ///
    /// Transport errors from the broker.
    pub async fn publish(&self, task_id: &TaskId) -> Result<CancellationNotice, RelayError> {
        let notice = CancellationNotice {
            task_id: task_id.clone(),
            requested_at_ms: now_ms(),
        };
        let body = serde_json::to_vec(&notice)?;
        let message = TaskMessage::new(
            task_id.clone(),
            LogicalKey::new(format!("cancel/{task_id}")),
            body,
        );
        self.broker.send(message).await?;
        tracing::info!(task_id = %task_id, "cancellation requested");
        Ok(notice)
    }

    /// Receive pending notices.
    ///
    /// # Errors
    ///
    /// Transport errors from the broker.
    pub async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, RelayError> {
        self.broker.receive(max_messages, wait).await
    }

    /// Broker of the cancellation queue.
    #[must_use]
    pub const fn broker(&self) -> &QueueBroker {
        &self.broker
    }
}

/// Tunables for a [`CancellationListener`].
#[derive(Debug, Clone)]
pub struct ListenerSettings {
    /// Notices fetched per receive.
    pub batch_size: usize,
    /// Long-poll wait per receive.
    pub wait: Duration,
    /// How long an unmatched notice stays hidden before peers can see it.
    pub requeue_delay: Duration,
    /// Unmatched notices older than this are deleted.
    pub notice_ttl: Duration,
    /// Pause after a failed receive.
    pub error_backoff: Duration,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            wait: Duration::from_secs(1),
            requeue_delay: Duration::from_secs(1),
            notice_ttl: Duration::from_secs(300),
            error_backoff: Duration::from_millis(500),
        }
    }
}

/// Counts from one listener drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Notices that matched a local task.
    pub cancelled: usize,
    /// Unmatched notices handed back for peers.
    pub requeued: usize,
    /// Stale or malformed notices deleted.
    pub discarded: usize,
}

/// Worker-side loop draining the cancellation queue.
#[derive(Debug, Clone)]
pub struct CancellationListener {
    channel: CancellationChannel,
    leases: Arc<WorkerLeases>,
    settings: ListenerSettings,
}

impl CancellationListener {
    /// Create a listener over a channel and the worker's lease map.
    #[must_use]
    pub const fn new(
        channel: CancellationChannel,
        leases: Arc<WorkerLeases>,
        settings: ListenerSettings,
    ) -> Self {
        Self {
            channel,
            leases,
            settings,
        }
    }

    /// Run until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::debug!("cancellation listener started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                result = self.drain_once() => {
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "cancellation receive failed");
                        tokio::select! {
                            () = shutdown.cancelled() => break,
                            () = tokio::time::sleep(self.settings.error_backoff) => {}
                        }
                    }
                }
            }
        }
        tracing::debug!("cancellation listener stopped");
    }

    /// Receive one batch of notices and act on each.
    ///
    /// # Errors
    ///
    /// Transport errors from the receive. Errors while acknowledging single
    /// notices are logged; the notice simply comes back later.
    pub async fn drain_once(&self) -> Result<DrainReport, RelayError> {
        let deliveries = self
            .channel
            .receive(self.settings.batch_size, self.settings.wait)
            .await?;
        let mut report = DrainReport::default();
        for delivery in deliveries {
            self.handle(&delivery, &mut report).await;
        }
        Ok(report)
    }

    async fn handle(&self, delivery: &Delivery, report: &mut DrainReport) {
        let broker = self.channel.broker();
        let notice: CancellationNotice = match serde_json::from_slice(&delivery.payload) {
            Ok(notice) => notice,
            Err(e) => {
                tracing::warn!(task_id = %delivery.task_id, error = %e, "malformed cancellation notice dropped");
                report.discarded += 1;
                Self::log_ack_failure(broker.acknowledge(delivery).await);
                return;
            }
        };

        if self.leases.cancel(&notice.task_id) {
            tracing::info!(task_id = %notice.task_id, "cancellation signalled to running task");
            report.cancelled += 1;
            Self::log_ack_failure(broker.acknowledge(delivery).await);
        } else if is_older_than(notice.requested_at_ms, now_ms(), self.settings.notice_ttl) {
            tracing::debug!(task_id = %notice.task_id, "stale cancellation notice discarded");
            report.discarded += 1;
            Self::log_ack_failure(broker.acknowledge(delivery).await);
        } else {
            tracing::trace!(task_id = %notice.task_id, "task not running here, notice handed back");
            report.requeued += 1;
            Self::log_ack_failure(
                broker
                    .extend_visibility(&delivery.receipt, self.settings.requeue_delay)
                    .await,
            );
        }
    }

    fn log_ack_failure(result: Result<(), RelayError>) {
        if let Err(e) = result {
            tracing::debug!(error = %e, "cancellation notice acknowledgement failed");
        }
    }
}
