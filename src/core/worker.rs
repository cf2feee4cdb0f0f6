//! Worker runtime: receive, gate on the ledger, execute, report.
//!
//! One polling loop draws batches from the task queue and dispatches every
//! delivery to its own unit of work through a [`Spawn`] implementation. A
//! second loop drains the cancellation channel. Both share the
//! [`WorkerLeases`] map. A failing unit never takes the loop down: errors are
//! logged, and the message is left to the queue's redelivery.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::{oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::core::audit::{build_audit_event, AuditSink};
use crate::core::broker::QueueBroker;
use crate::core::cancellation::{CancellationChannel, CancellationListener, ListenerSettings, WorkerLeases};
use crate::core::executor::{TaskContext, TaskExecutor};
use crate::core::ledger::{Admission, Completion, FailureKind, IdempotencyLedger, TerminalWrite};
use crate::core::mailbox::Mailbox;
use crate::core::message::{Delivery, ErrorPayload, TaskOutcome};
use crate::core::{LedgerError, RelayError, TaskError};
use crate::util::backoff::retry_transient;
use crate::util::clock::now_ms;
use crate::util::serde::{LogicalKey, TaskId};

/// Trait for spawning async tasks in a runtime-agnostic way.
pub trait Spawn {
    /// Spawn an async task that returns a future.
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

/// Tunables for a [`WorkerRuntime`].
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Identifier used in logs and audit events.
    pub worker_id: String,
    /// Maximum units executing at once.
    pub max_concurrency: usize,
    /// Upper bound on messages fetched per receive.
    pub batch_size: usize,
    /// Long-poll wait per receive.
    pub receive_wait: Duration,
    /// Period of heartbeat and visibility renewal while executing.
    pub heartbeat_interval: Duration,
    /// How long shutdown waits for in-flight units.
    pub drain_timeout: Duration,
    /// Pause after a failed receive.
    pub error_backoff: Duration,
    /// Prefix for result and error blobs.
    pub result_prefix: String,
    /// Cancellation listener tunables.
    pub listener: ListenerSettings,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            max_concurrency: num_cpus::get().max(1),
            batch_size: 10,
            receive_wait: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(30),
            error_backoff: Duration::from_millis(500),
            result_prefix: "results".into(),
            listener: ListenerSettings::default(),
        }
    }
}

impl WorkerSettings {
    /// Object-store key for the result blob of `attempt` on `key`.
    ///
    /// Logical keys are caller-chosen strings, so the key segment is the hex
    /// SHA-256 of the logical key rather than the key itself.
    #[must_use]
    pub fn result_key(&self, key: &LogicalKey, attempt: u32) -> String {
        let digest = hex::encode(Sha256::digest(key.as_str().as_bytes()));
        format!("{}/{}/attempt-{}", self.result_prefix, digest, attempt)
    }
}

/// Snapshot of worker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WorkerStats {
    /// Deliveries received from the task queue.
    pub received: u64,
    /// Units currently executing.
    pub in_flight: u64,
    /// Attempts recorded as completed.
    pub completed: u64,
    /// Attempts recorded as failed by task logic.
    pub failed: u64,
    /// Attempts recorded as cancelled.
    pub cancelled: u64,
    /// Redeliveries answered from the ledger without executing.
    pub duplicates: u64,
    /// Deliveries left for redelivery because another attempt is running.
    pub deferred: u64,
}

#[derive(Debug, Default)]
struct WorkerCounters {
    received: AtomicU64,
    in_flight: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    duplicates: AtomicU64,
    deferred: AtomicU64,
}

impl WorkerCounters {
    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            received: self.received.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
        }
    }
}

struct WorkerShared<E> {
    settings: WorkerSettings,
    broker: QueueBroker,
    ledger: Arc<dyn IdempotencyLedger>,
    mailbox: Arc<dyn Mailbox>,
    executor: E,
    leases: Arc<WorkerLeases>,
    counters: WorkerCounters,
    idle: Notify,
    audit: Mutex<Option<Box<dyn AuditSink>>>,
}

/// Decrements the in-flight count and frees a concurrency slot when a unit
/// ends, however it ends.
struct UnitGuard<E> {
    shared: Arc<WorkerShared<E>>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl<E> Drop for UnitGuard<E> {
    fn drop(&mut self) {
        self.shared.counters.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.shared.idle.notify_waiters();
    }
}

enum Execution {
    Finished(Result<Vec<u8>, TaskError>),
    Panicked(String),
    Cancelled,
    LeaseLost,
}

/// Long-lived worker process logic.
pub struct WorkerRuntime<E: TaskExecutor> {
    shared: Arc<WorkerShared<E>>,
    cancellation: Option<CancellationChannel>,
}

impl<E: TaskExecutor> WorkerRuntime<E> {
    /// Create a worker over its backends.
    pub fn new(
        broker: QueueBroker,
        ledger: Arc<dyn IdempotencyLedger>,
        mailbox: Arc<dyn Mailbox>,
        executor: E,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            shared: Arc::new(WorkerShared {
                settings,
                broker,
                ledger,
                mailbox,
                executor,
                leases: Arc::new(WorkerLeases::new()),
                counters: WorkerCounters::default(),
                idle: Notify::new(),
                audit: Mutex::new(None),
            }),
            cancellation: None,
        }
    }

    /// Listen for cancellation notices on `channel` while running.
    #[must_use]
    pub fn with_cancellation(mut self, channel: CancellationChannel) -> Self {
        self.cancellation = Some(channel);
        self
    }

    /// Record lifecycle events to `sink`.
    #[must_use]
    pub fn with_audit(self, sink: Box<dyn AuditSink>) -> Self {
        *self.shared.audit.lock() = Some(sink);
        self
    }

    /// Lease map shared with the cancellation listener.
    #[must_use]
    pub fn leases(&self) -> Arc<WorkerLeases> {
        Arc::clone(&self.shared.leases)
    }

    /// Start the polling loop (and the cancellation listener, if configured).
    pub fn start<S>(self, spawner: S) -> WorkerHandle
    where
        S: Spawn + Clone + Send + Sync + 'static,
    {
        let shutdown = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();

        if let Some(channel) = self.cancellation {
            let listener = CancellationListener::new(
                channel,
                Arc::clone(&self.shared.leases),
                self.shared.settings.listener.clone(),
            );
            spawner.spawn(listener.run(shutdown.child_token()));
        }

        let shared = Arc::clone(&self.shared);
        let token = shutdown.clone();
        let loop_spawner = spawner.clone();
        spawner.spawn(async move {
            poll_loop(Arc::clone(&shared), loop_spawner, token).await;
            let _ = done_tx.send(());
        });

        tracing::info!(
            worker = %self.shared.settings.worker_id,
            max_concurrency = self.shared.settings.max_concurrency,
            "worker started"
        );

        let stats: Arc<dyn StatsSource> = self.shared;
        WorkerHandle {
            shutdown,
            loop_done: Some(done_rx),
            stats,
        }
    }

    /// Process a single delivery to completion on the current task, outside
    /// the polling loop.
    pub async fn process(&self, delivery: Delivery) {
        self.shared.counters.in_flight.fetch_add(1, Ordering::AcqRel);
        let guard = UnitGuard {
            shared: Arc::clone(&self.shared),
            _permit: None,
        };
        process_delivery(&self.shared, delivery).await;
        drop(guard);
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> WorkerStats {
        self.shared.counters.snapshot()
    }
}

trait StatsSource: Send + Sync {
    fn stats(&self) -> WorkerStats;
    fn leases(&self) -> &WorkerLeases;
    fn drain_timeout(&self) -> Duration;
    fn worker_id(&self) -> &str;
    fn idle(&self) -> &Notify;
}

impl<E: TaskExecutor> StatsSource for WorkerShared<E> {
    fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }
    fn leases(&self) -> &WorkerLeases {
        &self.leases
    }
    fn drain_timeout(&self) -> Duration {
        self.settings.drain_timeout
    }
    fn worker_id(&self) -> &str {
        &self.settings.worker_id
    }
    fn idle(&self) -> &Notify {
        &self.idle
    }
}

/// Handle to a started worker.
pub struct WorkerHandle {
    shutdown: CancellationToken,
    loop_done: Option<oneshot::Receiver<()>>,
    stats: Arc<dyn StatsSource>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("worker", &self.stats.worker_id())
            .field("stats", &self.stats.stats())
            .finish_non_exhaustive()
    }
}

impl WorkerHandle {
    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> WorkerStats {
        self.stats.stats()
    }

    /// Token that stops the worker when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop receiving, wait for in-flight units up to the drain timeout, then
    /// cancel whatever is still running.
    pub async fn shutdown(&mut self) -> WorkerStats {
        self.shutdown.cancel();
        if let Some(done) = self.loop_done.take() {
            let _ = done.await;
        }

        let drain_timeout = self.stats.drain_timeout();
        if tokio::time::timeout(drain_timeout, self.wait_idle()).await.is_err() {
            tracing::warn!(
                worker = %self.stats.worker_id(),
                in_flight = self.stats.stats().in_flight,
                "drain timeout elapsed, cancelling in-flight tasks"
            );
            self.stats.leases().cancel_all();
            let _ = tokio::time::timeout(drain_timeout, self.wait_idle()).await;
        }

        let stats = self.stats.stats();
        tracing::info!(worker = %self.stats.worker_id(), ?stats, "worker stopped");
        stats
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.stats.idle().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.stats.stats().in_flight == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn poll_loop<E, S>(shared: Arc<WorkerShared<E>>, spawner: S, shutdown: CancellationToken)
where
    E: TaskExecutor,
    S: Spawn,
{
    let slots = Arc::new(Semaphore::new(shared.settings.max_concurrency.max(1)));
    loop {
        let first = tokio::select! {
            () = shutdown.cancelled() => break,
            permit = Arc::clone(&slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let capacity = (slots.available_permits() + 1).min(shared.settings.batch_size.max(1));
        let received = tokio::select! {
            () = shutdown.cancelled() => break,
            received = shared.broker.receive(capacity, shared.settings.receive_wait) => received,
        };

        let deliveries = match received {
            Ok(deliveries) => deliveries,
            Err(e) => {
                tracing::warn!(worker = %shared.settings.worker_id, error = %e, "receive failed");
                drop(first);
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(shared.settings.error_backoff) => continue,
                }
            }
        };

        let mut first = Some(first);
        for delivery in deliveries {
            shared.counters.received.fetch_add(1, Ordering::Relaxed);
            let permit = match first.take() {
                Some(permit) => permit,
                None => match Arc::clone(&slots).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!(task_id = %delivery.task_id, "no free slot, delivery left for redelivery");
                        continue;
                    }
                },
            };
            shared.counters.in_flight.fetch_add(1, Ordering::AcqRel);
            let guard = UnitGuard {
                shared: Arc::clone(&shared),
                _permit: Some(permit),
            };
            let unit_shared = Arc::clone(&shared);
            spawner.spawn(async move {
                process_delivery(&unit_shared, delivery).await;
                drop(guard);
            });
        }
    }
    tracing::debug!(worker = %shared.settings.worker_id, "polling loop stopped");
}

async fn process_delivery<E: TaskExecutor>(shared: &WorkerShared<E>, delivery: Delivery) {
    let task_id = delivery.task_id.clone();
    let key = delivery.logical_key.clone();

    if shared.leases.contains(&task_id) {
        tracing::debug!(task_id = %task_id, "delivery of a task already executing here");
        shared.counters.deferred.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let admission = match shared.ledger.try_begin(&key, &task_id, now_ms()).await {
        Ok(admission) => admission,
        Err(e) => {
            tracing::error!(task_id = %task_id, logical_key = %key, error = %e, "ledger unavailable, delivery left for redelivery");
            return;
        }
    };

    match admission {
        Admission::AlreadyDone(record) => {
            tracing::info!(
                task_id = %task_id,
                logical_key = %key,
                status = record.status.as_str(),
                "duplicate delivery answered from ledger"
            );
            shared.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            audit(shared, &task_id, &key, "duplicate", None);
            if let Some(outcome) = record.outcome_for(&task_id) {
                report(shared, outcome).await;
            }
            acknowledge(shared, &delivery).await;
        }
        Admission::AlreadyRunning { owner } => {
            tracing::debug!(task_id = %task_id, logical_key = %key, owner = %owner, "another attempt is running, deferring");
            shared.counters.deferred.fetch_add(1, Ordering::Relaxed);
        }
        Admission::Admitted {
            attempt,
            reclaimed_from,
        } => {
            if let Some(previous) = &reclaimed_from {
                tracing::warn!(task_id = %task_id, logical_key = %key, previous = %previous, attempt, "stale lease reclaimed");
                audit(shared, &task_id, &key, "reclaimed", Some(format!("from {previous}")));
            }
            audit(shared, &task_id, &key, "admitted", Some(format!("attempt {attempt}")));
            execute_admitted(shared, delivery, attempt).await;
        }
    }
}

async fn execute_admitted<E: TaskExecutor>(shared: &WorkerShared<E>, delivery: Delivery, attempt: u32) {
    let task_id = delivery.task_id.clone();
    let key = delivery.logical_key.clone();

    let Some(token) = shared.leases.register(&task_id) else {
        tracing::debug!(task_id = %task_id, "task registered concurrently, skipping");
        return;
    };

    let execution = run_with_heartbeat(shared, &delivery, attempt, token.clone()).await;
    shared.leases.release(&task_id);

    // a body that finished before observing the signal keeps its result
    let cancelled = token.is_cancelled();
    let (mut write, blob) = match execution {
        Execution::LeaseLost => {
            tracing::warn!(task_id = %task_id, logical_key = %key, attempt, "lease lost, abandoning attempt");
            return;
        }
        Execution::Finished(Ok(bytes)) => {
            (TerminalWrite::success(shared.settings.result_key(&key, attempt)), bytes)
        }
        Execution::Cancelled | Execution::Finished(Err(_)) if cancelled => {
            cancelled_blob(shared, &key, attempt)
        }
        Execution::Cancelled => cancelled_blob(shared, &key, attempt),
        Execution::Finished(Err(e)) => failure_blob(shared, &key, attempt, e.message),
        Execution::Panicked(message) => {
            failure_blob(shared, &key, attempt, format!("task panicked: {message}"))
        }
    };

    if let Some(result_key) = write.result_ref.clone() {
        let store = shared.broker.object_store();
        let stored = retry_transient("put_result", &shared.broker.settings().retry, || {
            store.put(&result_key, blob.clone())
        })
        .await;
        match stored {
            Ok(()) => {}
            Err(e) if e.is_indeterminate() => {
                tracing::error!(task_id = %task_id, logical_key = %key, error = %e, "result blob not stored, delivery left for redelivery");
                return;
            }
            Err(e) => {
                // a rejection repeats on every redelivery; settle the key instead
                tracing::error!(task_id = %task_id, logical_key = %key, result_key = %result_key, error = %e, "result store refused blob, recording failure");
                write = TerminalWrite::failure(FailureKind::ResultRejected, None);
            }
        }
    }
    let result_ref = write.result_ref.clone();

    let completion = match shared.ledger.complete(&key, &task_id, attempt, write, now_ms()).await {
        Ok(completion) => completion,
        Err(e @ LedgerError::LeaseLost { .. }) => {
            tracing::warn!(task_id = %task_id, logical_key = %key, attempt, error = %e, "lease reclaimed before terminal write, abandoning attempt");
            if let Some(result_key) = &result_ref {
                discard_result(shared, result_key).await;
            }
            return;
        }
        Err(e) => {
            tracing::error!(task_id = %task_id, logical_key = %key, error = %e, "terminal ledger write failed");
            return;
        }
    };

    let record = match completion {
        Completion::Recorded(record) => {
            let action = match record.failure {
                None => {
                    shared.counters.completed.fetch_add(1, Ordering::Relaxed);
                    "completed"
                }
                Some(FailureKind::Cancelled) => {
                    shared.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                    "cancelled"
                }
                Some(_) => {
                    shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                    "failed"
                }
            };
            tracing::info!(task_id = %task_id, logical_key = %key, attempt, outcome = action, "attempt recorded");
            audit(shared, &task_id, &key, action, None);
            record
        }
        Completion::AlreadyTerminal(record) => {
            tracing::info!(
                task_id = %task_id,
                logical_key = %key,
                attempt,
                status = record.status.as_str(),
                "earlier terminal write won"
            );
            if let Some(result_key) = &result_ref {
                if record.result_ref.as_ref() != Some(result_key) {
                    discard_result(shared, result_key).await;
                }
            }
            record
        }
    };

    if let Some(outcome) = record.outcome_for(&task_id) {
        report(shared, outcome).await;
    }
    acknowledge(shared, &delivery).await;
}

async fn run_with_heartbeat<E: TaskExecutor>(
    shared: &WorkerShared<E>,
    delivery: &Delivery,
    attempt: u32,
    token: CancellationToken,
) -> Execution {
    let ctx = TaskContext::new(
        delivery.task_id.clone(),
        delivery.logical_key.clone(),
        attempt,
        delivery.receive_count,
        token.clone(),
    );
    let work = AssertUnwindSafe(shared.executor.execute(delivery.payload.clone(), ctx)).catch_unwind();
    tokio::pin!(work);

    let interval = shared.settings.heartbeat_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            result = &mut work => {
                return match result {
                    Ok(result) => Execution::Finished(result),
                    Err(panic) => Execution::Panicked(panic_message(panic.as_ref())),
                };
            }
            () = token.cancelled() => return Execution::Cancelled,
            _ = ticker.tick() => {
                if !renew(shared, delivery, attempt, interval).await {
                    token.cancel();
                    return Execution::LeaseLost;
                }
            }
        }
    }
}

/// Refresh the ledger heartbeat and keep the message hidden. Returns `false`
/// only when the ledger says another attempt now holds the key.
async fn renew<E>(shared: &WorkerShared<E>, delivery: &Delivery, attempt: u32, interval: Duration) -> bool {
    match shared
        .ledger
        .heartbeat(&delivery.logical_key, &delivery.task_id, attempt, now_ms())
        .await
    {
        Ok(true) => {}
        Ok(false) => return false,
        Err(e) => {
            tracing::warn!(task_id = %delivery.task_id, error = %e, "heartbeat failed");
        }
    }
    let extension = shared.broker.settings().visibility_timeout.max(interval * 2);
    if let Err(e) = shared.broker.extend_visibility(&delivery.receipt, extension).await {
        tracing::warn!(task_id = %delivery.task_id, error = %e, "visibility extension failed");
    }
    true
}

fn cancelled_blob<E>(
    shared: &WorkerShared<E>,
    key: &LogicalKey,
    attempt: u32,
) -> (TerminalWrite, Vec<u8>) {
    let payload = ErrorPayload {
        kind: FailureKind::Cancelled.as_str().into(),
        message: "cancelled by request".into(),
    };
    (
        TerminalWrite::failure(
            FailureKind::Cancelled,
            Some(shared.settings.result_key(key, attempt)),
        ),
        encode_error(&payload),
    )
}

fn failure_blob<E>(
    shared: &WorkerShared<E>,
    key: &LogicalKey,
    attempt: u32,
    message: String,
) -> (TerminalWrite, Vec<u8>) {
    tracing::warn!(logical_key = %key, attempt, error = %message, "task failed");
    let payload = ErrorPayload {
        kind: FailureKind::Logic.as_str().into(),
        message,
    };
    (
        TerminalWrite::failure(FailureKind::Logic, Some(shared.settings.result_key(key, attempt))),
        encode_error(&payload),
    )
}

fn encode_error(payload: &ErrorPayload) -> Vec<u8> {
    serde_json::to_vec(payload).unwrap_or_else(|_| payload.message.clone().into_bytes())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into())
}

async fn discard_result<E>(shared: &WorkerShared<E>, result_key: &str) {
    if let Err(e) = shared.broker.object_store().delete(result_key).await {
        tracing::debug!(result_key, error = %e, "superseded result blob not removed");
    }
}

async fn report<E>(shared: &WorkerShared<E>, outcome: TaskOutcome) {
    let task_id = outcome.task_id.clone();
    match shared.mailbox.deliver(outcome).await {
        Ok(true) => tracing::debug!(task_id = %task_id, "outcome delivered to mailbox"),
        Ok(false) => tracing::debug!(task_id = %task_id, "mailbox already holds an outcome"),
        Err(e) => tracing::warn!(task_id = %task_id, error = %e, "mailbox delivery failed"),
    }
}

async fn acknowledge<E>(shared: &WorkerShared<E>, delivery: &Delivery) {
    if let Err(e) = shared.broker.acknowledge(delivery).await {
        log_ack_error(&delivery.task_id, &e);
    }
}

fn log_ack_error(task_id: &TaskId, error: &RelayError) {
    tracing::warn!(task_id = %task_id, error = %error, "delete failed, message will be redelivered");
}

fn audit<E>(
    shared: &WorkerShared<E>,
    task_id: &TaskId,
    key: &LogicalKey,
    action: &str,
    detail: Option<String>,
) {
    if let Some(sink) = shared.audit.lock().as_mut() {
        let event = build_audit_event(
            task_id.as_str(),
            key.as_str(),
            shared.settings.worker_id.as_str(),
            action,
            detail,
        );
        sink.record(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_keys_are_per_attempt() {
        let settings = WorkerSettings::default();
        let second = settings.result_key(&"order-7".into(), 2);
        assert!(second.starts_with("results/"));
        assert!(second.ends_with("/attempt-2"));
        assert_eq!(
            second.replace("attempt-2", "attempt-3"),
            settings.result_key(&"order-7".into(), 3)
        );
    }

    #[test]
    fn result_keys_never_carry_path_segments_from_the_logical_key() {
        let settings = WorkerSettings::default();
        for raw in ["tenant/../report", "..", "/abs/path", "a//b", "./x"] {
            let key = settings.result_key(&raw.into(), 1);
            let segments: Vec<&str> = key.split('/').collect();
            assert_eq!(segments.len(), 3, "{key}");
            assert_eq!(segments[1].len(), 64);
            assert!(segments[1].chars().all(|c| c.is_ascii_hexdigit()), "{key}");
        }
        assert_ne!(
            settings.result_key(&"tenant/a".into(), 1),
            settings.result_key(&"tenant/b".into(), 1)
        );
    }

    #[test]
    fn panic_messages_are_extracted() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }

    #[test]
    fn default_concurrency_is_positive() {
        assert!(WorkerSettings::default().max_concurrency >= 1);
    }
}
