//! Integration tests for cooperative cancellation over the side channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prometheus_task_relay::core::{
    BrokerSettings, CancellationChannel, CancellationListener, Completion, FailureKind,
    IdempotencyLedger, LedgerStatus, ListenerSettings, PollStatus, QueueBroker, Submitter,
    SubmitterSettings, TaskContext, TaskError, TaskExecutor, TerminalWrite, WorkerLeases,
    WorkerRuntime, WorkerSettings, WorkerStats,
};
use prometheus_task_relay::infra::{InMemoryLedger, InMemoryMailbox, InMemoryObjectStore, InMemoryQueue};
use prometheus_task_relay::runtime::TokioSpawner;
use prometheus_task_relay::util::backoff::RetryPolicy;
use prometheus_task_relay::util::clock::now_ms;
use prometheus_task_relay::util::serde::{LogicalKey, TaskId};

// Executor that runs until cancelled, unless told to finish quickly.
#[derive(Clone, Default)]
struct StoppableExecutor {
    started: Arc<AtomicUsize>,
}

#[async_trait]
impl TaskExecutor for StoppableExecutor {
    async fn execute(&self, payload: Vec<u8>, ctx: TaskContext) -> Result<Vec<u8>, TaskError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        if payload == b"quick" {
            return Ok(b"done".to_vec());
        }
        tokio::select! {
            () = ctx.cancelled() => Err(TaskError::new("stopped on request")),
            () = tokio::time::sleep(Duration::from_secs(30)) => Ok(payload),
        }
    }
}

struct Fixture {
    broker: QueueBroker,
    channel: CancellationChannel,
    ledger: Arc<InMemoryLedger>,
    mailbox: Arc<InMemoryMailbox>,
}

impl Fixture {
    fn new() -> Self {
        let store = Arc::new(InMemoryObjectStore::new());
        let settings = BrokerSettings {
            retry: RetryPolicy::no_retry(),
            ..BrokerSettings::default()
        };
        let broker = QueueBroker::new(
            Arc::new(InMemoryQueue::new("tasks")),
            store.clone(),
            settings.clone(),
        )
        .unwrap();
        let channel = CancellationChannel::new(
            QueueBroker::new(Arc::new(InMemoryQueue::new("cancellations")), store, settings)
                .unwrap(),
        );
        Self {
            broker,
            channel,
            ledger: Arc::new(InMemoryLedger::new(Duration::from_secs(60))),
            mailbox: Arc::new(InMemoryMailbox::new()),
        }
    }

    fn listener_settings() -> ListenerSettings {
        ListenerSettings {
            wait: Duration::from_millis(20),
            requeue_delay: Duration::from_millis(30),
            error_backoff: Duration::from_millis(10),
            ..ListenerSettings::default()
        }
    }

    fn worker(&self, executor: StoppableExecutor) -> WorkerRuntime<StoppableExecutor> {
        let settings = WorkerSettings {
            worker_id: "worker-cancel".into(),
            max_concurrency: 2,
            receive_wait: Duration::from_millis(20),
            heartbeat_interval: Duration::from_millis(100),
            drain_timeout: Duration::from_secs(2),
            listener: Self::listener_settings(),
            ..WorkerSettings::default()
        };
        WorkerRuntime::new(
            self.broker.clone(),
            self.ledger.clone(),
            self.mailbox.clone(),
            executor,
            settings,
        )
        .with_cancellation(self.channel.clone())
    }

    fn submitter(&self) -> Submitter {
        Submitter::new(
            self.broker.clone(),
            self.channel.clone(),
            self.ledger.clone(),
            self.mailbox.clone(),
            SubmitterSettings {
                poll_interval: Duration::from_millis(10),
                max_poll_wait: Duration::from_millis(500),
                default_timeout: Duration::from_secs(10),
            },
        )
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_cancel_reaches_running_task() {
    let fx = Fixture::new();
    let executor = StoppableExecutor::default();
    let mut worker = fx.worker(executor.clone()).start(TokioSpawner::current());
    let submitter = fx.submitter();

    let handle = submitter
        .submit(b"long".to_vec(), "render-1", Duration::from_secs(10))
        .await
        .unwrap();
    wait_until(|| worker.stats().in_flight == 1).await;

    submitter.request_cancel(&handle).await.unwrap();
    assert!(submitter.cancel_requested(&handle));
    assert_eq!(submitter.wait(&handle).await.unwrap(), PollStatus::Cancelled);

    let record = fx.ledger.get(&LogicalKey::new("render-1")).await.unwrap().unwrap();
    assert_eq!(record.failure, Some(FailureKind::Cancelled));

    let stats: WorkerStats = worker.shutdown().await;
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.completed, 0);
    assert_eq!(executor.started.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancel_published_before_pickup_still_lands() {
    let fx = Fixture::new();
    let executor = StoppableExecutor::default();
    let submitter = fx.submitter();

    // The notice is out before any worker has the task.
    let handle = submitter
        .submit(b"long".to_vec(), "render-2", Duration::from_secs(10))
        .await
        .unwrap();
    submitter.request_cancel(&handle).await.unwrap();

    let mut worker = fx.worker(executor).start(TokioSpawner::current());
    assert_eq!(submitter.wait(&handle).await.unwrap(), PollStatus::Cancelled);
    worker.shutdown().await;
}

#[tokio::test]
async fn test_cancel_after_completion_keeps_result() {
    let fx = Fixture::new();
    let mut worker = fx.worker(StoppableExecutor::default()).start(TokioSpawner::current());
    let submitter = fx.submitter();

    let handle = submitter
        .submit(b"quick".to_vec(), "thumb-1", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(submitter.wait(&handle).await.unwrap(), PollStatus::Done(b"done".to_vec()));

    submitter.request_cancel(&handle).await.unwrap();
    assert_eq!(submitter.poll(&handle).await.unwrap(), PollStatus::Done(b"done".to_vec()));
    worker.shutdown().await;
}

#[tokio::test]
async fn test_notice_for_foreign_task_is_requeued_then_expires() {
    let fx = Fixture::new();
    let leases = Arc::new(WorkerLeases::new());
    let settings = ListenerSettings {
        notice_ttl: Duration::from_millis(80),
        ..Fixture::listener_settings()
    };
    let listener = CancellationListener::new(fx.channel.clone(), leases, settings);

    fx.channel.publish(&TaskId::from("elsewhere")).await.unwrap();

    let report = listener.drain_once().await.unwrap();
    assert_eq!(report.requeued, 1);
    assert_eq!(report.cancelled, 0);

    tokio::time::sleep(Duration::from_millis(120)).await;
    let report = listener.drain_once().await.unwrap();
    assert_eq!(report.discarded, 1);

    let depth = fx.channel.broker().depth().await.unwrap();
    assert_eq!(depth.visible + depth.in_flight, 0);
}

#[tokio::test]
async fn test_unknown_handle_cannot_be_cancelled() {
    let fx = Fixture::new();
    let submitter = fx.submitter();
    let other = fx.submitter();
    let handle = other
        .submit(b"long".to_vec(), "render-3", Duration::from_secs(10))
        .await
        .unwrap();

    let err = submitter.request_cancel(&handle).await.unwrap_err();
    assert!(err.to_string().contains("unknown task"), "{err}");

    // The external terminate path does not need a tracked handle.
    submitter.terminate(&handle.task_id).await.unwrap();
}

#[tokio::test]
async fn test_completion_and_cancellation_race_has_one_winner() {
    let ledger = Arc::new(InMemoryLedger::new(Duration::from_secs(60)));

    for round in 0..50 {
        let key = LogicalKey::new(format!("race-{round}"));
        let owner = TaskId::from(format!("t-{round}"));
        ledger.try_begin(&key, &owner, now_ms()).await.unwrap();

        let finish = {
            let ledger = ledger.clone();
            let key = key.clone();
            let owner = owner.clone();
            tokio::spawn(async move {
                ledger
                    .complete(&key, &owner, 1, TerminalWrite::success("results/ok"), now_ms())
                    .await
            })
        };
        let cancel = {
            let ledger = ledger.clone();
            let key = key.clone();
            let owner = owner.clone();
            tokio::spawn(async move {
                let write = TerminalWrite::failure(FailureKind::Cancelled, Some("results/cancelled".into()));
                ledger.complete(&key, &owner, 1, write, now_ms()).await
            })
        };
        let finished = finish.await.unwrap().unwrap();
        let cancelled = cancel.await.unwrap().unwrap();

        let recorded = [&finished, &cancelled]
            .iter()
            .filter(|c| matches!(c, Completion::Recorded(_)))
            .count();
        assert_eq!(recorded, 1, "exactly one terminal write lands");

        let record = ledger.get(&key).await.unwrap().unwrap();
        if matches!(finished, Completion::Recorded(_)) {
            assert_eq!(record.status, LedgerStatus::Completed);
            assert_eq!(record.failure, None);
        } else {
            assert_eq!(record.status, LedgerStatus::Failed);
            assert_eq!(record.failure, Some(FailureKind::Cancelled));
        }
    }
}
