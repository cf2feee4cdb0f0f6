//! Tests for relay startup, the API helpers and shutdown

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prometheus_task_relay::builders::RelayComponents;
use prometheus_task_relay::config::RelayConfig;
use prometheus_task_relay::core::{
    AutoscalerPolicy, FleetManager, HealthStatus, InMemoryAuditSink, TaskContext, TaskError,
    TaskExecutor,
};
use prometheus_task_relay::infra::InMemoryFleet;
use prometheus_task_relay::runtime::{
    cancel_task, key_health, submit_task, task_status, Relay, RelayExtras, TaskState,
    TaskSubmission, TokioSpawner,
};

#[derive(Clone)]
struct Sum;

#[async_trait]
impl TaskExecutor for Sum {
    async fn execute(&self, payload: Vec<u8>, _ctx: TaskContext) -> Result<Vec<u8>, TaskError> {
        let numbers: Vec<i64> = TaskContext::decode(&payload)?;
        if numbers.is_empty() {
            return Err(TaskError::new("nothing to add"));
        }
        let total: i64 = numbers.iter().sum();
        serde_json::to_vec(&total).map_err(|e| TaskError::new(e.to_string()))
    }
}

fn fast_config() -> RelayConfig {
    RelayConfig::from_json_str(
        r#"{
            "worker": {"receive_wait_ms": 20, "heartbeat_interval_secs": 1, "drain_timeout_secs": 2},
            "submitter": {"poll_interval_ms": 10, "max_poll_wait_ms": 2000},
            "cancellation": {"wait_ms": 20}
        }"#,
    )
    .unwrap()
}

async fn wait_done(relay: &Relay, handle: prometheus_task_relay::core::TaskHandle) -> TaskState {
    for _ in 0..50 {
        let status = task_status(relay.submitter(), handle.clone()).await.unwrap();
        if status.state != TaskState::Pending {
            return status.state;
        }
    }
    TaskState::Pending
}

#[tokio::test]
async fn test_relay_runs_tasks_through_api() {
    let relay = Relay::startup(&fast_config(), Sum, None).await.unwrap();

    let handle = submit_task(
        relay.submitter(),
        TaskSubmission {
            logical_key: "sum-1".into(),
            payload: serde_json::json!([1, 2, 3]),
            timeout_secs: Some(5),
            group_id: None,
        },
    )
    .await
    .unwrap();
    let status = relay.submitter().wait(&handle).await.unwrap();
    assert_eq!(status, prometheus_task_relay::core::PollStatus::Done(b"6".to_vec()));

    let response = task_status(relay.submitter(), handle.clone()).await.unwrap();
    assert_eq!(response.state, TaskState::Done);
    assert_eq!(response.result, Some(serde_json::json!(6)));

    let health = key_health(relay.submitter(), "sum-1".into()).await.unwrap();
    assert_eq!(health.status, HealthStatus::Completed);

    let health = relay.health().await;
    assert!(health.ok);
    assert_eq!(health.worker.map(|w| w.completed), Some(1));

    let stats = relay.shutdown().await;
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test]
async fn test_logic_failure_is_reported_not_retried() {
    let relay = Relay::startup(&fast_config(), Sum, None).await.unwrap();
    let handle = submit_task(
        relay.submitter(),
        TaskSubmission {
            logical_key: "sum-empty".into(),
            payload: serde_json::json!([]),
            timeout_secs: Some(5),
            group_id: None,
        },
    )
    .await
    .unwrap();

    assert_eq!(wait_done(&relay, handle.clone()).await, TaskState::Failed);
    let response = task_status(relay.submitter(), handle.clone()).await.unwrap();
    assert_eq!(response.reason.as_deref(), Some("nothing to add"));

    // Cancelling a finished task changes nothing.
    cancel_task(relay.submitter(), &handle).await.unwrap();
    let response = task_status(relay.submitter(), handle).await.unwrap();
    assert_eq!(response.state, TaskState::Failed);

    let stats = relay.shutdown().await;
    assert_eq!(stats.failed, 1);
}

#[tokio::test]
async fn test_audit_sink_sees_lifecycle() {
    let components = RelayComponents::build(&fast_config()).await.unwrap();
    let sink = InMemoryAuditSink::new(64);
    let relay = Relay::start(
        components,
        Sum,
        RelayExtras {
            fleet: None,
            audit: Some(Box::new(sink.clone())),
        },
        TokioSpawner::current(),
    )
    .unwrap();

    let handle = relay
        .submitter()
        .submit(b"[4, 5]".to_vec(), "sum-audit", Duration::from_secs(5))
        .await
        .unwrap();
    relay.submitter().wait(&handle).await.unwrap();
    relay.shutdown().await;

    let actions: Vec<String> = sink.events().into_iter().map(|e| e.action).collect();
    assert_eq!(actions, vec!["admitted".to_string(), "completed".to_string()]);
}

#[tokio::test]
async fn test_relay_drives_configured_autoscaler() {
    let mut cfg = fast_config();
    let mut policy = AutoscalerPolicy::new("workers", 1, 5);
    policy.interval_seconds = 1;
    cfg.autoscaler = Some(policy);

    let fleet = Arc::new(InMemoryFleet::with_target("workers", 3));
    let manager: Arc<dyn FleetManager> = fleet.clone();
    let relay = Relay::startup(&cfg, Sum, Some(manager)).await.unwrap();

    // Empty queue with three workers: shrink to the floor.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while fleet.commands().is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(fleet.commands(), vec![("workers".to_string(), 1)]);
    assert_eq!(fleet.current_count("workers").await.unwrap(), 1);

    relay.shutdown().await;
}
