//! Tests for assembling relay components from configuration

use std::time::Duration;

use async_trait::async_trait;
use prometheus_task_relay::builders::RelayComponents;
use prometheus_task_relay::config::RelayConfig;
use prometheus_task_relay::core::{
    IdempotencyLedger, PollStatus, TaskContext, TaskError, TaskExecutor,
};

#[derive(Clone)]
struct Upper;

#[async_trait]
impl TaskExecutor for Upper {
    async fn execute(&self, payload: Vec<u8>, _ctx: TaskContext) -> Result<Vec<u8>, TaskError> {
        Ok(payload.to_ascii_uppercase())
    }
}

async fn run_one(components: &RelayComponents, input: &[u8], key: &str) -> PollStatus {
    let submitter = components.submitter();
    let handle = submitter
        .submit(input.to_vec(), key, Duration::from_secs(5))
        .await
        .unwrap();

    let worker = components.worker(Upper);
    for delivery in components
        .broker()
        .receive(10, Duration::from_millis(50))
        .await
        .unwrap()
    {
        worker.process(delivery).await;
    }
    submitter.poll(&handle).await.unwrap()
}

#[tokio::test]
async fn test_default_components_process_a_task() {
    let components = RelayComponents::build(&RelayConfig::default()).await.unwrap();
    assert_eq!(
        run_one(&components, b"hello", "greeting").await,
        PollStatus::Done(b"HELLO".to_vec())
    );
}

#[tokio::test]
async fn test_file_backends_hold_results() {
    let dir = tempfile::tempdir().unwrap();
    let input = format!(
        r#"{{
            "broker": {{"inline_limit_bytes": 8}},
            "object_store": {{"kind": "file", "root": "{root}/objects"}},
            "mailbox": {{"kind": "file", "dir": "{root}/mailbox", "stream": "relay"}}
        }}"#,
        root = dir.path().display()
    );
    let cfg = RelayConfig::from_json_str(&input).unwrap();
    let components = RelayComponents::build(&cfg).await.unwrap();

    // Larger than the inline limit: the payload goes through the object store.
    assert_eq!(
        run_one(&components, b"offloaded payload", "big").await,
        PollStatus::Done(b"OFFLOADED PAYLOAD".to_vec())
    );
    assert!(dir.path().join("mailbox/relay_outcomes.jsonl").is_file());
    assert!(dir.path().join("objects/results").is_dir());
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_sqlite_ledger_backend() {
    let cfg = RelayConfig::from_json_str(
        r#"{"ledger": {"backend": {"kind": "sqlite", "url": "sqlite::memory:", "max_connections": 1}}}"#,
    )
    .unwrap();
    let components = RelayComponents::build(&cfg).await.unwrap();
    assert_eq!(
        run_one(&components, b"abc", "sql-key").await,
        PollStatus::Done(b"ABC".to_vec())
    );
    let record = components
        .ledger()
        .get(&"sql-key".into())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.attempt_count, 1);
}

#[tokio::test]
async fn test_autoscaler_is_built_only_when_configured() {
    let fleet = std::sync::Arc::new(prometheus_task_relay::infra::InMemoryFleet::new());
    let plain = RelayComponents::build(&RelayConfig::default()).await.unwrap();
    assert!(plain.autoscaler(fleet.clone()).unwrap().is_none());

    let cfg = RelayConfig::from_json_str(r#"{"autoscaler": {"target": "w", "max_workers": 3}}"#)
        .unwrap();
    let scaling = RelayComponents::build(&cfg).await.unwrap();
    let scaler = scaling.autoscaler(fleet).unwrap().unwrap();
    assert_eq!(scaler.policy().max_workers, 3);
}
