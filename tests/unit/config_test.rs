//! Tests for configuration parsing and validation

use prometheus_task_relay::config::{
    LedgerBackendConfig, MailboxConfig, ObjectStoreConfig, RelayConfig,
};

const FULL: &str = r#"{
    "broker": {
        "task_queue": {"name": "renders", "options": {"fifo": true}},
        "cancel_queue": {"name": "renders-cancel"},
        "inline_limit_bytes": 131072,
        "payload_prefix": "render-payloads",
        "visibility_timeout_secs": 45,
        "retry": {"max_attempts": 3, "base_delay_ms": 50, "max_delay_ms": 1000, "jitter": false}
    },
    "object_store": {"kind": "file", "root": "/var/lib/relay/objects"},
    "ledger": {
        "backend": {"kind": "sqlite", "url": "sqlite://relay.db", "max_connections": 8},
        "stale_after_secs": 120,
        "retention_secs": 86400,
        "sweep_interval_secs": 600
    },
    "mailbox": {"kind": "file", "dir": "/var/lib/relay", "stream": "renders"},
    "worker": {"worker_id": "render-1", "max_concurrency": 4, "heartbeat_interval_secs": 15},
    "submitter": {"poll_interval_ms": 250, "max_poll_wait_ms": 2000, "default_timeout_secs": 900},
    "cancellation": {"requeue_delay_ms": 500, "notice_ttl_secs": 600},
    "autoscaler": {"target": "render-workers", "min_workers": 2, "max_workers": 40, "cooldown_seconds": 300}
}"#;

#[test]
fn test_full_config_parses() {
    let cfg = RelayConfig::from_json_str(FULL).unwrap();
    assert!(cfg.broker.task_queue.options.fifo);
    assert_eq!(cfg.broker.retry.max_attempts, 3);
    assert_eq!(
        cfg.ledger.backend,
        LedgerBackendConfig::Sqlite {
            url: "sqlite://relay.db".into(),
            max_connections: 8
        }
    );
    assert!(matches!(cfg.object_store, ObjectStoreConfig::File { .. }));
    assert!(matches!(cfg.mailbox, MailboxConfig::File { ref stream, .. } if stream == "renders"));
    let policy = cfg.autoscaler.as_ref().unwrap();
    assert_eq!(policy.max_workers, 40);
    assert_eq!(policy.cooldown_seconds, 300);

    let worker = cfg.worker_settings();
    assert_eq!(worker.worker_id, "render-1");
    assert_eq!(worker.max_concurrency, 4);
    assert_eq!(worker.listener.requeue_delay.as_millis(), 500);
}

#[test]
fn test_config_round_trips_through_json() {
    let cfg = RelayConfig::from_json_str(FULL).unwrap();
    let json = serde_json::to_string(&cfg).unwrap();
    assert_eq!(RelayConfig::from_json_str(&json).unwrap(), cfg);
}

#[test]
fn test_inline_limit_above_queue_limit_is_invalid() {
    let err = RelayConfig::from_json_str(
        r#"{"broker": {"inline_limit_bytes": 1000000}}"#,
    )
    .unwrap_err();
    assert!(err.contains("inline_limit_bytes"), "{err}");
}

#[test]
fn test_shared_queue_names_are_invalid() {
    let err = RelayConfig::from_json_str(
        r#"{"broker": {"task_queue": {"name": "q"}, "cancel_queue": {"name": "q"}}}"#,
    )
    .unwrap_err();
    assert!(err.contains("distinct"), "{err}");
}

#[test]
fn test_zero_values_are_invalid() {
    for input in [
        r#"{"worker": {"max_concurrency": 0}}"#,
        r#"{"worker": {"batch_size": 0}}"#,
        r#"{"submitter": {"poll_interval_ms": 0}}"#,
        r#"{"broker": {"visibility_timeout_secs": 0}}"#,
        r#"{"cancellation": {"batch_size": 0}}"#,
    ] {
        assert!(RelayConfig::from_json_str(input).is_err(), "{input}");
    }
}

#[test]
fn test_invalid_autoscaler_is_reported() {
    let err = RelayConfig::from_json_str(
        r#"{"autoscaler": {"target": "w", "min_workers": 5, "max_workers": 2}}"#,
    )
    .unwrap_err();
    assert!(err.starts_with("autoscaler invalid"), "{err}");
}

#[test]
fn test_unknown_backend_kind_is_rejected() {
    let err = RelayConfig::from_json_str(r#"{"ledger": {"backend": {"kind": "postgres"}}}"#)
        .unwrap_err();
    assert!(err.contains("parse error"), "{err}");
}

#[test]
fn test_from_file_reads_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.json");
    std::fs::write(&path, FULL).unwrap();
    let cfg = RelayConfig::from_file(&path).unwrap();
    assert_eq!(cfg.broker.task_queue.name, "renders");

    let err = RelayConfig::from_file(dir.path().join("missing.json")).unwrap_err();
    assert!(err.contains("cannot read"), "{err}");
}

