//! Relay configuration structures.
//!
//! Every struct rejects unknown fields: an option the relay does not act on
//! is an error, not a silent no-op.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::autoscaler::AutoscalerPolicy;
use crate::core::broker::BrokerSettings;
use crate::core::cancellation::ListenerSettings;
use crate::core::submission::SubmitterSettings;
use crate::core::worker::WorkerSettings;
use crate::infra::queue::QueueOptions;
use crate::util::backoff::RetryPolicy;

/// Environment variable naming the JSON config file.
pub const CONFIG_PATH_ENV: &str = "RELAY_CONFIG_PATH";

/// One queue (task queue or cancellation channel).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    /// Queue name, used in logs.
    pub name: String,
    /// Queue behaviour switches.
    #[serde(default)]
    pub options: QueueOptions,
}

impl QueueConfig {
    fn named(name: &str) -> Self {
        Self {
            name: name.into(),
            options: QueueOptions::default(),
        }
    }
}

/// Broker settings shared by the task queue and the cancellation channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    /// Main task queue.
    pub task_queue: QueueConfig,
    /// Cancellation side channel.
    pub cancel_queue: QueueConfig,
    /// Payloads above this size are offloaded to the object store.
    pub inline_limit_bytes: usize,
    /// Key prefix for offloaded payloads.
    pub payload_prefix: String,
    /// Visibility timeout applied on receive, in seconds.
    pub visibility_timeout_secs: u64,
    /// Retry policy for queue and object-store calls.
    pub retry: RetryPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            task_queue: QueueConfig::named("relay-tasks"),
            cancel_queue: QueueConfig::named("relay-cancellations"),
            inline_limit_bytes: 256 * 1024,
            payload_prefix: "payloads".into(),
            visibility_timeout_secs: 30,
            retry: RetryPolicy::default(),
        }
    }
}

/// Object store backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum ObjectStoreConfig {
    /// In-memory store for development and tests.
    InMemory,
    /// Directory on the local filesystem.
    File {
        /// Store root.
        root: PathBuf,
    },
}

/// Ledger backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum LedgerBackendConfig {
    /// In-memory ledger.
    InMemory,
    /// SQLite database.
    Sqlite {
        /// Connection URL, e.g. `sqlite://relay.db` or `sqlite::memory:`.
        url: String,
        /// Pool size.
        #[serde(default = "LedgerBackendConfig::default_max_connections")]
        max_connections: u32,
    },
}

impl LedgerBackendConfig {
    const fn default_max_connections() -> u32 {
        4
    }
}

/// Idempotency ledger configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerConfig {
    /// Backend.
    pub backend: LedgerBackendConfig,
    /// A running record without a heartbeat for this long may be reclaimed.
    pub stale_after_secs: u64,
    /// Terminal records and stored outcomes are kept this long to absorb
    /// late redeliveries.
    pub retention_secs: u64,
    /// Period of the retention sweep; `0` disables it.
    pub sweep_interval_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackendConfig::InMemory,
            stale_after_secs: 60,
            retention_secs: 24 * 60 * 60,
            sweep_interval_secs: 300,
        }
    }
}

/// Result mailbox backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum MailboxConfig {
    /// In-memory mailbox.
    InMemory,
    /// JSON-lines file.
    File {
        /// Directory holding the file.
        dir: PathBuf,
        /// Stream name; the file is `<stream>_outcomes.jsonl`.
        stream: String,
    },
}

/// Worker runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// Worker identifier; generated when absent.
    pub worker_id: Option<String>,
    /// Concurrent units; the CPU count when absent.
    pub max_concurrency: Option<usize>,
    /// Messages fetched per receive.
    pub batch_size: usize,
    /// Long-poll wait per receive, in milliseconds.
    pub receive_wait_ms: u64,
    /// Heartbeat and visibility renewal period, in seconds.
    pub heartbeat_interval_secs: u64,
    /// Shutdown drain timeout, in seconds.
    pub drain_timeout_secs: u64,
    /// Key prefix for result blobs.
    pub result_prefix: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            max_concurrency: None,
            batch_size: 10,
            receive_wait_ms: 1_000,
            heartbeat_interval_secs: 10,
            drain_timeout_secs: 30,
            result_prefix: "results".into(),
        }
    }
}

/// Submission loop configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SubmitterConfig {
    /// Pause between result checks, in milliseconds.
    pub poll_interval_ms: u64,
    /// Longest single poll, in milliseconds.
    pub max_poll_wait_ms: u64,
    /// Task timeout when the caller gives none, in seconds.
    pub default_timeout_secs: u64,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            max_poll_wait_ms: 5_000,
            default_timeout_secs: 300,
        }
    }
}

/// Cancellation listener configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CancellationConfig {
    /// Notices fetched per receive.
    pub batch_size: usize,
    /// Long-poll wait per receive, in milliseconds.
    pub wait_ms: u64,
    /// Hide an unmatched notice for this long before peers see it, in ms.
    pub requeue_delay_ms: u64,
    /// Drop unmatched notices older than this, in seconds.
    pub notice_ttl_secs: u64,
}

impl Default for CancellationConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            wait_ms: 1_000,
            requeue_delay_ms: 1_000,
            notice_ttl_secs: 300,
        }
    }
}

/// Root relay configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    /// Queues and broker behaviour.
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Object store backend.
    #[serde(default = "RelayConfig::default_object_store")]
    pub object_store: ObjectStoreConfig,
    /// Idempotency ledger.
    #[serde(default)]
    pub ledger: LedgerConfig,
    /// Result mailbox backend.
    #[serde(default = "RelayConfig::default_mailbox")]
    pub mailbox: MailboxConfig,
    /// Worker runtime.
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Submission loop.
    #[serde(default)]
    pub submitter: SubmitterConfig,
    /// Cancellation listener.
    #[serde(default)]
    pub cancellation: CancellationConfig,
    /// Autoscaler; disabled when absent.
    #[serde(default)]
    pub autoscaler: Option<AutoscalerPolicy>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            object_store: Self::default_object_store(),
            ledger: LedgerConfig::default(),
            mailbox: Self::default_mailbox(),
            worker: WorkerConfig::default(),
            submitter: SubmitterConfig::default(),
            cancellation: CancellationConfig::default(),
            autoscaler: None,
        }
    }
}

impl QueueConfig {
    /// Validate queue values.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must not be empty".into());
        }
        if self.options.max_body_bytes == 0 {
            return Err("max_body_bytes must be greater than 0".into());
        }
        Ok(())
    }
}

impl BrokerConfig {
    /// Validate broker values.
    pub fn validate(&self) -> Result<(), String> {
        self.task_queue
            .validate()
            .map_err(|e| format!("task_queue invalid: {e}"))?;
        self.cancel_queue
            .validate()
            .map_err(|e| format!("cancel_queue invalid: {e}"))?;
        if self.task_queue.name == self.cancel_queue.name {
            return Err("task_queue and cancel_queue must be distinct".into());
        }
        if self.inline_limit_bytes == 0 {
            return Err("inline_limit_bytes must be greater than 0".into());
        }
        if self.inline_limit_bytes > self.task_queue.options.max_body_bytes {
            return Err("inline_limit_bytes must not exceed task_queue max_body_bytes".into());
        }
        if self.inline_limit_bytes > self.cancel_queue.options.max_body_bytes {
            return Err("inline_limit_bytes must not exceed cancel_queue max_body_bytes".into());
        }
        if self.visibility_timeout_secs == 0 {
            return Err("visibility_timeout_secs must be greater than 0".into());
        }
        self.retry.validate().map_err(|e| format!("retry invalid: {e}"))
    }

    /// Broker settings for the task queue.
    #[must_use]
    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            inline_limit_bytes: self.inline_limit_bytes,
            payload_prefix: self.payload_prefix.clone(),
            visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
            retry: self.retry.clone(),
        }
    }
}

impl WorkerConfig {
    /// Validate worker values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrency == Some(0) {
            return Err("max_concurrency must be greater than 0".into());
        }
        if self.batch_size == 0 {
            return Err("batch_size must be greater than 0".into());
        }
        if self.heartbeat_interval_secs == 0 {
            return Err("heartbeat_interval_secs must be greater than 0".into());
        }
        Ok(())
    }
}

impl SubmitterConfig {
    /// Validate submitter values.
    pub fn validate(&self) -> Result<(), String> {
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be greater than 0".into());
        }
        if self.default_timeout_secs == 0 {
            return Err("default_timeout_secs must be greater than 0".into());
        }
        Ok(())
    }

    /// Submitter settings.
    #[must_use]
    pub const fn submitter_settings(&self) -> SubmitterSettings {
        SubmitterSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_poll_wait: Duration::from_millis(self.max_poll_wait_ms),
            default_timeout: Duration::from_secs(self.default_timeout_secs),
        }
    }
}

impl CancellationConfig {
    /// Validate cancellation values.
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("batch_size must be greater than 0".into());
        }
        if u128::from(self.requeue_delay_ms) >= u128::from(self.notice_ttl_secs) * 1_000 {
            return Err("requeue_delay_ms must be shorter than notice_ttl_secs".into());
        }
        Ok(())
    }

    /// Listener settings.
    #[must_use]
    pub fn listener_settings(&self) -> ListenerSettings {
        ListenerSettings {
            batch_size: self.batch_size,
            wait: Duration::from_millis(self.wait_ms),
            requeue_delay: Duration::from_millis(self.requeue_delay_ms),
            notice_ttl: Duration::from_secs(self.notice_ttl_secs),
            ..ListenerSettings::default()
        }
    }
}

impl RelayConfig {
    fn default_object_store() -> ObjectStoreConfig {
        ObjectStoreConfig::InMemory
    }

    fn default_mailbox() -> MailboxConfig {
        MailboxConfig::InMemory
    }

    /// Validate every section and the constraints between them.
    pub fn validate(&self) -> Result<(), String> {
        self.broker
            .validate()
            .map_err(|e| format!("broker invalid: {e}"))?;
        self.worker
            .validate()
            .map_err(|e| format!("worker invalid: {e}"))?;
        self.submitter
            .validate()
            .map_err(|e| format!("submitter invalid: {e}"))?;
        self.cancellation
            .validate()
            .map_err(|e| format!("cancellation invalid: {e}"))?;
        if let Some(policy) = &self.autoscaler {
            policy
                .validate()
                .map_err(|e| format!("autoscaler invalid: {e}"))?;
        }
        if let ObjectStoreConfig::File { root } = &self.object_store {
            if root.as_os_str().is_empty() {
                return Err("object_store root must not be empty".into());
            }
        }
        if let MailboxConfig::File { stream, .. } = &self.mailbox {
            if stream.trim().is_empty() {
                return Err("mailbox stream must not be empty".into());
            }
        }
        if self.ledger.stale_after_secs <= self.worker.heartbeat_interval_secs {
            return Err(
                "ledger stale_after_secs must exceed worker heartbeat_interval_secs".into(),
            );
        }
        if self.ledger.retention_secs <= self.ledger.stale_after_secs {
            return Err("ledger retention_secs must exceed stale_after_secs".into());
        }
        if self.broker.visibility_timeout_secs <= self.worker.heartbeat_interval_secs {
            return Err(
                "broker visibility_timeout_secs must exceed worker heartbeat_interval_secs".into(),
            );
        }
        Ok(())
    }

    /// Worker settings, filling in generated and hardware defaults.
    #[must_use]
    pub fn worker_settings(&self) -> WorkerSettings {
        let defaults = WorkerSettings::default();
        WorkerSettings {
            worker_id: self.worker.worker_id.clone().unwrap_or(defaults.worker_id),
            max_concurrency: self.worker.max_concurrency.unwrap_or(defaults.max_concurrency),
            batch_size: self.worker.batch_size,
            receive_wait: Duration::from_millis(self.worker.receive_wait_ms),
            heartbeat_interval: Duration::from_secs(self.worker.heartbeat_interval_secs),
            drain_timeout: Duration::from_secs(self.worker.drain_timeout_secs),
            result_prefix: self.worker.result_prefix.clone(),
            listener: self.cancellation.listener_settings(),
            ..defaults
        }
    }

    /// Ledger stale timeout.
    #[must_use]
    pub const fn stale_after(&self) -> Duration {
        Duration::from_secs(self.ledger.stale_after_secs)
    }

    /// Retention window for terminal records and outcomes.
    #[must_use]
    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.ledger.retention_secs)
    }

    /// Parse relay configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        Self::from_json_str(&input)
    }

    /// Load `.env` if present, then read the file named by
    /// `RELAY_CONFIG_PATH`. Falls back to defaults when the variable is unset.
    pub fn load() -> Result<Self, String> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                return Err(format!("cannot load .env: {e}"));
            }
        }
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(path),
            Err(std::env::VarError::NotPresent) => {
                let cfg = Self::default();
                cfg.validate()?;
                Ok(cfg)
            }
            Err(e) => Err(format!("{CONFIG_PATH_ENV}: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_valid_defaults() {
        let cfg = RelayConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg, RelayConfig::default());
        assert_eq!(cfg.broker.inline_limit_bytes, 256 * 1024);
        assert!(cfg.autoscaler.is_none());
    }

    #[test]
    fn tagged_backends_parse() {
        let cfg = RelayConfig::from_json_str(
            r#"{
                "object_store": {"kind": "file", "root": "/tmp/relay"},
                "ledger": {"backend": {"kind": "sqlite", "url": "sqlite://relay.db"}, "stale_after_secs": 90},
                "mailbox": {"kind": "file", "dir": "/tmp/relay", "stream": "outcomes"}
            }"#,
        )
        .unwrap();
        assert_eq!(
            cfg.ledger.backend,
            LedgerBackendConfig::Sqlite {
                url: "sqlite://relay.db".into(),
                max_connections: 4
            }
        );
        assert!(matches!(cfg.object_store, ObjectStoreConfig::File { .. }));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = RelayConfig::from_json_str(r#"{"worker": {"prefetch": 5}}"#).unwrap_err();
        assert!(err.contains("parse error"), "{err}");
        let err = RelayConfig::from_json_str(r#"{"tracing": true}"#).unwrap_err();
        assert!(err.contains("parse error"), "{err}");
    }

    #[test]
    fn heartbeat_must_beat_stale_timeout() {
        let err = RelayConfig::from_json_str(
            r#"{"ledger": {"stale_after_secs": 5}, "worker": {"heartbeat_interval_secs": 10}}"#,
        )
        .unwrap_err();
        assert!(err.contains("stale_after_secs"), "{err}");
    }

    #[test]
    fn worker_settings_fill_defaults() {
        let cfg = RelayConfig::from_json_str(r#"{"worker": {"worker_id": "w-1"}}"#).unwrap();
        let settings = cfg.worker_settings();
        assert_eq!(settings.worker_id, "w-1");
        assert!(settings.max_concurrency >= 1);
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(10));
    }
}
