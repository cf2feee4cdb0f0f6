//! Configuration models for queues, backends, workers and the autoscaler.

pub mod relay;

pub use relay::{
    BrokerConfig, CancellationConfig, LedgerBackendConfig, LedgerConfig, MailboxConfig,
    ObjectStoreConfig, QueueConfig, RelayConfig, SubmitterConfig, WorkerConfig, CONFIG_PATH_ENV,
};
