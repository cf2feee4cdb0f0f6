//! Builders to construct relay components from configuration.

use std::sync::Arc;

use anyhow::{bail, Context};

use crate::config::{LedgerBackendConfig, MailboxConfig, ObjectStoreConfig, RelayConfig};
use crate::core::{
    AppResult, Autoscaler, CancellationChannel, FleetManager, IdempotencyLedger, Mailbox,
    ObjectStore, QueueBroker, QueueTransport, Submitter, TaskExecutor, WorkerRuntime,
};
use crate::infra::{
    FileMailbox, FileObjectStore, InMemoryLedger, InMemoryMailbox, InMemoryObjectStore,
    InMemoryQueue,
};

/// Backends and brokers shared by submitters, workers and the autoscaler of
/// one relay.
#[derive(Clone)]
pub struct RelayComponents {
    config: RelayConfig,
    broker: QueueBroker,
    cancellation: CancellationChannel,
    ledger: Arc<dyn IdempotencyLedger>,
    mailbox: Arc<dyn Mailbox>,
}

impl std::fmt::Debug for RelayComponents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayComponents")
            .field("task_queue", &self.config.broker.task_queue.name)
            .field("cancel_queue", &self.config.broker.cancel_queue.name)
            .finish_non_exhaustive()
    }
}

impl RelayComponents {
    /// Validate `cfg` and open every backend it names.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid or a backend cannot be opened.
    pub async fn build(cfg: &RelayConfig) -> AppResult<Self> {
        cfg.validate()
            .map_err(|e| anyhow::anyhow!("config invalid: {e}"))?;

        let store = build_object_store(&cfg.object_store).await?;

        let task_queue: Arc<dyn QueueTransport> = Arc::new(InMemoryQueue::with_options(
            cfg.broker.task_queue.name.clone(),
            cfg.broker.task_queue.options.clone(),
        ));
        let cancel_queue: Arc<dyn QueueTransport> = Arc::new(InMemoryQueue::with_options(
            cfg.broker.cancel_queue.name.clone(),
            cfg.broker.cancel_queue.options.clone(),
        ));
        Self::from_parts(cfg, task_queue, cancel_queue, store)
            .await
            .with_context(|| format!("building relay for `{}`", cfg.broker.task_queue.name))
    }

    /// Build around caller-supplied transports and object store. The ledger
    /// and mailbox still come from `cfg`.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid or a backend cannot be opened.
    pub async fn from_parts(
        cfg: &RelayConfig,
        task_queue: Arc<dyn QueueTransport>,
        cancel_queue: Arc<dyn QueueTransport>,
        store: Arc<dyn ObjectStore>,
    ) -> AppResult<Self> {
        cfg.validate()
            .map_err(|e| anyhow::anyhow!("config invalid: {e}"))?;
        let settings = cfg.broker.broker_settings();
        let broker = QueueBroker::new(task_queue, Arc::clone(&store), settings.clone())
            .context("task queue broker")?;
        let cancellation = CancellationChannel::new(
            QueueBroker::new(cancel_queue, store, settings).context("cancellation broker")?,
        );
        let ledger = build_ledger(cfg).await?;
        let mailbox = build_mailbox(&cfg.mailbox).await?;

        tracing::info!(
            task_queue = %cfg.broker.task_queue.name,
            cancel_queue = %cfg.broker.cancel_queue.name,
            inline_limit = cfg.broker.inline_limit_bytes,
            "relay components built"
        );

        Ok(Self {
            config: cfg.clone(),
            broker,
            cancellation,
            ledger,
            mailbox,
        })
    }

    /// Configuration the components were built from.
    #[must_use]
    pub const fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Task queue broker.
    #[must_use]
    pub const fn broker(&self) -> &QueueBroker {
        &self.broker
    }

    /// Cancellation channel.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationChannel {
        &self.cancellation
    }

    /// Idempotency ledger.
    #[must_use]
    pub fn ledger(&self) -> Arc<dyn IdempotencyLedger> {
        Arc::clone(&self.ledger)
    }

    /// Result mailbox.
    #[must_use]
    pub fn mailbox(&self) -> Arc<dyn Mailbox> {
        Arc::clone(&self.mailbox)
    }

    /// A submitter over these components.
    #[must_use]
    pub fn submitter(&self) -> Submitter {
        Submitter::new(
            self.broker.clone(),
            self.cancellation.clone(),
            self.ledger(),
            self.mailbox(),
            self.config.submitter.submitter_settings(),
        )
    }

    /// A worker runtime over these components, listening for cancellations.
    #[must_use]
    pub fn worker<E: TaskExecutor>(&self, executor: E) -> WorkerRuntime<E> {
        WorkerRuntime::new(
            self.broker.clone(),
            self.ledger(),
            self.mailbox(),
            executor,
            self.config.worker_settings(),
        )
        .with_cancellation(self.cancellation.clone())
    }

    /// The configured autoscaler driving `fleet`, or `None` when disabled.
    ///
    /// # Errors
    ///
    /// Fails if the policy is rejected.
    pub fn autoscaler(&self, fleet: Arc<dyn FleetManager>) -> AppResult<Option<Autoscaler>> {
        let Some(policy) = self.config.autoscaler.clone() else {
            return Ok(None);
        };
        let scaler = Autoscaler::new(policy, self.broker.clone(), fleet).context("autoscaler")?;
        Ok(Some(scaler))
    }
}

async fn build_object_store(cfg: &ObjectStoreConfig) -> AppResult<Arc<dyn ObjectStore>> {
    Ok(match cfg {
        ObjectStoreConfig::InMemory => Arc::new(InMemoryObjectStore::new()),
        ObjectStoreConfig::File { root } => Arc::new(
            FileObjectStore::open(root)
                .await
                .with_context(|| format!("opening object store at {}", root.display()))?,
        ),
    })
}

async fn build_ledger(cfg: &RelayConfig) -> AppResult<Arc<dyn IdempotencyLedger>> {
    let stale_after = cfg.stale_after();
    match &cfg.ledger.backend {
        LedgerBackendConfig::InMemory => Ok(Arc::new(InMemoryLedger::new(stale_after))),
        #[cfg(feature = "sqlite")]
        LedgerBackendConfig::Sqlite {
            url,
            max_connections,
        } => {
            let ledger = crate::infra::SqliteLedger::connect(url, *max_connections, stale_after)
                .await
                .with_context(|| format!("opening sqlite ledger at {url}"))?;
            Ok(Arc::new(ledger))
        }
        #[cfg(not(feature = "sqlite"))]
        LedgerBackendConfig::Sqlite { .. } => {
            bail!("sqlite ledger requested but the `sqlite` feature is disabled")
        }
    }
}

async fn build_mailbox(cfg: &MailboxConfig) -> AppResult<Arc<dyn Mailbox>> {
    match cfg {
        MailboxConfig::InMemory => Ok(Arc::new(InMemoryMailbox::new())),
        MailboxConfig::File { dir, stream } => {
            if stream.contains(['/', '\\']) {
                bail!("mailbox stream `{stream}` must not contain path separators");
            }
            let mailbox = FileMailbox::open(dir, stream)
                .await
                .with_context(|| format!("opening mailbox in {}", dir.display()))?;
            Ok(Arc::new(mailbox))
        }
    }
}
