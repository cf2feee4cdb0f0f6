//! Relay startup and shutdown: one worker, the optional autoscaler and the
//! retention sweep, all tied to a single shutdown token.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::builders::RelayComponents;
use crate::config::RelayConfig;
use crate::core::{
    AppResult, AuditSink, FleetManager, IdempotencyLedger, Mailbox, RelayError, Spawn,
    Submitter, TaskExecutor, WorkerHandle, WorkerStats,
};
use crate::runtime::api::{self, Health};
use crate::runtime::tokio_spawner::TokioSpawner;
use crate::util::clock::now_ms;

/// Counts removed by one retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Terminal ledger records dropped.
    pub records_purged: usize,
    /// Stored outcomes dropped.
    pub outcomes_purged: usize,
    /// Settled task handles the submitter stopped tracking.
    #[serde(default)]
    pub handles_pruned: usize,
}

/// Drop terminal ledger records and stored outcomes that finished more than
/// `retention` before `now_ms`. Running records are never touched.
///
/// # Errors
///
/// Ledger or mailbox errors.
pub async fn sweep_retention(
    ledger: &dyn IdempotencyLedger,
    mailbox: &dyn Mailbox,
    retention: Duration,
    now_ms: u128,
) -> Result<SweepReport, RelayError> {
    let cutoff = now_ms.saturating_sub(retention.as_millis());
    let records_purged = ledger.purge_terminal(cutoff).await?;
    let outcomes_purged = mailbox.purge(cutoff).await?;
    if records_purged > 0 || outcomes_purged > 0 {
        tracing::info!(records_purged, outcomes_purged, "retention sweep");
    }
    Ok(SweepReport {
        records_purged,
        outcomes_purged,
        handles_pruned: 0,
    })
}

/// Retention sweep plus pruning of the submitter's settled handles.
async fn sweep_relay(
    ledger: &dyn IdempotencyLedger,
    mailbox: &dyn Mailbox,
    submitter: &Submitter,
    retention: Duration,
) -> Result<SweepReport, RelayError> {
    let handles_pruned = submitter.prune(retention);
    let report = sweep_retention(ledger, mailbox, retention, now_ms()).await?;
    Ok(SweepReport {
        handles_pruned,
        ..report
    })
}

async fn sweep_loop(
    ledger: Arc<dyn IdempotencyLedger>,
    mailbox: Arc<dyn Mailbox>,
    submitter: Arc<Submitter>,
    retention: Duration,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = sweep_relay(ledger.as_ref(), mailbox.as_ref(), &submitter, retention).await {
                    tracing::warn!(error = %e, "retention sweep failed");
                }
            }
        }
    }
}

/// A running relay process: submitter, worker and background loops.
pub struct Relay {
    components: RelayComponents,
    submitter: Arc<Submitter>,
    worker: Option<WorkerHandle>,
    shutdown: CancellationToken,
    background: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("components", &self.components)
            .field("running", &self.worker.is_some())
            .field("background", &self.background.len())
            .finish_non_exhaustive()
    }
}

/// Optional pieces handed to [`Relay::start`].
#[derive(Default)]
pub struct RelayExtras {
    /// Fleet driven by the autoscaler; required when one is configured.
    pub fleet: Option<Arc<dyn FleetManager>>,
    /// Audit sink for worker lifecycle events.
    pub audit: Option<Box<dyn AuditSink>>,
}

impl std::fmt::Debug for RelayExtras {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayExtras")
            .field("fleet", &self.fleet.is_some())
            .field("audit", &self.audit.is_some())
            .finish()
    }
}

impl Relay {
    /// Build backends from `config` and start a worker running `executor`
    /// on the current tokio runtime. `fleet` is required when an autoscaler
    /// is configured.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, unreachable backends, or a configured
    /// autoscaler without a fleet.
    pub async fn startup<E: TaskExecutor>(
        config: &RelayConfig,
        executor: E,
        fleet: Option<Arc<dyn FleetManager>>,
    ) -> AppResult<Self> {
        let components = RelayComponents::build(config).await?;
        Self::start(
            components,
            executor,
            RelayExtras { fleet, audit: None },
            TokioSpawner::current(),
        )
    }

    /// Start a worker and background loops over prebuilt components.
    ///
    /// # Errors
    ///
    /// Fails when an autoscaler is configured without a fleet, or its policy
    /// is rejected.
    pub fn start<E, S>(
        components: RelayComponents,
        executor: E,
        extras: RelayExtras,
        spawner: S,
    ) -> AppResult<Self>
    where
        E: TaskExecutor,
        S: Spawn + Clone + Send + Sync + 'static,
    {
        let config = components.config().clone();
        let autoscaler = match (config.autoscaler.is_some(), extras.fleet) {
            (false, _) => None,
            (true, None) => bail!("autoscaler configured but no fleet manager supplied"),
            (true, Some(fleet)) => components.autoscaler(fleet)?,
        };

        let shutdown = CancellationToken::new();
        let mut background = Vec::new();

        let mut runtime = components.worker(executor);
        if let Some(sink) = extras.audit {
            runtime = runtime.with_audit(sink);
        }
        let worker = runtime.start(spawner);
        let submitter = Arc::new(components.submitter());

        if let Some(scaler) = autoscaler {
            background.push(tokio::spawn(scaler.run(shutdown.child_token())));
        }
        if config.ledger.sweep_interval_secs > 0 {
            background.push(tokio::spawn(sweep_loop(
                components.ledger(),
                components.mailbox(),
                Arc::clone(&submitter),
                config.retention(),
                Duration::from_secs(config.ledger.sweep_interval_secs),
                shutdown.child_token(),
            )));
        }

        tracing::info!(
            autoscaler = config.autoscaler.is_some(),
            sweep_interval_secs = config.ledger.sweep_interval_secs,
            "relay started"
        );

        Ok(Self {
            submitter,
            components,
            worker: Some(worker),
            shutdown,
            background,
        })
    }

    /// Submitter bound to this relay's queues and stores.
    #[must_use]
    pub fn submitter(&self) -> &Submitter {
        self.submitter.as_ref()
    }

    /// Components the relay runs on.
    #[must_use]
    pub const fn components(&self) -> &RelayComponents {
        &self.components
    }

    /// Worker counters, while the worker runs.
    #[must_use]
    pub fn worker_stats(&self) -> Option<WorkerStats> {
        self.worker.as_ref().map(WorkerHandle::stats)
    }

    /// Queue depth and worker counters.
    pub async fn health(&self) -> Health {
        api::health(self.components.broker(), self.worker_stats()).await
    }

    /// Run one retention sweep now, including pruning of settled handles.
    ///
    /// # Errors
    ///
    /// Ledger or mailbox errors.
    pub async fn sweep_now(&self) -> AppResult<SweepReport> {
        let cfg = self.components.config();
        let ledger = self.components.ledger();
        let mailbox = self.components.mailbox();
        sweep_relay(ledger.as_ref(), mailbox.as_ref(), &self.submitter, cfg.retention())
            .await
            .context("retention sweep")
    }

    /// Stop receiving, drain in-flight units and stop background loops.
    /// Returns the final worker counters.
    pub async fn shutdown(mut self) -> WorkerStats {
        self.shutdown.cancel();
        let stats = match self.worker.take() {
            Some(mut worker) => worker.shutdown().await,
            None => WorkerStats::default(),
        };
        for handle in std::mem::take(&mut self.background) {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }
        tracing::info!(
            completed = stats.completed,
            failed = stats.failed,
            cancelled = stats.cancelled,
            "relay stopped"
        );
        stats
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
