//! Idempotency ledger: the exactly-once gate in front of task execution.
//!
//! One record per logical key moves through
//! `(absent) -> Running -> Completed | Failed`. The only way back into
//! `Running` for a new attempt is the stale-reclaim path, taken when the
//! holder stopped heartbeating. Terminal states are final: the first terminal
//! write wins and later ones are reported back as [`Completion::AlreadyTerminal`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::message::{OutcomeStatus, TaskOutcome};
use crate::core::LedgerError;
use crate::util::clock::is_older_than;
use crate::util::serde::{LogicalKey, TaskId};

/// Lifecycle state of a ledger record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    /// An attempt holds the key.
    Running,
    /// Terminal success.
    Completed,
    /// Terminal failure (logic error, cancellation, or expired lease).
    Failed,
}

impl LedgerStatus {
    /// Whether the status is final.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Stable storage name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse a storage name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Why a record ended up `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The task body returned an error or panicked.
    Logic,
    /// The task was cancelled cooperatively.
    Cancelled,
    /// The holder stopped heartbeating and an operator reclaimed the key.
    LeaseExpired,
    /// The result store permanently refused the attempt's result blob.
    ResultRejected,
}

impl FailureKind {
    /// Stable storage name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Logic => "logic",
            Self::Cancelled => "cancelled",
            Self::LeaseExpired => "lease_expired",
            Self::ResultRejected => "result_rejected",
        }
    }

    /// Parse a storage name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "logic" => Some(Self::Logic),
            "cancelled" => Some(Self::Cancelled),
            "lease_expired" => Some(Self::LeaseExpired),
            "result_rejected" => Some(Self::ResultRejected),
            _ => None,
        }
    }
}

/// Durable row for one logical key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Unique key.
    pub logical_key: LogicalKey,
    /// Current status.
    pub status: LedgerStatus,
    /// Task id of the attempt that holds (or last held) the key.
    pub owner: TaskId,
    /// Result or error blob key; set once terminal.
    pub result_ref: Option<String>,
    /// Failure category when `status` is `Failed`.
    pub failure: Option<FailureKind>,
    /// Start of the current attempt.
    pub started_at_ms: u128,
    /// Last heartbeat of the current attempt.
    pub heartbeat_at_ms: u128,
    /// Attempts admitted so far.
    pub attempt_count: u32,
    /// When the record became terminal.
    pub finished_at_ms: Option<u128>,
}

impl IdempotencyRecord {
    /// Fresh running record for a first attempt.
    #[must_use]
    pub fn first_attempt(logical_key: LogicalKey, owner: TaskId, now_ms: u128) -> Self {
        Self {
            logical_key,
            status: LedgerStatus::Running,
            owner,
            result_ref: None,
            failure: None,
            started_at_ms: now_ms,
            heartbeat_at_ms: now_ms,
            attempt_count: 1,
            finished_at_ms: None,
        }
    }

    /// Whether a running record's heartbeat is older than `stale_after`.
    #[must_use]
    pub fn is_stale(&self, stale_after: Duration, now_ms: u128) -> bool {
        self.status == LedgerStatus::Running
            && is_older_than(self.heartbeat_at_ms, now_ms, stale_after)
    }

    /// Whether `owner`'s attempt `attempt` currently holds the running lease.
    #[must_use]
    pub fn is_held_by(&self, owner: &TaskId, attempt: u32) -> bool {
        self.status == LedgerStatus::Running
            && &self.owner == owner
            && self.attempt_count == attempt
    }

    /// Outcome to report to `task_id` once the record is terminal.
    #[must_use]
    pub fn outcome_for(&self, task_id: &TaskId) -> Option<TaskOutcome> {
        let status = match (self.status, self.failure) {
            (LedgerStatus::Running, _) => return None,
            (LedgerStatus::Completed, _) => OutcomeStatus::Completed,
            (LedgerStatus::Failed, Some(FailureKind::Cancelled)) => OutcomeStatus::Cancelled,
            (LedgerStatus::Failed, _) => OutcomeStatus::Failed,
        };
        Some(TaskOutcome {
            task_id: task_id.clone(),
            logical_key: self.logical_key.clone(),
            status,
            result_ref: self.result_ref.clone(),
            attempt: self.attempt_count,
            finished_at_ms: self.finished_at_ms.unwrap_or(self.heartbeat_at_ms),
        })
    }

    /// Apply a terminal write to a running record.
    pub fn finish(&mut self, write: TerminalWrite, now_ms: u128) {
        self.status = write.status();
        self.result_ref = write.result_ref;
        self.failure = write.failure;
        self.finished_at_ms = Some(now_ms);
    }

    /// Settle a terminal write from attempt `attempt` of `owner` against this
    /// record, applying it only if that attempt holds the running lease.
    ///
    /// # Errors
    ///
    /// `LedgerError::LeaseLost` when another attempt holds the key.
    pub fn finish_as(
        &mut self,
        owner: &TaskId,
        attempt: u32,
        write: TerminalWrite,
        now_ms: u128,
    ) -> Result<Completion, LedgerError> {
        if self.status.is_terminal() {
            return Ok(Completion::AlreadyTerminal(self.clone()));
        }
        if !self.is_held_by(owner, attempt) {
            return Err(LedgerError::LeaseLost {
                key: self.logical_key.clone(),
                owner: owner.clone(),
                attempt,
            });
        }
        self.finish(write, now_ms);
        Ok(Completion::Recorded(self.clone()))
    }

    /// Take over a stale record for `owner` as a new attempt.
    pub fn reclaim(&mut self, owner: TaskId, now_ms: u128) -> Admission {
        let previous = std::mem::replace(&mut self.owner, owner);
        self.attempt_count += 1;
        self.started_at_ms = now_ms;
        self.heartbeat_at_ms = now_ms;
        Admission::Admitted {
            attempt: self.attempt_count,
            reclaimed_from: Some(previous),
        }
    }

    /// The decision a `try_begin` caller gets when this record already exists
    /// and is not reclaimable.
    #[must_use]
    pub fn existing_decision(&self) -> Admission {
        if self.status.is_terminal() {
            Admission::AlreadyDone(self.clone())
        } else {
            Admission::AlreadyRunning {
                owner: self.owner.clone(),
            }
        }
    }
}

/// Outcome of [`IdempotencyLedger::try_begin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The caller now holds the key and should execute.
    Admitted {
        /// Attempt number (1 for the first, higher after a stale reclaim).
        attempt: u32,
        /// Previous holder when this admission reclaimed a stale lease.
        reclaimed_from: Option<TaskId>,
    },
    /// Another attempt is running with a fresh heartbeat.
    AlreadyRunning {
        /// Current holder.
        owner: TaskId,
    },
    /// The key is terminal; report the stored result without executing.
    AlreadyDone(IdempotencyRecord),
}

/// Terminal result handed to [`IdempotencyLedger::complete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalWrite {
    /// Result or error blob key.
    pub result_ref: Option<String>,
    /// `None` for success, the failure category otherwise.
    pub failure: Option<FailureKind>,
}

impl TerminalWrite {
    /// Successful completion.
    pub fn success(result_ref: impl Into<String>) -> Self {
        Self {
            result_ref: Some(result_ref.into()),
            failure: None,
        }
    }

    /// Failed completion.
    pub fn failure(kind: FailureKind, result_ref: Option<String>) -> Self {
        Self {
            result_ref,
            failure: Some(kind),
        }
    }

    /// Status this write results in.
    #[must_use]
    pub const fn status(&self) -> LedgerStatus {
        if self.failure.is_some() {
            LedgerStatus::Failed
        } else {
            LedgerStatus::Completed
        }
    }
}

/// Outcome of [`IdempotencyLedger::complete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// This write made the record terminal.
    Recorded(IdempotencyRecord),
    /// An earlier terminal write won; the record is returned unchanged.
    AlreadyTerminal(IdempotencyRecord),
}

impl Completion {
    /// The record as it is now stored.
    #[must_use]
    pub const fn record(&self) -> &IdempotencyRecord {
        match self {
            Self::Recorded(record) | Self::AlreadyTerminal(record) => record,
        }
    }
}

/// Durable store converting at-least-once delivery into effectively-once
/// execution.
///
/// Backends must make `try_begin` and `complete` atomic per key
/// (insert-if-absent and compare-and-swap on status).
#[async_trait]
pub trait IdempotencyLedger: Send + Sync + 'static {
    /// Try to take the key for `owner`.
    ///
    /// Absent key: insert `Running` and admit. Terminal key: `AlreadyDone`.
    /// Running with a fresh heartbeat: `AlreadyRunning`. Running with a stale
    /// heartbeat: take over as a new attempt and admit.
    async fn try_begin(
        &self,
        key: &LogicalKey,
        owner: &TaskId,
        now_ms: u128,
    ) -> Result<Admission, LedgerError>;

    /// Refresh the heartbeat of attempt `attempt`. Returns `false` if that
    /// attempt of `owner` no longer holds a running lease on the key.
    async fn heartbeat(
        &self,
        key: &LogicalKey,
        owner: &TaskId,
        attempt: u32,
        now_ms: u128,
    ) -> Result<bool, LedgerError>;

    /// Make the record terminal on behalf of attempt `attempt` of `owner`.
    ///
    /// A terminal record is returned unchanged as `AlreadyTerminal`. A record
    /// still running under another owner or attempt (the caller's lease was
    /// reclaimed) is left alone and `LedgerError::LeaseLost` is returned.
    async fn complete(
        &self,
        key: &LogicalKey,
        owner: &TaskId,
        attempt: u32,
        write: TerminalWrite,
        now_ms: u128,
    ) -> Result<Completion, LedgerError>;

    /// Fail every running record whose heartbeat is older than `timeout`
    /// with [`FailureKind::LeaseExpired`] and return their keys.
    async fn reclaim_stale(
        &self,
        timeout: Duration,
        now_ms: u128,
    ) -> Result<Vec<LogicalKey>, LedgerError>;

    /// Read the record for `key`.
    async fn get(&self, key: &LogicalKey) -> Result<Option<IdempotencyRecord>, LedgerError>;

    /// Drop terminal records that finished before `finished_before_ms`.
    async fn purge_terminal(&self, finished_before_ms: u128) -> Result<usize, LedgerError>;

    /// Heartbeat age after which a running record may be reclaimed.
    fn stale_after(&self) -> Duration;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staleness_only_applies_to_running_records() {
        let mut record = IdempotencyRecord::first_attempt("k".into(), "t".into(), 1_000);
        let stale_after = Duration::from_millis(100);
        assert!(!record.is_stale(stale_after, 1_050));
        assert!(record.is_stale(stale_after, 1_200));

        record.status = LedgerStatus::Completed;
        assert!(!record.is_stale(stale_after, 10_000));
    }

    #[test]
    fn status_names_round_trip() {
        for status in [LedgerStatus::Running, LedgerStatus::Completed, LedgerStatus::Failed] {
            assert_eq!(LedgerStatus::parse(status.as_str()), Some(status));
        }
        for kind in [
            FailureKind::Logic,
            FailureKind::Cancelled,
            FailureKind::LeaseExpired,
            FailureKind::ResultRejected,
        ] {
            assert_eq!(FailureKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(LedgerStatus::parse("pending"), None);
    }

    #[test]
    fn outcome_maps_failure_kinds() {
        let mut record = IdempotencyRecord::first_attempt("k".into(), "t".into(), 1);
        assert!(record.outcome_for(&"t".into()).is_none());

        record.finish(TerminalWrite::failure(FailureKind::Cancelled, None), 5);
        let outcome = record.outcome_for(&"other".into()).unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Cancelled);
        assert_eq!(outcome.task_id.as_str(), "other");
        assert_eq!(outcome.finished_at_ms, 5);

        record.failure = Some(FailureKind::LeaseExpired);
        assert_eq!(record.outcome_for(&"t".into()).unwrap().status, OutcomeStatus::Failed);
    }

    #[test]
    fn reclaim_bumps_attempt_and_owner() {
        let mut record = IdempotencyRecord::first_attempt("k".into(), "old".into(), 1);
        let admission = record.reclaim("new".into(), 50);
        assert_eq!(
            admission,
            Admission::Admitted {
                attempt: 2,
                reclaimed_from: Some("old".into())
            }
        );
        assert!(record.is_held_by(&"new".into(), 2));
        assert!(!record.is_held_by(&"new".into(), 1));
    }

    #[test]
    fn terminal_write_status() {
        assert_eq!(TerminalWrite::success("r").status(), LedgerStatus::Completed);
        assert_eq!(
            TerminalWrite::failure(FailureKind::Cancelled, None).status(),
            LedgerStatus::Failed
        );
    }
}
