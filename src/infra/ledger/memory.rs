//! In-memory idempotency ledger.
//!
//! Every operation takes the map lock for its whole read-modify-write, which
//! gives the same atomicity a conditional database write would.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::ledger::{
    Admission, Completion, FailureKind, IdempotencyLedger, IdempotencyRecord, TerminalWrite,
};
use crate::core::LedgerError;
use crate::util::serde::{LogicalKey, TaskId};

/// Ledger held in process memory. Suitable for tests and single-process
/// deployments.
#[derive(Debug)]
pub struct InMemoryLedger {
    records: Mutex<HashMap<LogicalKey, IdempotencyRecord>>,
    stale_after: Duration,
}

impl InMemoryLedger {
    /// Create a ledger whose running records go stale after `stale_after`
    /// without a heartbeat.
    #[must_use]
    pub fn new(stale_after: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            stale_after,
        }
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether the ledger is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl IdempotencyLedger for InMemoryLedger {
    async fn try_begin(
        &self,
        key: &LogicalKey,
        owner: &TaskId,
        now_ms: u128,
    ) -> Result<Admission, LedgerError> {
        let mut records = self.records.lock();
        match records.get_mut(key) {
            None => {
                records.insert(
                    key.clone(),
                    IdempotencyRecord::first_attempt(key.clone(), owner.clone(), now_ms),
                );
                Ok(Admission::Admitted {
                    attempt: 1,
                    reclaimed_from: None,
                })
            }
            Some(record) if record.is_stale(self.stale_after, now_ms) => {
                Ok(record.reclaim(owner.clone(), now_ms))
            }
            Some(record) => Ok(record.existing_decision()),
        }
    }

    async fn heartbeat(
        &self,
        key: &LogicalKey,
        owner: &TaskId,
        attempt: u32,
        now_ms: u128,
    ) -> Result<bool, LedgerError> {
        let mut records = self.records.lock();
        match records.get_mut(key) {
            Some(record) if record.is_held_by(owner, attempt) => {
                record.heartbeat_at_ms = now_ms;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(
        &self,
        key: &LogicalKey,
        owner: &TaskId,
        attempt: u32,
        write: TerminalWrite,
        now_ms: u128,
    ) -> Result<Completion, LedgerError> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(key)
            .ok_or_else(|| LedgerError::NotFound(key.clone()))?;
        record.finish_as(owner, attempt, write, now_ms)
    }

    async fn reclaim_stale(
        &self,
        timeout: Duration,
        now_ms: u128,
    ) -> Result<Vec<LogicalKey>, LedgerError> {
        let mut records = self.records.lock();
        let mut reclaimed = Vec::new();
        for record in records.values_mut() {
            if record.is_stale(timeout, now_ms) {
                record.finish(TerminalWrite::failure(FailureKind::LeaseExpired, None), now_ms);
                reclaimed.push(record.logical_key.clone());
            }
        }
        reclaimed.sort();
        Ok(reclaimed)
    }

    async fn get(&self, key: &LogicalKey) -> Result<Option<IdempotencyRecord>, LedgerError> {
        Ok(self.records.lock().get(key).cloned())
    }

    async fn purge_terminal(&self, finished_before_ms: u128) -> Result<usize, LedgerError> {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, record| {
            !record.status.is_terminal()
                || record.finished_at_ms.is_none_or(|at| at >= finished_before_ms)
        });
        Ok(before - records.len())
    }

    fn stale_after(&self) -> Duration {
        self.stale_after
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ledger::LedgerStatus;

    const STALE: Duration = Duration::from_millis(1_000);

    #[tokio::test]
    async fn first_try_begin_admits_and_second_defers() {
        let ledger = InMemoryLedger::new(STALE);
        let key: LogicalKey = "job-1".into();
        assert_eq!(
            ledger.try_begin(&key, &"t1".into(), 0).await.unwrap(),
            Admission::Admitted {
                attempt: 1,
                reclaimed_from: None
            }
        );
        assert_eq!(
            ledger.try_begin(&key, &"t2".into(), 10).await.unwrap(),
            Admission::AlreadyRunning { owner: "t1".into() }
        );
    }

    #[tokio::test]
    async fn heartbeat_keeps_lease_fresh() {
        let ledger = InMemoryLedger::new(STALE);
        let key: LogicalKey = "job-1".into();
        ledger.try_begin(&key, &"t1".into(), 0).await.unwrap();
        assert!(ledger.heartbeat(&key, &"t1".into(), 1, 900).await.unwrap());
        assert!(!ledger.heartbeat(&key, &"t2".into(), 1, 900).await.unwrap());
        assert!(matches!(
            ledger.try_begin(&key, &"t2".into(), 1_800).await.unwrap(),
            Admission::AlreadyRunning { .. }
        ));
    }

    #[tokio::test]
    async fn stale_lease_is_reclaimed_as_new_attempt() {
        let ledger = InMemoryLedger::new(STALE);
        let key: LogicalKey = "job-1".into();
        ledger.try_begin(&key, &"t1".into(), 0).await.unwrap();
        assert_eq!(
            ledger.try_begin(&key, &"t2".into(), 2_000).await.unwrap(),
            Admission::Admitted {
                attempt: 2,
                reclaimed_from: Some("t1".into())
            }
        );
        assert!(!ledger.heartbeat(&key, &"t1".into(), 1, 2_001).await.unwrap());
        assert!(ledger.heartbeat(&key, &"t2".into(), 2, 2_001).await.unwrap());
    }

    #[tokio::test]
    async fn first_terminal_write_wins() {
        let ledger = InMemoryLedger::new(STALE);
        let key: LogicalKey = "job-1".into();
        ledger.try_begin(&key, &"t1".into(), 0).await.unwrap();
        let first = ledger
            .complete(&key, &"t1".into(), 1, TerminalWrite::success("results/job-1/attempt-1"), 5)
            .await
            .unwrap();
        assert!(matches!(first, Completion::Recorded(_)));

        let second = ledger
            .complete(&key, &"t1".into(), 1, TerminalWrite::failure(FailureKind::Cancelled, None), 6)
            .await
            .unwrap();
        match second {
            Completion::AlreadyTerminal(record) => {
                assert_eq!(record.status, LedgerStatus::Completed);
                assert_eq!(record.finished_at_ms, Some(5));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            ledger.try_begin(&key, &"t3".into(), 10_000).await.unwrap(),
            Admission::AlreadyDone(_)
        ));
    }

    #[tokio::test]
    async fn reclaimed_attempt_cannot_finish_late() {
        let ledger = InMemoryLedger::new(STALE);
        let key: LogicalKey = "job-1".into();
        ledger.try_begin(&key, &"old".into(), 0).await.unwrap();
        ledger.try_begin(&key, &"new".into(), 2_000).await.unwrap();

        let err = ledger
            .complete(&key, &"old".into(), 1, TerminalWrite::success("results/job-1/attempt-1"), 2_100)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::LeaseLost { attempt: 1, .. }), "{err}");

        let record = ledger.get(&key).await.unwrap().unwrap();
        assert_eq!(record.status, LedgerStatus::Running);
        assert_eq!(record.owner, TaskId::from("new"));
        assert_eq!(record.result_ref, None);

        let done = ledger
            .complete(&key, &"new".into(), 2, TerminalWrite::success("results/job-1/attempt-2"), 2_200)
            .await
            .unwrap();
        assert_eq!(done.record().result_ref.as_deref(), Some("results/job-1/attempt-2"));
    }

    #[tokio::test]
    async fn expired_lease_refuses_holder_write() {
        let ledger = InMemoryLedger::new(STALE);
        let key: LogicalKey = "job-2".into();
        ledger.try_begin(&key, &"t1".into(), 0).await.unwrap();
        ledger.reclaim_stale(STALE, 5_000).await.unwrap();

        let late = ledger
            .complete(&key, &"t1".into(), 1, TerminalWrite::success("r"), 5_100)
            .await
            .unwrap();
        let Completion::AlreadyTerminal(record) = late else {
            panic!("expired lease accepted a result");
        };
        assert_eq!(record.failure, Some(FailureKind::LeaseExpired));
    }

    #[tokio::test]
    async fn complete_without_record_is_an_error() {
        let ledger = InMemoryLedger::new(STALE);
        let err = ledger
            .complete(&"missing".into(), &"t1".into(), 1, TerminalWrite::success("r"), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
    }

    #[tokio::test]
    async fn reclaim_stale_fails_abandoned_records() {
        let ledger = InMemoryLedger::new(STALE);
        ledger.try_begin(&"old".into(), &"t1".into(), 0).await.unwrap();
        ledger.try_begin(&"fresh".into(), &"t2".into(), 1_500).await.unwrap();

        let reclaimed = ledger.reclaim_stale(STALE, 2_000).await.unwrap();
        assert_eq!(reclaimed, vec![LogicalKey::from("old")]);
        let record = ledger.get(&"old".into()).await.unwrap().unwrap();
        assert_eq!(record.status, LedgerStatus::Failed);
        assert_eq!(record.failure, Some(FailureKind::LeaseExpired));
    }

    #[tokio::test]
    async fn purge_drops_only_old_terminal_records() {
        let ledger = InMemoryLedger::new(STALE);
        ledger.try_begin(&"done".into(), &"t1".into(), 0).await.unwrap();
        ledger
            .complete(&"done".into(), &"t1".into(), 1, TerminalWrite::success("r"), 100)
            .await
            .unwrap();
        ledger.try_begin(&"running".into(), &"t2".into(), 0).await.unwrap();

        assert_eq!(ledger.purge_terminal(50).await.unwrap(), 0);
        assert_eq!(ledger.purge_terminal(101).await.unwrap(), 1);
        assert_eq!(ledger.len(), 1);
    }
}
