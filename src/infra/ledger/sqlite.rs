//! SQLite idempotency ledger.
//!
//! One row per logical key. Admission is an `INSERT .. ON CONFLICT DO
//! NOTHING`; every later transition is an `UPDATE .. WHERE status = ..`
//! guarded on the values the caller last observed, so two workers racing on
//! the same key can never both win.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::core::ledger::{
    Admission, Completion, FailureKind, IdempotencyLedger, IdempotencyRecord, LedgerStatus,
    TerminalWrite,
};
use crate::core::LedgerError;
use crate::util::serde::{LogicalKey, TaskId};

/// Schema statements, applied in order by [`SqliteLedger::migrate`].
pub const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS idempotency_records (
        logical_key     TEXT PRIMARY KEY NOT NULL,
        status          TEXT NOT NULL,
        owner           TEXT NOT NULL,
        result_ref      TEXT,
        failure         TEXT,
        started_at_ms   INTEGER NOT NULL,
        heartbeat_at_ms INTEGER NOT NULL,
        attempt_count   INTEGER NOT NULL,
        finished_at_ms  INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_idempotency_status_heartbeat
        ON idempotency_records (status, heartbeat_at_ms)",
];

const SELECT_RECORD: &str = "SELECT logical_key, status, owner, result_ref, failure, started_at_ms,
        heartbeat_at_ms, attempt_count, finished_at_ms
     FROM idempotency_records WHERE logical_key = ?1";

/// Admission races are settled within this many read/compare-and-swap rounds.
const MAX_CAS_ROUNDS: usize = 8;

/// Ledger stored in a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
    stale_after: Duration,
}

impl SqliteLedger {
    /// Open (creating if missing) the database at `url` and apply the schema.
    ///
    /// In-memory databases are private to one connection, so use
    /// `max_connections = 1` with `sqlite::memory:`.
    ///
    /// # Errors
    ///
    /// `LedgerError::Storage` if the database cannot be opened or migrated.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        stale_after: Duration,
    ) -> Result<Self, LedgerError> {
        let mut options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        if !url.contains(":memory:") {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;
        let ledger = Self::from_pool(pool, stale_after);
        ledger.migrate().await?;
        tracing::info!(url, "sqlite ledger opened");
        Ok(ledger)
    }

    /// Wrap an existing pool. Call [`SqliteLedger::migrate`] before use.
    #[must_use]
    pub const fn from_pool(pool: SqlitePool, stale_after: Duration) -> Self {
        Self { pool, stale_after }
    }

    /// Apply [`MIGRATIONS`].
    ///
    /// # Errors
    ///
    /// `LedgerError::Storage` on SQL failure.
    pub async fn migrate(&self) -> Result<(), LedgerError> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch(&self, key: &LogicalKey) -> Result<Option<IdempotencyRecord>, LedgerError> {
        let row = sqlx::query(SELECT_RECORD)
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| decode_record(key, &row)).transpose()
    }
}

fn to_sql_ms(ms: u128) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

fn from_sql_ms(key: &LogicalKey, column: &str, value: i64) -> Result<u128, LedgerError> {
    u128::try_from(value).map_err(|_| LedgerError::Corrupt {
        key: key.clone(),
        reason: format!("negative {column}"),
    })
}

fn decode_record(key: &LogicalKey, row: &SqliteRow) -> Result<IdempotencyRecord, LedgerError> {
    let status: String = row.try_get("status")?;
    let status = LedgerStatus::parse(&status).ok_or_else(|| LedgerError::Corrupt {
        key: key.clone(),
        reason: format!("unknown status `{status}`"),
    })?;
    let failure = match row.try_get::<Option<String>, _>("failure")? {
        Some(name) => Some(FailureKind::parse(&name).ok_or_else(|| LedgerError::Corrupt {
            key: key.clone(),
            reason: format!("unknown failure kind `{name}`"),
        })?),
        None => None,
    };
    let attempt_count: i64 = row.try_get("attempt_count")?;
    let finished_at_ms = match row.try_get::<Option<i64>, _>("finished_at_ms")? {
        Some(ms) => Some(from_sql_ms(key, "finished_at_ms", ms)?),
        None => None,
    };
    Ok(IdempotencyRecord {
        logical_key: LogicalKey::new(row.try_get::<String, _>("logical_key")?),
        status,
        owner: TaskId::from(row.try_get::<String, _>("owner")?),
        result_ref: row.try_get("result_ref")?,
        failure,
        started_at_ms: from_sql_ms(key, "started_at_ms", row.try_get("started_at_ms")?)?,
        heartbeat_at_ms: from_sql_ms(key, "heartbeat_at_ms", row.try_get("heartbeat_at_ms")?)?,
        attempt_count: u32::try_from(attempt_count).map_err(|_| LedgerError::Corrupt {
            key: key.clone(),
            reason: "attempt_count out of range".into(),
        })?,
        finished_at_ms,
    })
}

#[async_trait]
impl IdempotencyLedger for SqliteLedger {
    async fn try_begin(
        &self,
        key: &LogicalKey,
        owner: &TaskId,
        now_ms: u128,
    ) -> Result<Admission, LedgerError> {
        let now = to_sql_ms(now_ms);
        for _ in 0..MAX_CAS_ROUNDS {
            let inserted = sqlx::query(
                "INSERT INTO idempotency_records
                    (logical_key, status, owner, started_at_ms, heartbeat_at_ms, attempt_count)
                 VALUES (?1, 'running', ?2, ?3, ?3, 1)
                 ON CONFLICT(logical_key) DO NOTHING",
            )
            .bind(key.as_str())
            .bind(owner.as_str())
            .bind(now)
            .execute(&self.pool)
            .await?;
            if inserted.rows_affected() == 1 {
                return Ok(Admission::Admitted {
                    attempt: 1,
                    reclaimed_from: None,
                });
            }

            let Some(record) = self.fetch(key).await? else {
                // purged between the insert and the read
                continue;
            };
            if !record.is_stale(self.stale_after, now_ms) {
                return Ok(record.existing_decision());
            }

            let reclaimed = sqlx::query(
                "UPDATE idempotency_records
                    SET owner = ?1, attempt_count = attempt_count + 1,
                        started_at_ms = ?2, heartbeat_at_ms = ?2
                  WHERE logical_key = ?3 AND status = 'running'
                    AND owner = ?4 AND attempt_count = ?5 AND heartbeat_at_ms = ?6",
            )
            .bind(owner.as_str())
            .bind(now)
            .bind(key.as_str())
            .bind(record.owner.as_str())
            .bind(i64::from(record.attempt_count))
            .bind(to_sql_ms(record.heartbeat_at_ms))
            .execute(&self.pool)
            .await?;
            if reclaimed.rows_affected() == 1 {
                return Ok(Admission::Admitted {
                    attempt: record.attempt_count + 1,
                    reclaimed_from: Some(record.owner),
                });
            }
        }
        Err(LedgerError::Storage(format!(
            "admission for `{key}` did not settle after {MAX_CAS_ROUNDS} rounds"
        )))
    }

    async fn heartbeat(
        &self,
        key: &LogicalKey,
        owner: &TaskId,
        attempt: u32,
        now_ms: u128,
    ) -> Result<bool, LedgerError> {
        let updated = sqlx::query(
            "UPDATE idempotency_records SET heartbeat_at_ms = ?1
              WHERE logical_key = ?2 AND status = 'running' AND owner = ?3 AND attempt_count = ?4",
        )
        .bind(to_sql_ms(now_ms))
        .bind(key.as_str())
        .bind(owner.as_str())
        .bind(i64::from(attempt))
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    async fn complete(
        &self,
        key: &LogicalKey,
        owner: &TaskId,
        attempt: u32,
        write: TerminalWrite,
        now_ms: u128,
    ) -> Result<Completion, LedgerError> {
        let updated = sqlx::query(
            "UPDATE idempotency_records
                SET status = ?1, result_ref = ?2, failure = ?3, finished_at_ms = ?4
              WHERE logical_key = ?5 AND status = 'running'
                AND owner = ?6 AND attempt_count = ?7",
        )
        .bind(write.status().as_str())
        .bind(write.result_ref.as_deref())
        .bind(write.failure.map(FailureKind::as_str))
        .bind(to_sql_ms(now_ms))
        .bind(key.as_str())
        .bind(owner.as_str())
        .bind(i64::from(attempt))
        .execute(&self.pool)
        .await?;

        let record = self
            .fetch(key)
            .await?
            .ok_or_else(|| LedgerError::NotFound(key.clone()))?;
        if updated.rows_affected() == 1 {
            Ok(Completion::Recorded(record))
        } else if record.status.is_terminal() {
            Ok(Completion::AlreadyTerminal(record))
        } else if record.is_held_by(owner, attempt) {
            Err(LedgerError::Corrupt {
                key: key.clone(),
                reason: "running record refused terminal write".into(),
            })
        } else {
            Err(LedgerError::LeaseLost {
                key: key.clone(),
                owner: owner.clone(),
                attempt,
            })
        }
    }

    async fn reclaim_stale(
        &self,
        timeout: Duration,
        now_ms: u128,
    ) -> Result<Vec<LogicalKey>, LedgerError> {
        let cutoff = to_sql_ms(now_ms.saturating_sub(timeout.as_millis()));
        let rows = sqlx::query(
            "UPDATE idempotency_records
                SET status = 'failed', failure = ?1, finished_at_ms = ?2
              WHERE status = 'running' AND heartbeat_at_ms < ?3
              RETURNING logical_key",
        )
        .bind(FailureKind::LeaseExpired.as_str())
        .bind(to_sql_ms(now_ms))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut keys = rows
            .iter()
            .map(|row| row.try_get::<String, _>("logical_key").map(LogicalKey::new))
            .collect::<Result<Vec<_>, _>>()?;
        keys.sort();
        if !keys.is_empty() {
            tracing::warn!(count = keys.len(), "stale ledger records failed as lease expired");
        }
        Ok(keys)
    }

    async fn get(&self, key: &LogicalKey) -> Result<Option<IdempotencyRecord>, LedgerError> {
        self.fetch(key).await
    }

    async fn purge_terminal(&self, finished_before_ms: u128) -> Result<usize, LedgerError> {
        let deleted = sqlx::query(
            "DELETE FROM idempotency_records
              WHERE status != 'running' AND finished_at_ms < ?1",
        )
        .bind(to_sql_ms(finished_before_ms))
        .execute(&self.pool)
        .await?;
        Ok(usize::try_from(deleted.rows_affected()).unwrap_or(usize::MAX))
    }

    fn stale_after(&self) -> Duration {
        self.stale_after
    }
}
