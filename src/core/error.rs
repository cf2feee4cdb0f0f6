//! Error types for relay operations.
//!
//! The taxonomy separates transport trouble (the task may or may not have
//! run) from task logic failures (the task definitely failed). Duplicate
//! deliveries and cancellation races are resolved inside the ledger and never
//! show up here.

use thiserror::Error;

use crate::util::serde::{LogicalKey, TaskId};

/// Failure reported by a storage or transport backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Temporary failure (network, throttling); safe to retry.
    #[error("transient backend failure: {0}")]
    Transient(String),
    /// The backend rejected the request; retrying will not help.
    #[error("backend rejected request: {0}")]
    Rejected(String),
    /// The referenced object, message, or receipt does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Errors produced by idempotency ledger backends.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// No record exists for the key.
    #[error("no ledger record for `{0}`")]
    NotFound(LogicalKey),
    /// The stored row could not be interpreted.
    #[error("corrupt ledger record for `{key}`: {reason}")]
    Corrupt {
        /// Affected key.
        key: LogicalKey,
        /// What was wrong with it.
        reason: String,
    },
    /// The attempt no longer holds the running lease on the key.
    #[error("attempt {attempt} of `{owner}` no longer holds `{key}`")]
    LeaseLost {
        /// Affected key.
        key: LogicalKey,
        /// Task id of the attempt that tried to write.
        owner: TaskId,
        /// Attempt number it was admitted under.
        attempt: u32,
    },
    /// Underlying storage failure.
    #[error("ledger storage error: {0}")]
    Storage(String),
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Errors surfaced by the broker, submitter, and worker runtime.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A transport or object-store call kept failing transiently until the
    /// retry budget ran out. The operation may or may not have taken effect.
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    TransportExhausted {
        /// Name of the broker operation.
        operation: &'static str,
        /// Attempts made, including the first.
        attempts: u32,
        /// Last transient failure observed.
        last_error: String,
    },
    /// A backend failed permanently.
    #[error(transparent)]
    Backend(#[from] BackendError),
    /// The idempotency ledger failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// A message or envelope could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
    /// The handle does not belong to this submitter.
    #[error("unknown task `{0}`")]
    UnknownTask(TaskId),
    /// Configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The component has been shut down.
    #[error("relay has been shut down")]
    Shutdown,
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl RelayError {
    /// Whether the outcome of the failed call is unknown (as opposed to a
    /// definite failure).
    #[must_use]
    pub const fn is_indeterminate(&self) -> bool {
        matches!(self, Self::TransportExhausted { .. })
    }
}

/// Logic failure raised by a task body.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct TaskError {
    /// Human-readable failure description.
    pub message: String,
}

impl TaskError {
    /// Build a task error from any displayable message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
