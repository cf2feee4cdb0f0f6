//! Serializable identifier types shared across the relay.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transport-level identity of one submitted task message.
///
/// A fresh id is minted per `submit`; redeliveries of the same message keep
/// it, but a caller-side retry gets a new one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Mint a new random task id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Caller-stable identity of one logical unit of work.
///
/// Stays the same across redeliveries and transport retries; the idempotency
/// ledger is keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalKey(String);

impl LogicalKey {
    /// Create a logical key from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LogicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for LogicalKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for LogicalKey {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Opaque handle identifying one receipt of a queue message.
///
/// Each receive mints a new handle; only the latest one can delete the
/// message or change its visibility.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    /// Mint a new random receipt handle.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the handle as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReceiptHandle {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}
