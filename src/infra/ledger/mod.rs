//! Idempotency ledger backends.

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::InMemoryLedger;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteLedger;
