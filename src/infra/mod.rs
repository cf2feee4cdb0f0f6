//! Infrastructure adapters for queues, object stores, ledgers, mailboxes and
//! worker fleets.

pub mod fleet;
pub mod ledger;
pub mod mailbox;
pub mod object_store;
pub mod queue;

pub use fleet::InMemoryFleet;
pub use ledger::InMemoryLedger;
#[cfg(feature = "sqlite")]
pub use ledger::SqliteLedger;
pub use mailbox::{FileMailbox, InMemoryMailbox};
pub use object_store::{FileObjectStore, InMemoryObjectStore};
pub use queue::{InMemoryQueue, QueueOptions};
