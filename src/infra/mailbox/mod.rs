//! Result mailbox backends.

pub mod file;
pub mod memory;

pub use file::FileMailbox;
pub use memory::InMemoryMailbox;
