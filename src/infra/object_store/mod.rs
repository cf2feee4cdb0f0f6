//! Object store backends for offloaded payloads and result blobs.

pub mod file;
pub mod memory;

pub use file::FileObjectStore;
pub use memory::InMemoryObjectStore;
