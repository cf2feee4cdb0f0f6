//! Worker-fleet manager backends.

pub mod memory;

pub use memory::InMemoryFleet;
