//! Queue transport backends.

pub mod memory;

pub use memory::{InMemoryQueue, QueueOptions};
