//! In-memory fleet manager that records every command.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::autoscaler::FleetManager;
use crate::core::BackendError;

/// Fleet manager keeping desired counts in memory.
#[derive(Debug, Default)]
pub struct InMemoryFleet {
    counts: Mutex<HashMap<String, u32>>,
    commands: Mutex<Vec<(String, u32)>>,
    unavailable: AtomicBool,
}

impl InMemoryFleet {
    /// Create a fleet manager with no targets.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fleet manager with `target` already at `count` replicas.
    #[must_use]
    pub fn with_target(target: impl Into<String>, count: u32) -> Self {
        let fleet = Self::default();
        fleet.counts.lock().insert(target.into(), count);
        fleet
    }

    /// Every `set_desired_count` accepted so far, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<(String, u32)> {
        self.commands.lock().clone()
    }

    /// Make the manager reject commands until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl FleetManager for InMemoryFleet {
    async fn current_count(&self, target: &str) -> Result<u32, BackendError> {
        Ok(self.counts.lock().get(target).copied().unwrap_or(0))
    }

    async fn set_desired_count(&self, target: &str, count: u32) -> Result<(), BackendError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::Transient("fleet manager unavailable".into()));
        }
        self.counts.lock().insert(target.to_owned(), count);
        self.commands.lock().push((target.to_owned(), count));
        Ok(())
    }
}
