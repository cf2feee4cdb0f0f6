//! Audit sink implementations.
//!
//! Workers record one event per lifecycle transition they observe.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::util::clock::now_ms;

/// Audit event structure.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    /// Event identifier.
    pub event_id: String,
    /// Related task identifier.
    pub task_id: String,
    /// Related logical key.
    pub logical_key: String,
    /// Worker that observed the transition.
    pub worker: String,
    /// Action taken (admitted, duplicate, completed, failed, cancelled, ...).
    pub action: String,
    /// Timestamp milliseconds.
    pub created_at_ms: u128,
    /// Additional context.
    pub detail: Option<String>,
}

/// Audit sink abstraction.
pub trait AuditSink: Send {
    /// Record an audit event.
    fn record(&mut self, event: AuditEvent);
}

/// In-memory audit sink for testing and dev. Clones share one buffer, so a
/// clone kept by the caller sees what the worker records.
#[derive(Debug, Clone)]
pub struct InMemoryAuditSink {
    events: Arc<Mutex<VecDeque<AuditEvent>>>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Create a new in-memory sink with a bounded buffer.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(max_events))),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().iter().cloned().collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&mut self, event: AuditEvent) {
        if self.max_events == 0 {
            return;
        }
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }
}

/// Audit sink that forwards events to `tracing` at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&mut self, event: AuditEvent) {
        tracing::info!(
            target: "prometheus_task_relay::audit",
            event_id = %event.event_id,
            task_id = %event.task_id,
            logical_key = %event.logical_key,
            worker = %event.worker,
            action = %event.action,
            detail = event.detail.as_deref().unwrap_or(""),
            "audit"
        );
    }
}

/// Helper to build an audit event from context.
pub fn build_audit_event(
    task_id: impl Into<String>,
    logical_key: impl Into<String>,
    worker: impl Into<String>,
    action: impl Into<String>,
    detail: Option<String>,
) -> AuditEvent {
    let task_id = task_id.into();
    let action = action.into();
    let created_at_ms = now_ms();
    AuditEvent {
        event_id: format!("{task_id}-{action}-{created_at_ms}"),
        task_id,
        logical_key: logical_key.into(),
        worker: worker.into(),
        action,
        created_at_ms,
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_keeps_latest_events_and_shares_buffer() {
        let sink = InMemoryAuditSink::new(2);
        let mut writer = sink.clone();
        for action in ["admitted", "completed", "duplicate"] {
            writer.record(build_audit_event("t-1", "k-1", "w-1", action, None));
        }
        let actions: Vec<_> = sink.events().into_iter().map(|e| e.action).collect();
        assert_eq!(actions, ["completed", "duplicate"]);
    }

    #[test]
    fn zero_capacity_sink_drops_everything() {
        let mut sink = InMemoryAuditSink::new(0);
        sink.record(build_audit_event("t-1", "k-1", "w-1", "admitted", None));
        assert!(sink.events().is_empty());
    }
}
