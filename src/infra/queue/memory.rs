//! In-memory managed-queue emulation.
//!
//! Behaves like a hosted at-least-once queue: received messages stay hidden
//! for a visibility timeout and come back if not deleted, every receive
//! issues a fresh receipt handle (older handles are rejected), and receives
//! long-poll until a message arrives or the wait elapses. FIFO ordering per
//! group and content-based deduplication are opt-in.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::core::message::{QueueDepth, RawDelivery, WireMessage};
use crate::core::transport::QueueTransport;
use crate::core::BackendError;
use crate::util::serde::ReceiptHandle;

/// Queue behaviour switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueOptions {
    /// Largest accepted body in bytes.
    #[serde(default = "QueueOptions::default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Deliver messages of the same group one at a time, in send order.
    #[serde(default)]
    pub fifo: bool,
    /// Drop sends whose body hash was seen within `dedup_window_secs`.
    #[serde(default)]
    pub content_based_dedup: bool,
    /// Deduplication window in seconds.
    #[serde(default = "QueueOptions::default_dedup_window_secs")]
    pub dedup_window_secs: u64,
}

impl QueueOptions {
    const fn default_max_body_bytes() -> usize {
        256 * 1024
    }
    const fn default_dedup_window_secs() -> u64 {
        300
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_body_bytes: Self::default_max_body_bytes(),
            fifo: false,
            content_based_dedup: false,
            dedup_window_secs: Self::default_dedup_window_secs(),
        }
    }
}

#[derive(Debug)]
struct StoredMessage {
    id: String,
    wire: WireMessage,
    visible_at: Instant,
    receive_count: u32,
    receipt: Option<ReceiptHandle>,
}

impl StoredMessage {
    fn in_flight(&self, now: Instant) -> bool {
        self.receipt.is_some() && self.visible_at > now
    }
}

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<StoredMessage>,
    dedup: HashMap<String, (Instant, String)>,
}

/// In-memory queue transport.
#[derive(Debug)]
pub struct InMemoryQueue {
    name: String,
    options: QueueOptions,
    state: Mutex<QueueState>,
    arrivals: Notify,
    injected_failures: AtomicU32,
}

impl InMemoryQueue {
    /// Create a queue with default options.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_options(name, QueueOptions::default())
    }

    /// Create a queue with explicit options.
    pub fn with_options(name: impl Into<String>, options: QueueOptions) -> Self {
        Self {
            name: name.into(),
            options,
            state: Mutex::new(QueueState::default()),
            arrivals: Notify::new(),
            injected_failures: AtomicU32::new(0),
        }
    }

    /// Queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Make the next `count` calls fail with a transient error.
    pub fn fail_next(&self, count: u32) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    /// Total messages held, visible or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    /// Whether the queue holds no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().messages.is_empty()
    }

    /// Make every in-flight message visible again, as if all visibility
    /// timeouts had expired.
    pub fn expire_all_visibility(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        for message in &mut state.messages {
            message.visible_at = now;
        }
        drop(state);
        self.arrivals.notify_waiters();
    }

    fn injected_failure(&self) -> Result<(), BackendError> {
        let taken = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if taken.is_ok() {
            return Err(BackendError::Transient(format!("{} unavailable", self.name)));
        }
        Ok(())
    }

    fn dedup_id(wire: &WireMessage) -> String {
        let mut hasher = Sha256::new();
        if let Some(group) = &wire.attributes.group_id {
            hasher.update(group.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(&wire.body);
        hex::encode(hasher.finalize())
    }

    fn take_ready(&self, state: &mut QueueState, max: usize, visibility: Duration) -> Vec<RawDelivery> {
        let now = Instant::now();
        let mut busy_groups: HashSet<String> = HashSet::new();
        if self.options.fifo {
            for message in &state.messages {
                if message.in_flight(now) {
                    if let Some(group) = &message.wire.attributes.group_id {
                        busy_groups.insert(group.clone());
                    }
                }
            }
        }

        let mut out = Vec::new();
        for message in &mut state.messages {
            if out.len() >= max {
                break;
            }
            let group = message.wire.attributes.group_id.clone();
            if message.visible_at > now {
                continue;
            }
            if self.options.fifo {
                if let Some(group) = group {
                    // one in flight per group, and nothing overtakes an older message
                    if !busy_groups.insert(group) {
                        continue;
                    }
                }
            }
            let receipt = ReceiptHandle::generate();
            message.receipt = Some(receipt.clone());
            message.receive_count += 1;
            message.visible_at = now + visibility;
            out.push(RawDelivery {
                message_id: message.id.clone(),
                message: message.wire.clone(),
                receipt,
                receive_count: message.receive_count,
            });
        }
        out
    }

    fn next_visible_at(state: &QueueState) -> Option<Instant> {
        state.messages.iter().map(|m| m.visible_at).min()
    }
}

#[async_trait]
impl QueueTransport for InMemoryQueue {
    async fn send(&self, message: WireMessage) -> Result<String, BackendError> {
        self.injected_failure()?;
        if message.body.len() > self.options.max_body_bytes {
            return Err(BackendError::Rejected(format!(
                "body of {} bytes exceeds limit of {}",
                message.body.len(),
                self.options.max_body_bytes
            )));
        }

        let now = Instant::now();
        let mut state = self.state.lock();
        let dedup_id = if self.options.content_based_dedup {
            let window = Duration::from_secs(self.options.dedup_window_secs);
            state
                .dedup
                .retain(|_, (seen_at, _)| now.saturating_duration_since(*seen_at) < window);
            let id = Self::dedup_id(&message);
            if let Some((_, existing)) = state.dedup.get(&id) {
                tracing::debug!(queue = %self.name, message_id = %existing, "duplicate send suppressed");
                return Ok(existing.clone());
            }
            Some(id)
        } else {
            None
        };

        let id = uuid::Uuid::new_v4().to_string();
        if let Some(dedup_id) = dedup_id {
            state.dedup.insert(dedup_id, (now, id.clone()));
        }
        state.messages.push_back(StoredMessage {
            id: id.clone(),
            wire: message,
            visible_at: now,
            receive_count: 0,
            receipt: None,
        });
        drop(state);
        self.arrivals.notify_waiters();
        Ok(id)
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
        visibility: Duration,
    ) -> Result<Vec<RawDelivery>, BackendError> {
        self.injected_failure()?;
        if max_messages == 0 {
            return Ok(Vec::new());
        }
        let deadline = Instant::now() + wait;
        loop {
            let arrival = self.arrivals.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();

            let next_visible = {
                let mut state = self.state.lock();
                let ready = self.take_ready(&mut state, max_messages, visibility);
                if !ready.is_empty() {
                    return Ok(ready);
                }
                Self::next_visible_at(&state)
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let wake_at = next_visible
                .filter(|at| *at > now)
                .map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                () = &mut arrival => {}
                () = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), BackendError> {
        self.injected_failure()?;
        let mut state = self.state.lock();
        let position = state
            .messages
            .iter()
            .position(|m| m.receipt.as_ref() == Some(receipt));
        match position {
            Some(index) => {
                state.messages.remove(index);
                drop(state);
                // a FIFO group may have been unblocked
                self.arrivals.notify_waiters();
                Ok(())
            }
            None => Err(BackendError::NotFound(format!("receipt {receipt}"))),
        }
    }

    async fn change_visibility(
        &self,
        receipt: &ReceiptHandle,
        visibility: Duration,
    ) -> Result<(), BackendError> {
        self.injected_failure()?;
        let now = Instant::now();
        let mut state = self.state.lock();
        let message = state
            .messages
            .iter_mut()
            .find(|m| m.receipt.as_ref() == Some(receipt))
            .ok_or_else(|| BackendError::NotFound(format!("receipt {receipt}")))?;
        message.visible_at = now + visibility;
        drop(state);
        if visibility.is_zero() {
            self.arrivals.notify_waiters();
        }
        Ok(())
    }

    async fn depth(&self) -> Result<QueueDepth, BackendError> {
        self.injected_failure()?;
        let now = Instant::now();
        let state = self.state.lock();
        let in_flight = state.messages.iter().filter(|m| m.visible_at > now).count();
        let visible = state.messages.len() - in_flight;
        Ok(QueueDepth {
            visible: visible as u64,
            in_flight: in_flight as u64,
        })
    }

    fn max_body_bytes(&self) -> usize {
        self.options.max_body_bytes
    }
}
