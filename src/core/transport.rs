//! Backend abstractions for the managed queue and the object store.

use std::time::Duration;

use async_trait::async_trait;

use crate::core::message::{QueueDepth, RawDelivery, WireMessage};
use crate::core::BackendError;
use crate::util::serde::ReceiptHandle;

/// Abstraction over an at-least-once message queue.
///
/// Implementations must be safe to share between tasks; `depth` in
/// particular is called concurrently by autoscalers and must be a pure read.
#[async_trait]
pub trait QueueTransport: Send + Sync + 'static {
    /// Enqueue a message and return its transport id.
    async fn send(&self, message: WireMessage) -> Result<String, BackendError>;

    /// Receive up to `max_messages`, waiting up to `wait` for at least one.
    /// Received messages stay hidden for `visibility` unless deleted.
    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
        visibility: Duration,
    ) -> Result<Vec<RawDelivery>, BackendError>;

    /// Permanently remove a received message.
    async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), BackendError>;

    /// Reset the remaining visibility of a received message to `visibility`.
    async fn change_visibility(
        &self,
        receipt: &ReceiptHandle,
        visibility: Duration,
    ) -> Result<(), BackendError>;

    /// Approximate visible and in-flight counts.
    async fn depth(&self) -> Result<QueueDepth, BackendError>;

    /// Largest body the queue accepts inline, in bytes.
    fn max_body_bytes(&self) -> usize;
}

/// Blob store used for oversized payloads and task results.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Store `bytes` under `key`, replacing any previous value.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), BackendError>;

    /// Load the blob stored under `key`.
    async fn get(&self, key: &str) -> Result<Vec<u8>, BackendError>;

    /// Remove the blob under `key`. Missing keys are not an error.
    async fn delete(&self, key: &str) -> Result<(), BackendError>;
}
