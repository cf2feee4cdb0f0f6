//! Queue broker: send/receive/acknowledge with transparent payload overflow.
//!
//! Payloads above the inline limit are written to the object store under a
//! key derived from the task id, and the queue only carries a reference
//! envelope. `receive` resolves references again, so callers always see the
//! full payload. Every backend call goes through bounded, jittered retries.

use std::sync::Arc;
use std::time::Duration;

use crate::core::message::{
    Delivery, PayloadBody, QueueDepth, SendReceipt, TaskMessage, WireMessage,
};
use crate::core::transport::{ObjectStore, QueueTransport};
use crate::core::RelayError;
use crate::util::backoff::{retry_transient, RetryPolicy};
use crate::util::serde::{ReceiptHandle, TaskId};

/// Tunables for a [`QueueBroker`].
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// Payloads strictly larger than this are offloaded.
    pub inline_limit_bytes: usize,
    /// Prefix for offloaded payload keys.
    pub payload_prefix: String,
    /// Visibility timeout applied on receive.
    pub visibility_timeout: Duration,
    /// Retry policy for every backend call.
    pub retry: RetryPolicy,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            inline_limit_bytes: 256 * 1024,
            payload_prefix: "payloads".into(),
            visibility_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// Broker over one queue and one object store.
#[derive(Clone)]
pub struct QueueBroker {
    transport: Arc<dyn QueueTransport>,
    store: Arc<dyn ObjectStore>,
    settings: BrokerSettings,
}

impl std::fmt::Debug for QueueBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueBroker")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl QueueBroker {
    /// Create a broker.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::InvalidConfig` if the inline limit exceeds what
    /// the transport accepts, or the retry policy is invalid.
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        store: Arc<dyn ObjectStore>,
        settings: BrokerSettings,
    ) -> Result<Self, RelayError> {
        if settings.inline_limit_bytes > transport.max_body_bytes() {
            return Err(RelayError::InvalidConfig(format!(
                "inline limit {} exceeds transport body limit {}",
                settings.inline_limit_bytes,
                transport.max_body_bytes()
            )));
        }
        settings.retry.validate().map_err(RelayError::InvalidConfig)?;
        Ok(Self {
            transport,
            store,
            settings,
        })
    }

    /// Object-store key used for the payload of `task_id`.
    #[must_use]
    pub fn payload_key(&self, task_id: &TaskId) -> String {
        format!("{}/{}", self.settings.payload_prefix, task_id)
    }

    /// Object store shared with this broker.
    #[must_use]
    pub fn object_store(&self) -> Arc<dyn ObjectStore> {
        Arc::clone(&self.store)
    }

    /// Broker settings.
    #[must_use]
    pub const fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    /// Send a task message, offloading its payload if it is too large.
    ///
    /// # Errors
    ///
    /// `RelayError::TransportExhausted` if the queue or store stayed
    /// unreachable, `RelayError::Backend` on a permanent rejection.
    pub async fn send(&self, mut message: TaskMessage) -> Result<SendReceipt, RelayError> {
        let mut offloaded_size = None;
        if let PayloadBody::Inline(bytes) = &message.body {
            if bytes.len() > self.settings.inline_limit_bytes {
                let key = self.payload_key(&message.task_id);
                let size = bytes.len();
                let blob = bytes.clone();
                retry_transient("put_payload", &self.settings.retry, || {
                    self.store.put(&key, blob.clone())
                })
                .await?;
                tracing::debug!(
                    task_id = %message.task_id,
                    size,
                    key = %key,
                    "payload offloaded to object store"
                );
                message.body = PayloadBody::Reference(key);
                offloaded_size = Some(size);
            }
        }

        let mut wire = WireMessage::encode(&message)?;
        if offloaded_size.is_some() {
            wire.attributes.payload_size = offloaded_size;
        }

        let message_id = retry_transient("send", &self.settings.retry, || {
            self.transport.send(wire.clone())
        })
        .await?;

        tracing::debug!(task_id = %message.task_id, message_id = %message_id, "task message sent");
        Ok(SendReceipt {
            message_id,
            task_id: message.task_id,
            payload_ref: message.body.reference().map(str::to_owned),
        })
    }

    /// Receive up to `max_messages`, resolving offloaded payloads.
    ///
    /// Each returned delivery starts its visibility timer; the caller must
    /// delete it or extend its visibility before the timer runs out.
    /// Messages whose payload cannot be decoded or loaded are skipped and
    /// reappear after their visibility timeout.
    ///
    /// # Errors
    ///
    /// `RelayError::TransportExhausted` if the queue stayed unreachable.
    pub async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, RelayError> {
        let visibility = self.settings.visibility_timeout;
        let raw = retry_transient("receive", &self.settings.retry, || {
            self.transport.receive(max_messages, wait, visibility)
        })
        .await?;

        let mut deliveries = Vec::with_capacity(raw.len());
        for item in raw {
            let message = match item.message.decode() {
                Ok(message) => message,
                Err(e) => {
                    tracing::error!(message_id = %item.message_id, error = %e, "undecodable message skipped");
                    continue;
                }
            };
            let (payload, payload_ref) = match message.body {
                PayloadBody::Inline(bytes) => (bytes, None),
                PayloadBody::Reference(key) => {
                    let loaded = retry_transient("get_payload", &self.settings.retry, || {
                        self.store.get(&key)
                    })
                    .await;
                    match loaded {
                        Ok(bytes) => (bytes, Some(key)),
                        Err(e) => {
                            tracing::error!(
                                task_id = %message.task_id,
                                key = %key,
                                error = %e,
                                "offloaded payload unavailable, message skipped"
                            );
                            continue;
                        }
                    }
                }
            };
            deliveries.push(Delivery {
                task_id: message.task_id,
                logical_key: message.logical_key,
                payload,
                group_id: message.group_id,
                enqueued_at_ms: message.enqueued_at_ms,
                receipt: item.receipt,
                receive_count: item.receive_count,
                payload_ref,
            });
        }
        Ok(deliveries)
    }

    /// Acknowledge a delivery so it is never redelivered.
    ///
    /// # Errors
    ///
    /// `RelayError::Backend(BackendError::NotFound)` when the receipt is no
    /// longer current (the message was already redelivered elsewhere).
    pub async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), RelayError> {
        retry_transient("delete", &self.settings.retry, || self.transport.delete(receipt)).await
    }

    /// Acknowledge a delivery and drop its offloaded payload, if any.
    /// Payload cleanup is best-effort.
    ///
    /// # Errors
    ///
    /// Same as [`QueueBroker::delete`].
    pub async fn acknowledge(&self, delivery: &Delivery) -> Result<(), RelayError> {
        self.delete(&delivery.receipt).await?;
        if let Some(key) = &delivery.payload_ref {
            if let Err(e) = self.store.delete(key).await {
                tracing::debug!(key = %key, error = %e, "offloaded payload cleanup failed");
            }
        }
        Ok(())
    }

    /// Keep a delivery hidden for another `extension`.
    ///
    /// # Errors
    ///
    /// Same as [`QueueBroker::delete`].
    pub async fn extend_visibility(
        &self,
        receipt: &ReceiptHandle,
        extension: Duration,
    ) -> Result<(), RelayError> {
        retry_transient("extend_visibility", &self.settings.retry, || {
            self.transport.change_visibility(receipt, extension)
        })
        .await
    }

    /// Lightweight depth query. Safe to call concurrently.
    ///
    /// # Errors
    ///
    /// `RelayError::TransportExhausted` if the queue stayed unreachable.
    pub async fn depth(&self) -> Result<QueueDepth, RelayError> {
        retry_transient("depth", &self.settings.retry, || self.transport.depth()).await
    }
}
