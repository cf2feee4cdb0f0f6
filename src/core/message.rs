//! Wire and domain message types.
//!
//! A task travels as a [`WireMessage`]: a body (raw payload bytes, or a small
//! JSON envelope `{"ref": "<key>"}` when the payload was offloaded to the
//! object store) plus [`MessageAttributes`]. The broker converts between the
//! wire form and the uniform [`TaskMessage`] that higher layers see.

use serde::{Deserialize, Serialize};

use crate::core::RelayError;
use crate::util::serde::{LogicalKey, ReceiptHandle, TaskId};

/// Payload of a task message: inline bytes or a pointer to an object-store
/// blob. Exactly one of the two is present by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadBody {
    /// Payload carried in the message body.
    Inline(Vec<u8>),
    /// Object-store key holding the payload.
    Reference(String),
}

impl PayloadBody {
    /// Inline bytes, if the payload is not offloaded.
    #[must_use]
    pub fn inline(&self) -> Option<&[u8]> {
        match self {
            Self::Inline(bytes) => Some(bytes),
            Self::Reference(_) => None,
        }
    }

    /// Object-store key, if the payload is offloaded.
    #[must_use]
    pub fn reference(&self) -> Option<&str> {
        match self {
            Self::Inline(_) => None,
            Self::Reference(key) => Some(key),
        }
    }
}

/// Task message as created by the submission loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskMessage {
    /// Correlation id for this submission.
    pub task_id: TaskId,
    /// Caller-stable identity used by the idempotency ledger.
    pub logical_key: LogicalKey,
    /// Serialized work description.
    pub body: PayloadBody,
    /// Optional ordering group.
    pub group_id: Option<String>,
    /// Enqueue time in milliseconds since epoch.
    pub enqueued_at_ms: u128,
}

impl TaskMessage {
    /// Build an inline task message stamped with the current time.
    pub fn new(task_id: TaskId, logical_key: LogicalKey, payload: Vec<u8>) -> Self {
        Self {
            task_id,
            logical_key,
            body: PayloadBody::Inline(payload),
            group_id: None,
            enqueued_at_ms: crate::util::clock::now_ms(),
        }
    }

    /// Attach an ordering group.
    #[must_use]
    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }
}

/// Attributes carried next to the body on the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAttributes {
    /// Correlation id.
    pub task_id: TaskId,
    /// Ledger key.
    pub logical_key: LogicalKey,
    /// Ordering group, for FIFO queues.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Enqueue time in milliseconds since epoch.
    pub enqueued_at_ms: u128,
    /// Size of the offloaded payload; present only when the body is a
    /// reference envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<usize>,
}

/// Message as it travels through the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    /// Raw payload or reference envelope.
    pub body: Vec<u8>,
    /// Correlation attributes.
    pub attributes: MessageAttributes,
}

/// Body of an overflowed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceEnvelope {
    /// Object-store key of the payload.
    #[serde(rename = "ref")]
    pub key: String,
}

impl WireMessage {
    /// Encode a task message into its wire form.
    pub fn encode(message: &TaskMessage) -> Result<Self, RelayError> {
        let (body, payload_size) = match &message.body {
            PayloadBody::Inline(bytes) => (bytes.clone(), None),
            PayloadBody::Reference(key) => {
                let envelope = serde_json::to_vec(&ReferenceEnvelope { key: key.clone() })?;
                // the broker overwrites this with the offloaded length
                (envelope, Some(0))
            }
        };
        Ok(Self {
            body,
            attributes: MessageAttributes {
                task_id: message.task_id.clone(),
                logical_key: message.logical_key.clone(),
                group_id: message.group_id.clone(),
                enqueued_at_ms: message.enqueued_at_ms,
                payload_size,
            },
        })
    }

    /// Decode the wire form back into a task message (without resolving any
    /// reference).
    pub fn decode(&self) -> Result<TaskMessage, RelayError> {
        let body = if self.attributes.payload_size.is_some() {
            let envelope: ReferenceEnvelope = serde_json::from_slice(&self.body)?;
            PayloadBody::Reference(envelope.key)
        } else {
            PayloadBody::Inline(self.body.clone())
        };
        Ok(TaskMessage {
            task_id: self.attributes.task_id.clone(),
            logical_key: self.attributes.logical_key.clone(),
            body,
            group_id: self.attributes.group_id.clone(),
            enqueued_at_ms: self.attributes.enqueued_at_ms,
        })
    }
}

/// A message handed out by a transport receive.
#[derive(Debug, Clone)]
pub struct RawDelivery {
    /// Transport message id.
    pub message_id: String,
    /// The message as stored on the queue.
    pub message: WireMessage,
    /// Handle for delete / visibility changes.
    pub receipt: ReceiptHandle,
    /// How many times this message has been received, including this one.
    pub receive_count: u32,
}

/// A received task with its payload fully resolved.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Correlation id.
    pub task_id: TaskId,
    /// Ledger key.
    pub logical_key: LogicalKey,
    /// Resolved payload bytes.
    pub payload: Vec<u8>,
    /// Ordering group.
    pub group_id: Option<String>,
    /// Enqueue time in milliseconds since epoch.
    pub enqueued_at_ms: u128,
    /// Handle for delete / visibility changes.
    pub receipt: ReceiptHandle,
    /// Receive count reported by the transport.
    pub receive_count: u32,
    /// Object-store key the payload was loaded from, if it was offloaded.
    pub payload_ref: Option<String>,
}

/// Result of a successful broker send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    /// Transport message id.
    pub message_id: String,
    /// Correlation id of the sent task.
    pub task_id: TaskId,
    /// Object-store key if the payload was offloaded.
    pub payload_ref: Option<String>,
}

/// Lightweight depth reading of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    /// Messages ready to be received.
    pub visible: u64,
    /// Messages received but neither deleted nor expired.
    pub in_flight: u64,
}

/// Request to abort an in-flight task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationNotice {
    /// Task to cancel.
    pub task_id: TaskId,
    /// Request time in milliseconds since epoch.
    pub requested_at_ms: u128,
}

/// Terminal status of a task as reported to pollers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// The task body succeeded.
    Completed,
    /// The task body failed, or its lease expired.
    Failed,
    /// The task was cancelled before finishing.
    Cancelled,
}

/// Terminal outcome stored in the result mailbox, keyed by task id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// Task the outcome is reported for.
    pub task_id: TaskId,
    /// Logical key the outcome belongs to.
    pub logical_key: LogicalKey,
    /// Terminal status.
    pub status: OutcomeStatus,
    /// Object-store key of the result or error blob.
    pub result_ref: Option<String>,
    /// Ledger attempt that produced the outcome.
    pub attempt: u32,
    /// Completion time in milliseconds since epoch.
    pub finished_at_ms: u128,
}

/// Error blob stored for failed or cancelled tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Failure category (`logic`, `cancelled`, `lease_expired`).
    pub kind: String,
    /// Human-readable description.
    pub message: String,
}
