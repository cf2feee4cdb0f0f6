//! Task execution traits and payload abstraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::TaskError;
use crate::util::serde::{LogicalKey, TaskId};

/// Marker trait for serializable task payloads.
///
/// Payloads travel as bytes; typed payloads are JSON-encoded on submit and
/// can be decoded by executors with [`TaskContext::decode`].
pub trait TaskPayload: Send + Sync + Serialize + for<'de> Deserialize<'de> + 'static {}

/// Blanket implementation: any type meeting the requirements is a TaskPayload.
impl<T> TaskPayload for T where T: Send + Sync + Serialize + for<'de> Deserialize<'de> + 'static {}

/// Everything an executor knows about the attempt it is running.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Correlation id of the delivered message.
    pub task_id: TaskId,
    /// Ledger key.
    pub logical_key: LogicalKey,
    /// Ledger attempt number.
    pub attempt: u32,
    /// How many times the transport delivered this message.
    pub receive_count: u32,
    cancellation: CancellationToken,
}

impl TaskContext {
    /// Build a context around a cancellation token.
    #[must_use]
    pub const fn new(
        task_id: TaskId,
        logical_key: LogicalKey,
        attempt: u32,
        receive_count: u32,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            task_id,
            logical_key,
            attempt,
            receive_count,
            cancellation,
        }
    }

    /// Whether cancellation was requested. Long-running executors should
    /// check this between sub-steps.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }

    /// Return `Err` if cancellation was requested; for use with `?` at yield
    /// points.
    ///
    /// # Errors
    ///
    /// A `TaskError` saying the task was cancelled.
    pub fn checkpoint(&self) -> Result<(), TaskError> {
        if self.is_cancelled() {
            Err(TaskError::new("cancelled"))
        } else {
            Ok(())
        }
    }

    /// Decode a JSON payload produced by `Submitter::submit_json`.
    ///
    /// # Errors
    ///
    /// A `TaskError` describing the decode failure.
    pub fn decode<P: TaskPayload>(payload: &[u8]) -> Result<P, TaskError> {
        serde_json::from_slice(payload).map_err(|e| TaskError::new(format!("bad payload: {e}")))
    }
}

/// Abstraction for executing a task payload and producing a result.
///
/// The executor runs the actual business logic. Cancellation is cooperative:
/// the runtime stops awaiting the future at its next yield point once the
/// task is cancelled, and executors can poll [`TaskContext::is_cancelled`]
/// between blocking sub-steps.
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use prometheus_task_relay::core::{TaskContext, TaskError, TaskExecutor};
///
/// #[derive(Clone)]
/// struct Uppercase;
///
/// #[async_trait]
/// impl TaskExecutor for Uppercase {
///     async fn execute(&self, payload: Vec<u8>, ctx: TaskContext) -> Result<Vec<u8>, TaskError> {
///         ctx.checkpoint()?;
///         Ok(payload.to_ascii_uppercase())
///     }
/// }
/// ```
#[async_trait]
pub trait TaskExecutor: Send + Sync + Clone + 'static {
    /// Execute a task payload and return the result bytes.
    ///
    /// # Arguments
    ///
    /// * `payload` - The resolved payload bytes
    /// * `ctx` - Attempt metadata and the cancellation signal
    ///
    /// # Returns
    ///
    /// Result bytes on success. An `Err` is recorded as a logic failure and
    /// never retried by the relay.
    async fn execute(&self, payload: Vec<u8>, ctx: TaskContext) -> Result<Vec<u8>, TaskError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(token: CancellationToken) -> TaskContext {
        TaskContext::new(TaskId::from("t-1"), LogicalKey::new("k-1"), 1, 1, token)
    }

    #[test]
    fn checkpoint_follows_the_token() {
        let token = CancellationToken::new();
        let ctx = context(token.clone());
        assert!(ctx.checkpoint().is_ok());
        token.cancel();
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.checkpoint().unwrap_err().message, "cancelled");
    }

    #[test]
    fn decode_reports_bad_payloads() {
        let ok: Vec<u32> = TaskContext::decode(b"[1,2]").unwrap();
        assert_eq!(ok, vec![1, 2]);
        let err = TaskContext::decode::<Vec<u32>>(b"nope").unwrap_err();
        assert!(err.message.starts_with("bad payload"), "{err}");
    }
}
