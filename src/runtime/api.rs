//! API-facing request/response models for submitting and observing tasks.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{
    HealthStatus, PollStatus, QueueBroker, QueueDepth, SubmitOptions, Submitter, TaskHandle,
    WorkerStats,
};
use crate::util::serde::LogicalKey;

/// Task submission payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSubmission {
    /// Ledger key; resubmitting the same key never runs the work twice.
    pub logical_key: LogicalKey,
    /// Task input, forwarded to the executor as JSON bytes.
    pub payload: serde_json::Value,
    /// Optional timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Optional FIFO ordering group.
    #[serde(default)]
    pub group_id: Option<String>,
}

/// Terminal or pending state as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// No result yet.
    Pending,
    /// Completed successfully.
    Done,
    /// Failed.
    Failed,
    /// Cancelled on request.
    Cancelled,
}

/// Task status response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    /// Handle the status refers to.
    pub handle: TaskHandle,
    /// Current state.
    pub state: TaskState,
    /// Result, when done and valid JSON.
    pub result: Option<serde_json::Value>,
    /// Failure reason.
    pub reason: Option<String>,
}

impl TaskStatusResponse {
    /// Build a response from a poll result.
    #[must_use]
    pub fn from_poll(handle: TaskHandle, status: PollStatus) -> Self {
        let (state, result, reason) = match status {
            PollStatus::Pending => (TaskState::Pending, None, None),
            PollStatus::Done(bytes) => match serde_json::from_slice(&bytes) {
                Ok(value) => (TaskState::Done, Some(value), None),
                Err(_) => (
                    TaskState::Done,
                    Some(serde_json::Value::String(String::from_utf8_lossy(&bytes).into_owned())),
                    None,
                ),
            },
            PollStatus::Failed(reason) => (TaskState::Failed, None, Some(reason)),
            PollStatus::Cancelled => (TaskState::Cancelled, None, None),
        };
        Self {
            handle,
            state,
            result,
            reason,
        }
    }
}

/// Per-key ledger view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyHealthResponse {
    /// Key inspected.
    pub logical_key: LogicalKey,
    /// Ledger status.
    pub status: HealthStatus,
}

/// Relay health response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    /// Whether the task queue answered.
    pub ok: bool,
    /// Queue depth, when the queue answered.
    pub queue: Option<QueueDepth>,
    /// Worker counters, when a worker runs in this process.
    pub worker: Option<WorkerStats>,
    /// Error from the depth query.
    pub error: Option<String>,
}

/// Submit a task through `submitter`.
///
/// # Errors
///
/// Returns the relay error rendered as a string.
pub async fn submit_task(submitter: &Submitter, req: TaskSubmission) -> Result<TaskHandle, String> {
    let options = SubmitOptions {
        timeout: req.timeout_secs.map(Duration::from_secs),
        group_id: req.group_id,
    };
    submitter
        .submit_json(&req.payload, req.logical_key, options)
        .await
        .map_err(|e| e.to_string())
}

/// Poll a task once.
///
/// # Errors
///
/// Returns the relay error rendered as a string.
pub async fn task_status(
    submitter: &Submitter,
    handle: TaskHandle,
) -> Result<TaskStatusResponse, String> {
    let status = submitter.poll(&handle).await.map_err(|e| e.to_string())?;
    Ok(TaskStatusResponse::from_poll(handle, status))
}

/// Request cancellation of a task.
///
/// # Errors
///
/// Returns the relay error rendered as a string.
pub async fn cancel_task(submitter: &Submitter, handle: &TaskHandle) -> Result<(), String> {
    submitter
        .request_cancel(handle)
        .await
        .map_err(|e| e.to_string())
}

/// Ledger view of one key.
///
/// # Errors
///
/// Returns the relay error rendered as a string.
pub async fn key_health(
    submitter: &Submitter,
    logical_key: LogicalKey,
) -> Result<KeyHealthResponse, String> {
    let status = submitter
        .health(&logical_key)
        .await
        .map_err(|e| e.to_string())?;
    Ok(KeyHealthResponse {
        logical_key,
        status,
    })
}

/// Query the task queue depth and report worker counters.
pub async fn health(broker: &QueueBroker, worker: Option<WorkerStats>) -> Health {
    match broker.depth().await {
        Ok(depth) => Health {
            ok: true,
            queue: Some(depth),
            worker,
            error: None,
        },
        Err(e) => Health {
            ok: false,
            queue: None,
            worker,
            error: Some(e.to_string()),
        },
    }
}
