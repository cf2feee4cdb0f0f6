//! Runtime adapters: tokio spawner, relay lifecycle and API surface.

pub mod api;
pub mod lifecycle;
pub mod tokio_spawner;

pub use api::{
    cancel_task, health, key_health, submit_task, task_status, Health, KeyHealthResponse,
    TaskState, TaskStatusResponse, TaskSubmission,
};
pub use lifecycle::{sweep_retention, Relay, RelayExtras, SweepReport};
pub use tokio_spawner::TokioSpawner;
