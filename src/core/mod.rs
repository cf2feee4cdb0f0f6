//! Core relay abstractions: broker, ledger, submission, cancellation,
//! worker runtime and autoscaler.

pub mod audit;
pub mod autoscaler;
pub mod broker;
pub mod cancellation;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod mailbox;
pub mod message;
pub mod submission;
pub mod transport;
pub mod worker;

pub use audit::{build_audit_event, AuditEvent, AuditSink, InMemoryAuditSink, TracingAuditSink};
pub use autoscaler::{
    Autoscaler, AutoscalerPolicy, FleetManager, HoldReason, QueueDepthSample, ScalingDecision,
};
pub use broker::{BrokerSettings, QueueBroker};
pub use cancellation::{
    CancellationChannel, CancellationListener, DrainReport, ListenerSettings, WorkerLeases,
};
pub use error::{AppResult, BackendError, LedgerError, RelayError, TaskError};
pub use executor::{TaskContext, TaskExecutor, TaskPayload};
pub use ledger::{
    Admission, Completion, FailureKind, IdempotencyLedger, IdempotencyRecord, LedgerStatus,
    TerminalWrite,
};
pub use mailbox::Mailbox;
pub use message::{
    CancellationNotice, Delivery, ErrorPayload, MessageAttributes, OutcomeStatus, PayloadBody,
    QueueDepth, RawDelivery, ReferenceEnvelope, SendReceipt, TaskMessage, TaskOutcome,
    WireMessage,
};
pub use submission::{
    HealthStatus, PollStatus, SubmitOptions, Submitter, SubmitterSettings, TaskHandle,
};
pub use transport::{ObjectStore, QueueTransport};
pub use worker::{Spawn, WorkerHandle, WorkerRuntime, WorkerSettings, WorkerStats};
