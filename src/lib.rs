//! # Prometheus Task Relay
//!
//! Exactly-once task execution on top of at-least-once queues.
//!
//! Managed queues redeliver a message whenever its visibility timeout lapses
//! before the consumer deletes it. This crate turns that into exactly-once
//! *effects* for work that is expensive to repeat:
//!
//! - **Queue broker**: sends and receives task messages, moving payloads that
//!   exceed the queue's inline limit to an object store and leaving a
//!   reference envelope on the wire.
//! - **Idempotency ledger**: a durable record per logical key. The first
//!   worker to see a key takes the lease; redeliveries of finished work are
//!   acknowledged without running again, and stale leases are reclaimed.
//! - **Submission loop**: submit, poll with bounded waits, request
//!   cancellation and inspect ledger health.
//! - **Cancellation**: notices on a side channel reach whichever worker is
//!   running the task, which stops it cooperatively.
//! - **Worker runtime**: bounded concurrency, per-task heartbeats, panic
//!   containment and graceful drain.
//! - **Autoscaler**: queue-depth driven fleet sizing with a hysteresis band
//!   and a cooldown.
//!
//! ```rust,ignore
//! use prometheus_task_relay::config::RelayConfig;
//! use prometheus_task_relay::runtime::Relay;
//! use prometheus_task_relay::core::PollStatus;
//! use std::time::Duration;
//!
//! let relay = Relay::startup(&RelayConfig::load()?, MyExecutor, None).await?;
//! let handle = relay.submitter().submit(b"input".to_vec(), "order-42", Duration::from_secs(60))
//!     .await?;
//! if let PollStatus::Done(bytes) = relay.submitter().wait(&handle).await? {
//!     println!("{} bytes", bytes.len());
//! }
//! relay.shutdown().await;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core relay abstractions and algorithms.
pub mod core;
/// Configuration models for queues, backends and workers.
pub mod config;
/// Builders to construct relay components from configuration.
pub mod builders;
/// Infrastructure adapters for queues, object stores, ledgers and mailboxes.
pub mod infra;
/// Runtime adapters and API surface.
pub mod runtime;
/// Shared utilities.
pub mod util;
