//! Telemetry helpers for structured logging and tracing.

use tracing_subscriber::EnvFilter;

/// Initialize tracing with an env-based filter. Users can install their own
/// subscriber; this helper only installs one if none is set yet.
///
/// `default_directive` is used when `RUST_LOG` is absent or invalid, e.g.
/// `"prometheus_task_relay=info"`.
pub fn init_tracing(default_directive: &str) {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
