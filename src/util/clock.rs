//! Wall-clock helpers.
//!
//! Timestamps are milliseconds since the Unix epoch. Components that make
//! time-based decisions (ledger staleness, autoscaler cooldown) take `now_ms`
//! as an argument so tests can drive them deterministically.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

/// Milliseconds elapsed between `earlier_ms` and `now_ms`, saturating at zero.
#[must_use]
pub const fn elapsed_ms(earlier_ms: u128, now_ms: u128) -> u128 {
    now_ms.saturating_sub(earlier_ms)
}

/// Whether more than `timeout` has passed since `earlier_ms`.
#[must_use]
pub fn is_older_than(earlier_ms: u128, now_ms: u128, timeout: Duration) -> bool {
    elapsed_ms(earlier_ms, now_ms) > timeout.as_millis()
}
