//! Bounded exponential backoff with full jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::{BackendError, RelayError};

/// Retry policy for transport and object-store calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    #[serde(default = "RetryPolicy::default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "RetryPolicy::default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    #[serde(default = "RetryPolicy::default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Randomize each delay uniformly in `[0, computed]`.
    #[serde(default = "RetryPolicy::default_jitter")]
    pub jitter: bool,
}

impl RetryPolicy {
    const fn default_max_attempts() -> u32 {
        5
    }
    const fn default_base_delay_ms() -> u64 {
        100
    }
    const fn default_max_delay_ms() -> u64 {
        5_000
    }
    const fn default_jitter() -> bool {
        true
    }

    /// Policy that never retries. Handy in tests.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter: false,
        }
    }

    /// Validate policy values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be greater than 0".into());
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err("base_delay_ms must not exceed max_delay_ms".into());
        }
        Ok(())
    }

    /// Un-jittered delay before retry number `retry` (0-based).
    #[must_use]
    pub fn ceiling_for(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry.min(32)).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Delay before retry number `retry`, jittered if enabled.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let ceiling = self.ceiling_for(retry);
        if !self.jitter || ceiling.is_zero() {
            return ceiling;
        }
        let millis = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::rng().random_range(0..=millis))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            base_delay_ms: Self::default_base_delay_ms(),
            max_delay_ms: Self::default_max_delay_ms(),
            jitter: Self::default_jitter(),
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or the policy is exhausted.
///
/// Only [`BackendError::Transient`] is retried. Exhaustion yields
/// [`RelayError::TransportExhausted`] so callers can tell "may or may not
/// have happened" apart from a definite failure.
pub async fn retry_transient<T, F, Fut>(
    operation: &'static str,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, RelayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(BackendError::Transient(reason)) if attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt - 1);
                tracing::warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    %reason,
                    "transient backend failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(BackendError::Transient(reason)) => {
                tracing::error!(operation, attempts = attempt, %reason, "retries exhausted");
                return Err(RelayError::TransportExhausted {
                    operation,
                    attempts: attempt,
                    last_error: reason,
                });
            }
            Err(other) => return Err(RelayError::Backend(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 4,
            jitter: true,
        }
    }

    #[test]
    fn ceiling_grows_exponentially_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter: false,
        };
        assert_eq!(policy.ceiling_for(0), Duration::from_millis(100));
        assert_eq!(policy.ceiling_for(1), Duration::from_millis(200));
        assert_eq!(policy.ceiling_for(3), Duration::from_millis(800));
        assert_eq!(policy.ceiling_for(4), Duration::from_millis(1_000));
        assert_eq!(policy.ceiling_for(60), Duration::from_millis(1_000));
    }

    #[test]
    fn jittered_delay_stays_under_ceiling() {
        let policy = RetryPolicy::default();
        for retry in 0..8 {
            assert!(policy.delay_for(retry) <= policy.ceiling_for(retry));
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_transient("op", &fast_policy(5), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(BackendError::Transient("flaky".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_is_a_distinct_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_transient("send", &fast_policy(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BackendError::Transient("down".into())) }
        })
        .await;
        assert!(matches!(
            result,
            Err(RelayError::TransportExhausted { operation: "send", attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_fail_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_transient("get", &fast_policy(5), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BackendError::NotFound("blob".into())) }
        })
        .await;
        assert!(matches!(result, Err(RelayError::Backend(BackendError::NotFound(_)))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn validation_rejects_zero_attempts() {
        let mut policy = RetryPolicy::default();
        policy.max_attempts = 0;
        assert!(policy.validate().is_err());
    }
}
