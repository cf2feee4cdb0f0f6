//! Queue-depth autoscaler with hysteresis and cooldown.
//!
//! The loop samples the queue's visible depth, compares it against the
//! current replica count scaled by an up ratio and a down ratio, and issues
//! `set_desired_count` to a [`FleetManager`]. It never touches payloads.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::broker::QueueBroker;
use crate::core::{BackendError, RelayError};
use crate::util::clock::{elapsed_ms, now_ms};

/// External worker-fleet manager.
#[async_trait]
pub trait FleetManager: Send + Sync + 'static {
    /// Replica count currently requested for `target`.
    async fn current_count(&self, target: &str) -> Result<u32, BackendError>;

    /// Request `count` replicas for `target`.
    async fn set_desired_count(&self, target: &str, count: u32) -> Result<(), BackendError>;
}

/// Scaling rules for one fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutoscalerPolicy {
    /// Fleet name passed to the fleet manager.
    pub target: String,
    /// Lower replica bound.
    #[serde(default = "AutoscalerPolicy::default_min_workers")]
    pub min_workers: u32,
    /// Upper replica bound.
    pub max_workers: u32,
    /// Scale up when `visible > current * up_ratio`.
    #[serde(default = "AutoscalerPolicy::default_up_ratio")]
    pub up_ratio: f64,
    /// Scale down when `visible < current * down_ratio`.
    #[serde(default = "AutoscalerPolicy::default_down_ratio")]
    pub down_ratio: f64,
    /// Minimum seconds between two scaling actions.
    #[serde(default = "AutoscalerPolicy::default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    /// Seconds between samples.
    #[serde(default = "AutoscalerPolicy::default_interval_seconds")]
    pub interval_seconds: u64,
    /// Samples kept in the rolling window.
    #[serde(default = "AutoscalerPolicy::default_window")]
    pub window: usize,
}

impl AutoscalerPolicy {
    const fn default_min_workers() -> u32 {
        1
    }
    const fn default_up_ratio() -> f64 {
        5.0
    }
    const fn default_down_ratio() -> f64 {
        2.0
    }
    const fn default_cooldown_seconds() -> u64 {
        120
    }
    const fn default_interval_seconds() -> u64 {
        15
    }
    const fn default_window() -> usize {
        20
    }

    /// Policy with default ratios and timings.
    pub fn new(target: impl Into<String>, min_workers: u32, max_workers: u32) -> Self {
        Self {
            target: target.into(),
            min_workers,
            max_workers,
            up_ratio: Self::default_up_ratio(),
            down_ratio: Self::default_down_ratio(),
            cooldown_seconds: Self::default_cooldown_seconds(),
            interval_seconds: Self::default_interval_seconds(),
            window: Self::default_window(),
        }
    }

    /// Validate policy values.
    pub fn validate(&self) -> Result<(), String> {
        if self.target.trim().is_empty() {
            return Err("target must not be empty".into());
        }
        if self.min_workers > self.max_workers {
            return Err("min_workers must not exceed max_workers".into());
        }
        if self.up_ratio.is_nan() || self.up_ratio <= 0.0 || self.down_ratio.is_nan() || self.down_ratio < 0.0 {
            return Err("ratios must be positive".into());
        }
        if self.down_ratio >= self.up_ratio {
            return Err("down_ratio must be below up_ratio".into());
        }
        if self.interval_seconds == 0 {
            return Err("interval_seconds must be greater than 0".into());
        }
        Ok(())
    }

    /// Cooldown as a duration.
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }

    /// Sampling period as a duration.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

/// One depth observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepthSample {
    /// Messages ready to be received.
    pub visible: u64,
    /// Messages received but not yet deleted.
    pub in_flight: u64,
    /// Sample time in milliseconds since epoch.
    pub sampled_at_ms: u128,
}

/// Why no scaling action was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldReason {
    /// Depth sits between the two thresholds.
    WithinBand,
    /// An action happened less than a cooldown ago.
    Cooldown,
    /// The fleet is already at the bound the action would cross.
    AtBound,
}

/// Output of one autoscaler evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScalingDecision {
    /// Grow the fleet.
    ScaleUp {
        /// Count before.
        from: u32,
        /// Count requested.
        to: u32,
    },
    /// Shrink the fleet.
    ScaleDown {
        /// Count before.
        from: u32,
        /// Count requested.
        to: u32,
    },
    /// Leave the fleet alone.
    Hold {
        /// Why.
        reason: HoldReason,
    },
}

impl ScalingDecision {
    /// Replica count requested, if this is an action.
    #[must_use]
    pub const fn target_count(&self) -> Option<u32> {
        match self {
            Self::ScaleUp { to, .. } | Self::ScaleDown { to, .. } => Some(*to),
            Self::Hold { .. } => None,
        }
    }

    const fn hold(reason: HoldReason) -> Self {
        Self::Hold { reason }
    }
}

/// Control loop for one fleet.
pub struct Autoscaler {
    policy: AutoscalerPolicy,
    broker: QueueBroker,
    fleet: Arc<dyn FleetManager>,
    samples: VecDeque<QueueDepthSample>,
    last_action_ms: Option<u128>,
}

impl std::fmt::Debug for Autoscaler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Autoscaler")
            .field("policy", &self.policy)
            .field("samples", &self.samples.len())
            .field("last_action_ms", &self.last_action_ms)
            .finish_non_exhaustive()
    }
}

impl Autoscaler {
    /// Create an autoscaler sampling `broker` and driving `fleet`.
    ///
    /// # Errors
    ///
    /// `RelayError::InvalidConfig` if the policy is invalid.
    pub fn new(
        policy: AutoscalerPolicy,
        broker: QueueBroker,
        fleet: Arc<dyn FleetManager>,
    ) -> Result<Self, RelayError> {
        policy.validate().map_err(RelayError::InvalidConfig)?;
        Ok(Self {
            samples: VecDeque::with_capacity(policy.window),
            policy,
            broker,
            fleet,
            last_action_ms: None,
        })
    }

    /// Policy in use.
    #[must_use]
    pub const fn policy(&self) -> &AutoscalerPolicy {
        &self.policy
    }

    /// Samples in the rolling window, oldest first.
    #[must_use]
    pub fn recent_samples(&self) -> Vec<QueueDepthSample> {
        self.samples.iter().copied().collect()
    }

    /// Decide what to do for `sample` given `current` replicas. Pure: does
    /// not record anything.
    #[must_use]
    pub fn evaluate(&self, sample: &QueueDepthSample, current: u32, now_ms: u128) -> ScalingDecision {
        #[allow(clippy::cast_precision_loss)]
        let visible = sample.visible as f64;
        let workers = f64::from(current);
        let p = &self.policy;

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let proportional = (visible / p.up_ratio).ceil().min(f64::from(u32::MAX)) as u32;

        let banded = if visible > workers * p.up_ratio {
            current.saturating_add(1).max(proportional)
        } else if visible < workers * p.down_ratio {
            current.saturating_sub(1).min(proportional)
        } else {
            current
        };
        // a fleet outside its bounds is pulled back even inside the band
        let to = banded.clamp(p.min_workers, p.max_workers);

        let decision = match to.cmp(&current) {
            std::cmp::Ordering::Greater => ScalingDecision::ScaleUp { from: current, to },
            std::cmp::Ordering::Less => ScalingDecision::ScaleDown { from: current, to },
            std::cmp::Ordering::Equal if banded == current => {
                return ScalingDecision::hold(HoldReason::WithinBand);
            }
            std::cmp::Ordering::Equal => return ScalingDecision::hold(HoldReason::AtBound),
        };

        match self.last_action_ms {
            Some(last) if u128::from(p.cooldown_seconds) * 1_000 > elapsed_ms(last, now_ms) => {
                ScalingDecision::hold(HoldReason::Cooldown)
            }
            _ => decision,
        }
    }

    /// Record `sample` in the rolling window.
    pub fn observe(&mut self, sample: QueueDepthSample) {
        if self.policy.window == 0 {
            return;
        }
        if self.samples.len() >= self.policy.window {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Sample, decide, and apply once.
    ///
    /// # Errors
    ///
    /// Depth query failures, and fleet-manager failures (the action then does
    /// not start a cooldown).
    pub async fn tick(&mut self, now_ms: u128) -> Result<ScalingDecision, RelayError> {
        let depth = self.broker.depth().await?;
        let sample = QueueDepthSample {
            visible: depth.visible,
            in_flight: depth.in_flight,
            sampled_at_ms: now_ms,
        };
        self.observe(sample);

        let current = self.fleet.current_count(&self.policy.target).await?;
        let decision = self.evaluate(&sample, current, now_ms);

        if let Some(count) = decision.target_count() {
            if let Err(e) = self.fleet.set_desired_count(&self.policy.target, count).await {
                tracing::warn!(
                    target_fleet = %self.policy.target,
                    desired = count,
                    error = %e,
                    "fleet manager rejected scaling command"
                );
                return Err(e.into());
            }
            self.last_action_ms = Some(now_ms);
            tracing::info!(
                target_fleet = %self.policy.target,
                visible = sample.visible,
                from = current,
                to = count,
                "scaling fleet"
            );
        } else {
            tracing::debug!(
                target_fleet = %self.policy.target,
                visible = sample.visible,
                current,
                ?decision,
                "holding fleet size"
            );
        }
        Ok(decision)
    }

    /// Tick every `interval_seconds` until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.policy.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick(now_ms()).await {
                        tracing::warn!(target_fleet = %self.policy.target, error = %e, "autoscaler tick failed");
                    }
                }
            }
        }
        tracing::debug!(target_fleet = %self.policy.target, "autoscaler stopped");
    }
}
