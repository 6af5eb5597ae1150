//! Scaling Controller
//!
//! Periodically checks every configured target: fetch the metric average,
//! read the replica count, decide, and step the workload one replica up or
//! down within its bounds.
//!
//! # Behaviour
//!
//! - **Backoff**: after a successful scale, a target is left alone for
//!   `scale_backoff_sec` seconds
//! - **Clamping**: replica counts are capped at `min_replicas`/`max_replicas`,
//!   never rejected
//! - **Isolation**: a failing or slow target never holds up the others, and
//!   every external call is bounded by a timeout

use crate::config::ScalerTarget;
use crate::error::{AutoscalerError, Result};
use crate::metrics::MetricSource;
use crate::workload::WorkloadScaler;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// A target together with the state its evaluations carry between ticks
#[derive(Debug, Clone)]
pub struct TargetState {
    pub target: ScalerTarget,

    /// Time of the last successful scale, `None` until the first one
    pub last_scale_time: Option<DateTime<Utc>>,
}

impl TargetState {
    pub fn new(target: ScalerTarget) -> Self {
        Self {
            target,
            last_scale_time: None,
        }
    }
}

/// Possible outcomes of a scaling decision
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum ScaleAction {
    /// Metric is within bounds
    None,
    /// Last scale was too recent
    InBackoff,
    /// Add a replica
    ScaleUp,
    /// Remove a replica
    ScaleDown,
    /// Metric is low but the workload is already at its minimum
    AtMinimum,
    /// Metric is high but the workload is already at its maximum
    AtMaximum,
}

/// Result of [`decide`]
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScalingDecision {
    pub action: ScaleAction,
    pub current_replicas: i32,
    pub target_replicas: i32,
    pub reason: String,
}

impl ScalingDecision {
    fn hold(action: ScaleAction, current_replicas: i32, reason: String) -> Self {
        Self {
            action,
            current_replicas,
            target_replicas: current_replicas,
            reason,
        }
    }

    /// Whether the workload has to be patched to follow this decision
    pub fn requires_patch(&self) -> bool {
        self.target_replicas != self.current_replicas
    }
}

/// Decide the replica count a target should move to.
///
/// Steps are always a single replica, clamped to the target's bounds. Nothing
/// moves while the target is in backoff.
pub fn decide(
    target: &ScalerTarget,
    value: f64,
    current_replicas: i32,
    last_scale_time: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> ScalingDecision {
    if let Some(last) = last_scale_time {
        let elapsed = now.signed_duration_since(last);
        let backoff = target.backoff();
        if elapsed < backoff {
            return ScalingDecision::hold(
                ScaleAction::InBackoff,
                current_replicas,
                format!(
                    "In backoff after last scaling ({}s remaining)",
                    backoff
                        .checked_sub(&elapsed)
                        .map_or(i64::MAX, |remaining| remaining.num_seconds())
                ),
            );
        }
    }

    let metric = &target.metric;
    let (desired, at_bound, reason) = if value < metric.low_value {
        (
            current_replicas.saturating_sub(1).max(target.min_replicas),
            ScaleAction::AtMinimum,
            format!("{} is below low value {}", value, metric.low_value),
        )
    } else if value > metric.high_value {
        (
            current_replicas.saturating_add(1).min(target.max_replicas),
            ScaleAction::AtMaximum,
            format!("{} is above high value {}", value, metric.high_value),
        )
    } else {
        return ScalingDecision::hold(
            ScaleAction::None,
            current_replicas,
            format!(
                "{} is within [{}, {}]",
                value, metric.low_value, metric.high_value
            ),
        );
    };

    let action = match desired.cmp(&current_replicas) {
        std::cmp::Ordering::Greater => ScaleAction::ScaleUp,
        std::cmp::Ordering::Less => ScaleAction::ScaleDown,
        std::cmp::Ordering::Equal => at_bound,
    };

    ScalingDecision {
        action,
        current_replicas,
        target_replicas: desired,
        reason,
    }
}

/// Drives the check cycle of all targets
pub struct ScalerController {
    metrics: Arc<dyn MetricSource>,
    workloads: Arc<dyn WorkloadScaler>,
    check_interval: Duration,
    call_timeout: Duration,
}

impl ScalerController {
    /// Create a new controller with a one minute interval and ten second call timeout
    pub fn new(metrics: Arc<dyn MetricSource>, workloads: Arc<dyn WorkloadScaler>) -> Self {
        Self {
            metrics,
            workloads,
            check_interval: Duration::from_secs(60),
            call_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Check all targets every interval until `shutdown` resolves.
    ///
    /// The first check happens immediately. Checks never overlap; a check still
    /// running at shutdown is abandoned.
    pub async fn run<F>(&self, mut states: Vec<TargetState>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(
            targets = states.len(),
            interval_secs = self.check_interval.as_secs(),
            "Starting scaler controller"
        );

        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Stopping scaler controller");
                    break;
                }
                _ = async {
                    ticker.tick().await;
                    self.run_tick(&mut states, Utc::now()).await;
                } => {}
            }
        }
    }

    /// Check every target once, concurrently.
    pub async fn run_tick(&self, states: &mut [TargetState], now: DateTime<Utc>) {
        let checks = states.iter_mut().map(|state| async move {
            // Failures are logged where they happen
            let _ = self.evaluate_target(state, now).await;
        });
        join_all(checks).await;
    }

    /// Check a single target and scale it if needed.
    pub async fn evaluate_target(
        &self,
        state: &mut TargetState,
        now: DateTime<Utc>,
    ) -> Result<ScalingDecision> {
        let target = &state.target;
        let workload = target.workload();

        let sample = self
            .bounded(self.metrics.average_metric(&target.metric_query()))
            .await
            .inspect_err(|e| {
                error!(
                    namespace = %target.namespace,
                    workload = %workload,
                    metric = %target.metric.name,
                    error = %e,
                    "Failed to retrieve metric data"
                )
            })?;

        info!(
            namespace = %target.namespace,
            workload = %workload,
            metric = %target.metric.name,
            value = sample.value,
            unit = %sample.unit,
            "Checking metric"
        );

        let current = self
            .bounded(self.workloads.replicas(&workload))
            .await
            .inspect_err(|e| {
                error!(
                    namespace = %target.namespace,
                    workload = %workload,
                    metric = %target.metric.name,
                    error = %e,
                    "Failed to read replica count"
                )
            })?;

        let decision = decide(target, sample.value, current, state.last_scale_time, now);

        match decision.action {
            ScaleAction::InBackoff => {
                info!(
                    namespace = %target.namespace,
                    workload = %workload,
                    metric = %target.metric.name,
                    reason = %decision.reason,
                    "In backoff after last scaling"
                )
            }
            ScaleAction::AtMinimum => {
                info!(
                    namespace = %target.namespace,
                    workload = %workload,
                    metric = %target.metric.name,
                    current_replicas = current,
                    "Reached min replicas of {}",
                    target.min_replicas
                )
            }
            ScaleAction::AtMaximum => {
                info!(
                    namespace = %target.namespace,
                    workload = %workload,
                    metric = %target.metric.name,
                    current_replicas = current,
                    "Reached max replicas of {}",
                    target.max_replicas
                )
            }
            ScaleAction::None => {
                debug!(
                    namespace = %target.namespace,
                    workload = %workload,
                    metric = %target.metric.name,
                    reason = %decision.reason,
                    "No scaling required"
                )
            }
            ScaleAction::ScaleUp | ScaleAction::ScaleDown => {}
        }

        if !decision.requires_patch() {
            return Ok(decision);
        }

        info!(
            namespace = %target.namespace,
            workload = %workload,
            metric = %target.metric.name,
            value = sample.value,
            current_replicas = decision.current_replicas,
            target_replicas = decision.target_replicas,
            reason = %decision.reason,
            "Scaling to {} replicas",
            decision.target_replicas
        );

        self.bounded(self.workloads.scale(&workload, decision.target_replicas))
            .await
            .inspect_err(|e| {
                error!(
                    namespace = %target.namespace,
                    workload = %workload,
                    metric = %target.metric.name,
                    error = %e,
                    "Failed to scale workload"
                )
            })?;

        state.last_scale_time = Some(now);
        Ok(decision)
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.call_timeout, call)
            .await
            .map_err(|_| AutoscalerError::Timeout(self.call_timeout))?
    }
}
