//! CoScale Autoscaler
//!
//! Scales Kubernetes Deployments and OpenShift DeploymentConfigs based on
//! metrics collected by CoScale.
//!
//! ## Behaviour
//!
//! Every check interval, for each configured target:
//!
//! - fetch the average of the metric over the trailing window
//! - below `low_value`: remove one replica, never below `min_replicas`
//! - above `high_value`: add one replica, never above `max_replicas`
//! - after a scale, leave the target alone for `scale_backoff_sec`
//!
//! ## Example
//!
//! ```json
//! [{
//!   "namespace": "shop",
//!   "deployment_name": "frontend",
//!   "metric": {"name": "Response time", "low_value": 20, "high_value": 80, "avg_interval_sec": 300},
//!   "scale_backoff_sec": 600,
//!   "min_replicas": 2,
//!   "max_replicas": 10
//! }]
//! ```

pub mod config;
pub mod controllers;
pub mod error;
pub mod metrics;
pub mod workload;

pub use config::{MetricThresholds, ScalerTarget, Settings};
pub use controllers::{ScaleAction, ScalerController, ScalingDecision, TargetState};
pub use error::{AutoscalerError, Result};
pub use metrics::{CoScaleClient, CoScaleConfig, MetricQuery, MetricSample, MetricSource};
pub use workload::{KubeWorkloadScaler, WorkloadKind, WorkloadRef, WorkloadScaler};
