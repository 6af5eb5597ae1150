//! Controllers for the CoScale autoscaler
//!
//! The scaler controller checks every configured target on a fixed interval
//! and steps workload replica counts towards the metric band.

mod scaler;

pub use scaler::{decide, ScaleAction, ScalerController, ScalingDecision, TargetState};
