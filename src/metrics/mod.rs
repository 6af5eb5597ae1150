//! Metric sources
//!
//! The controller asks a [`MetricSource`] for the average of one metric over a
//! trailing window for one workload. [`CoScaleClient`] is the production
//! source.

mod coscale;

pub use coscale::{
    server_group_path, CoScaleClient, CoScaleConfig, Metric, MetricSeries, ServerGroup,
};

use crate::error::Result;
use crate::workload::WorkloadRef;
use async_trait::async_trait;
use std::time::Duration;

/// What to average, for which workload, over which window
#[derive(Debug, Clone, PartialEq)]
pub struct MetricQuery {
    pub metric: String,
    pub workload: WorkloadRef,
    pub window: Duration,
}

/// An averaged metric value
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub value: f64,
    /// Unit reported by the metric source, empty when unknown
    pub unit: String,
}

/// Source of averaged metric values
#[async_trait]
pub trait MetricSource: Send + Sync {
    async fn average_metric(&self, query: &MetricQuery) -> Result<MetricSample>;
}

/// Arithmetic mean, `None` for an empty slice
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean() {
        assert_eq!(mean(&[]), None);
        assert_eq!(mean(&[4.0]), Some(4.0));
        assert_eq!(mean(&[10.0, 20.0, 30.0]), Some(20.0));
    }
}
