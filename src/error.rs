//! Error types for the CoScale autoscaler

use std::fmt;
use std::time::Duration;

/// Result type alias for autoscaler operations
pub type Result<T> = std::result::Result<T, AutoscalerError>;

/// Errors that can occur while configuring or running the autoscaler
#[derive(Debug)]
pub enum AutoscalerError {
    /// Invalid or incomplete configuration
    Configuration(String),
    /// Kubernetes API error
    KubeApi(String),
    /// CoScale API answered with something we cannot use
    MetricSource(String),
    /// HTTP transport error
    Http(String),
    /// Serialization error
    Serialization(String),
    /// Metric, server group or workload does not exist
    NotFound(String),
    /// An external call did not finish in time
    Timeout(Duration),
}

impl fmt::Display for AutoscalerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AutoscalerError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            AutoscalerError::KubeApi(msg) => write!(f, "Kubernetes API error: {}", msg),
            AutoscalerError::MetricSource(msg) => write!(f, "Metric source error: {}", msg),
            AutoscalerError::Http(msg) => write!(f, "HTTP error: {}", msg),
            AutoscalerError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            AutoscalerError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AutoscalerError::Timeout(after) => write!(f, "Timed out after {:?}", after),
        }
    }
}

impl std::error::Error for AutoscalerError {}

impl From<kube::Error> for AutoscalerError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => AutoscalerError::NotFound(ae.message),
            err => AutoscalerError::KubeApi(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for AutoscalerError {
    fn from(err: reqwest::Error) -> Self {
        AutoscalerError::Http(err.to_string())
    }
}

impl From<serde_json::Error> for AutoscalerError {
    fn from(err: serde_json::Error) -> Self {
        AutoscalerError::Serialization(err.to_string())
    }
}
