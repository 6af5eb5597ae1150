//! Autoscaler configuration
//!
//! Targets arrive as a JSON array in `SCALER_CONFIG`:
//!
//! ```json
//! [{
//!   "namespace": "shop",
//!   "deployment_type": "Deployment",
//!   "deployment_name": "frontend",
//!   "metric": {"name": "Response time", "low_value": 20, "high_value": 80, "avg_interval_sec": 300},
//!   "scale_backoff_sec": 600,
//!   "min_replicas": 2,
//!   "max_replicas": 10
//! }]
//! ```
//!
//! The whole list is validated up front. A single invalid target rejects the
//! whole configuration.

use crate::error::{AutoscalerError, Result};
use crate::metrics::{CoScaleConfig, MetricQuery};
use crate::workload::{WorkloadKind, WorkloadRef};
use chrono::TimeDelta;
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Metadata, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://api.coscale.com";
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 10;

/// One workload under autoscaling control
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ScalerTarget {
    /// Namespace of the workload
    #[serde(alias = "namespace_name")]
    pub namespace: String,

    /// Kind of workload, Deployment unless stated otherwise
    #[serde(default, deserialize_with = "lenient_workload_kind")]
    #[schemars(schema_with = "workload_kind_schema")]
    pub deployment_type: WorkloadKind,

    /// Name of the workload
    pub deployment_name: String,

    /// Metric and thresholds that drive scaling
    pub metric: MetricThresholds,

    /// Minimum seconds between two scaling actions
    #[serde(deserialize_with = "lenient_number")]
    #[schemars(schema_with = "integer_or_string_schema")]
    pub scale_backoff_sec: u64,

    /// Lower replica bound (inclusive)
    #[serde(deserialize_with = "lenient_number")]
    #[schemars(schema_with = "integer_or_string_schema")]
    pub min_replicas: i32,

    /// Upper replica bound (inclusive)
    #[serde(deserialize_with = "lenient_number")]
    #[schemars(schema_with = "integer_or_string_schema")]
    pub max_replicas: i32,
}

/// CoScale metric and the band it should stay in
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MetricThresholds {
    /// Metric name as known to CoScale
    pub name: String,

    /// Scale down below this value
    #[serde(deserialize_with = "lenient_number")]
    #[schemars(schema_with = "number_or_string_schema")]
    pub low_value: f64,

    /// Scale up above this value
    #[serde(deserialize_with = "lenient_number")]
    #[schemars(schema_with = "number_or_string_schema")]
    pub high_value: f64,

    /// Averaging window in seconds
    #[serde(deserialize_with = "lenient_number")]
    #[schemars(schema_with = "integer_or_string_schema")]
    pub avg_interval_sec: u64,
}

impl ScalerTarget {
    pub fn workload(&self) -> WorkloadRef {
        WorkloadRef {
            namespace: self.namespace.clone(),
            kind: self.deployment_type,
            name: self.deployment_name.clone(),
        }
    }

    pub fn metric_query(&self) -> MetricQuery {
        MetricQuery {
            metric: self.metric.name.clone(),
            workload: self.workload(),
            window: Duration::from_secs(self.metric.avg_interval_sec),
        }
    }

    /// Backoff as a signed time delta, saturating for absurd values
    pub fn backoff(&self) -> TimeDelta {
        i64::try_from(self.scale_backoff_sec)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX)
    }

    /// Describe everything wrong with this target
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.namespace.trim().is_empty() {
            problems.push("namespace must not be empty".to_string());
        }
        if self.deployment_name.trim().is_empty() {
            problems.push("deployment_name must not be empty".to_string());
        }
        if self.metric.name.trim().is_empty() {
            problems.push("metric.name must not be empty".to_string());
        }
        if !self.metric.low_value.is_finite() || !self.metric.high_value.is_finite() {
            problems.push("metric thresholds must be finite numbers".to_string());
        } else if self.metric.low_value >= self.metric.high_value {
            problems.push(format!(
                "metric.low_value ({}) must be less than metric.high_value ({})",
                self.metric.low_value, self.metric.high_value
            ));
        }
        if self.min_replicas < 0 {
            problems.push(format!("min_replicas ({}) must not be negative", self.min_replicas));
        }
        if self.min_replicas > self.max_replicas {
            problems.push(format!(
                "min_replicas ({}) must not exceed max_replicas ({})",
                self.min_replicas, self.max_replicas
            ));
        }

        problems
    }
}

impl fmt::Display for ScalerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\"{}\" on \"{}:{}\"",
            self.metric.name, self.namespace, self.deployment_name
        )
    }
}

/// Parse and validate the JSON target list.
pub fn parse_targets(json: &str) -> Result<Vec<ScalerTarget>> {
    let targets: Vec<ScalerTarget> = serde_json::from_str(json).map_err(|e| {
        AutoscalerError::Configuration(format!("SCALER_CONFIG is not valid: {}", e))
    })?;
    validate_targets(&targets)?;
    Ok(targets)
}

/// Validate a target list as a whole.
///
/// Every problem of every target is collected into one error. Several targets
/// may share a workload, each scaling it on its own metric.
pub fn validate_targets(targets: &[ScalerTarget]) -> Result<()> {
    if targets.is_empty() {
        return Err(AutoscalerError::Configuration(
            "SCALER_CONFIG contains no targets".to_string(),
        ));
    }

    let problems: Vec<String> = targets
        .iter()
        .enumerate()
        .flat_map(|(index, target)| {
            target
                .problems()
                .into_iter()
                .map(move |problem| format!("target #{} ({}): {}", index, target, problem))
        })
        .collect();

    if problems.is_empty() {
        Ok(())
    } else {
        Err(AutoscalerError::Configuration(problems.join("; ")))
    }
}

/// JSON Schema of the `SCALER_CONFIG` document
pub fn config_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(Vec<ScalerTarget>)
}

/// Process settings assembled from flags and environment
#[derive(Debug, Clone)]
pub struct Settings {
    pub coscale: CoScaleConfig,
    pub targets: Vec<ScalerTarget>,
    pub check_interval: Duration,
    pub call_timeout: Duration,
}

impl Settings {
    pub fn new(
        api_url: String,
        app_id: Option<String>,
        access_token: Option<String>,
        scaler_config: Option<String>,
        check_interval_secs: u64,
        call_timeout_secs: u64,
    ) -> Result<Self> {
        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        let (app_id, access_token, scaler_config) = match (
            non_empty(app_id),
            non_empty(access_token),
            non_empty(scaler_config),
        ) {
            (Some(a), Some(t), Some(c)) => (a, t, c),
            _ => {
                return Err(AutoscalerError::Configuration(
                    "Please set the following environment variables: \
                     APP_ID, ACCESS_TOKEN and SCALER_CONFIG"
                        .to_string(),
                ))
            }
        };

        if check_interval_secs == 0 {
            return Err(AutoscalerError::Configuration(
                "CHECK_INTERVAL must be greater than 0".to_string(),
            ));
        }
        if call_timeout_secs == 0 {
            return Err(AutoscalerError::Configuration(
                "CALL_TIMEOUT_SEC must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            coscale: CoScaleConfig {
                api_url,
                app_id,
                access_token,
            },
            targets: parse_targets(&scaler_config)?,
            check_interval: Duration::from_secs(check_interval_secs),
            call_timeout: Duration::from_secs(call_timeout_secs),
        })
    }
}

// Numbers may be written as JSON numbers or as numeric strings
#[derive(Deserialize)]
#[serde(untagged)]
enum Numeric {
    Number(serde_json::Number),
    Text(String),
}

fn lenient_number<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw = match Numeric::deserialize(deserializer)? {
        Numeric::Number(n) => n.to_string(),
        Numeric::Text(s) => s,
    };
    raw.trim()
        .parse::<T>()
        .map_err(|e| de::Error::custom(format!("invalid number {:?}: {}", raw, e)))
}

fn integer_or_string_schema(_: &mut SchemaGenerator) -> Schema {
    scalar_schema(vec![InstanceType::Integer, InstanceType::String], Vec::new())
}

fn number_or_string_schema(_: &mut SchemaGenerator) -> Schema {
    scalar_schema(vec![InstanceType::Number, InstanceType::String], Vec::new())
}

// Any spelling is accepted, unknown ones fall back to Deployment
fn workload_kind_schema(_: &mut SchemaGenerator) -> Schema {
    let examples = ["Deployment", "Deployments", "DeploymentConfig", "DeploymentConfigs"]
        .into_iter()
        .map(serde_json::Value::from)
        .collect();
    scalar_schema(vec![InstanceType::String, InstanceType::Null], examples)
}

fn scalar_schema(types: Vec<InstanceType>, examples: Vec<serde_json::Value>) -> Schema {
    SchemaObject {
        instance_type: Some(types.into()),
        metadata: Some(Box::new(Metadata {
            examples,
            ..Default::default()
        })),
        ..Default::default()
    }
    .into()
}

fn lenient_workload_kind<'de, D>(deserializer: D) -> std::result::Result<WorkloadKind, D::Error>
where
    D: Deserializer<'de>,
{
    let name: Option<String> = Option::deserialize(deserializer)?;
    Ok(name
        .map(|n| WorkloadKind::from_name(&n))
        .unwrap_or_default())
}
