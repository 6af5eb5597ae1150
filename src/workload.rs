//! Workload replica access
//!
//! The controller only ever needs two things from the orchestrator: the
//! current replica count of a workload and a way to set it. Both are behind
//! [`WorkloadScaler`] so the decision loop can be driven by fakes in tests.
//!
//! [`KubeWorkloadScaler`] talks to the Kubernetes API:
//! - `apps/v1 Deployment` through the `scale` subresource
//! - `apps.openshift.io/v1 DeploymentConfig` through a dynamic object, since
//!   OpenShift types are not part of `k8s-openapi`

use crate::error::{AutoscalerError, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v1::Scale;
use kube::api::{Api, ApiResource, DynamicObject, Patch, PatchParams};
use kube::Client;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

const FIELD_MANAGER: &str = "coscale-autoscaler";

/// Kind of workload whose replicas are managed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
pub enum WorkloadKind {
    /// Kubernetes `apps/v1` Deployment
    #[default]
    Deployment,
    /// OpenShift `apps.openshift.io/v1` DeploymentConfig
    DeploymentConfig,
}

impl WorkloadKind {
    /// Parse a configured workload type.
    ///
    /// Singular and plural spellings are accepted in any case. Anything else
    /// falls back to [`WorkloadKind::Deployment`].
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "deploymentconfig" | "deploymentconfigs" => WorkloadKind::DeploymentConfig,
            "deployment" | "deployments" | "" => WorkloadKind::Deployment,
            other => {
                warn!(deployment_type = %other, "Unknown deployment type, assuming Deployment");
                WorkloadKind::Deployment
            }
        }
    }

    /// Plural name, as used in CoScale server group paths
    pub fn plural(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployments",
            WorkloadKind::DeploymentConfig => "DeploymentConfigs",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadKind::Deployment => write!(f, "Deployment"),
            WorkloadKind::DeploymentConfig => write!(f, "DeploymentConfig"),
        }
    }
}

/// A namespaced reference to a scalable workload
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkloadRef {
    pub namespace: String,
    pub kind: WorkloadKind,
    pub name: String,
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Read and write access to workload replica counts
#[async_trait]
pub trait WorkloadScaler: Send + Sync {
    /// Current number of replicas of the workload
    async fn replicas(&self, workload: &WorkloadRef) -> Result<i32>;

    /// Set the desired number of replicas of the workload
    async fn scale(&self, workload: &WorkloadRef, replicas: i32) -> Result<()>;
}

/// [`WorkloadScaler`] backed by the Kubernetes API
pub struct KubeWorkloadScaler {
    client: Client,
}

impl KubeWorkloadScaler {
    /// Create a new scaler using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn deployment_configs(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &deployment_config_resource())
    }
}

#[async_trait]
impl WorkloadScaler for KubeWorkloadScaler {
    async fn replicas(&self, workload: &WorkloadRef) -> Result<i32> {
        let replicas = match workload.kind {
            WorkloadKind::Deployment => {
                let scale = self
                    .deployments(&workload.namespace)
                    .get_scale(&workload.name)
                    .await?;
                replicas_from_scale(&scale)
            }
            WorkloadKind::DeploymentConfig => {
                let dc = self
                    .deployment_configs(&workload.namespace)
                    .get(&workload.name)
                    .await?;
                replicas_from_object(&dc.data)?
            }
        };

        let replicas = replicas.ok_or_else(|| {
            AutoscalerError::NotFound(format!("replica count of {}", workload))
        })?;
        debug!(workload = %workload, replicas, "Read replica count");
        Ok(replicas)
    }

    async fn scale(&self, workload: &WorkloadRef, replicas: i32) -> Result<()> {
        let patch = serde_json::json!({
            "spec": {
                "replicas": replicas,
            }
        });
        let params = PatchParams::apply(FIELD_MANAGER);

        match workload.kind {
            WorkloadKind::Deployment => {
                self.deployments(&workload.namespace)
                    .patch_scale(&workload.name, &params, &Patch::Merge(&patch))
                    .await?;
            }
            WorkloadKind::DeploymentConfig => {
                self.deployment_configs(&workload.namespace)
                    .patch(&workload.name, &params, &Patch::Merge(&patch))
                    .await?;
            }
        }

        Ok(())
    }
}

/// API resource description of an OpenShift DeploymentConfig
pub fn deployment_config_resource() -> ApiResource {
    ApiResource {
        group: "apps.openshift.io".to_string(),
        version: "v1".to_string(),
        api_version: "apps.openshift.io/v1".to_string(),
        kind: "DeploymentConfig".to_string(),
        plural: "deploymentconfigs".to_string(),
    }
}

/// Observed replicas from a scale subresource, falling back to the desired count
fn replicas_from_scale(scale: &Scale) -> Option<i32> {
    let observed = scale.status.as_ref().map(|s| s.replicas);
    let desired = scale.spec.as_ref().and_then(|s| s.replicas);
    observed.or(desired)
}

/// Observed replicas from a raw object body, falling back to the desired count
fn replicas_from_object(data: &serde_json::Value) -> Result<Option<i32>> {
    let raw = data
        .pointer("/status/replicas")
        .or_else(|| data.pointer("/spec/replicas"));

    match raw {
        None => Ok(None),
        Some(value) => value
            .as_i64()
            .and_then(|n| i32::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| {
                AutoscalerError::Serialization(format!("invalid replica count {}", value))
            }),
    }
}
