//! CoScale REST client
//!
//! Resolves a metric by name and a workload's server group by path, then
//! averages the raw data points of the trailing window. Sessions are created
//! from the application access token on first use and dropped when CoScale
//! rejects them, so the next call logs in again.

use super::{mean, MetricQuery, MetricSample, MetricSource};
use crate::error::{AutoscalerError, Result};
use crate::workload::WorkloadRef;
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const AUTH_HEADER: &str = "HTTPAuthorization";

/// Extra seconds requested before the window to absorb ingestion lag
const WINDOW_SLACK_SECS: u64 = 60;

/// Connection settings for the CoScale API
#[derive(Clone)]
pub struct CoScaleConfig {
    pub api_url: String,
    pub app_id: String,
    pub access_token: String,
}

impl fmt::Debug for CoScaleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoScaleConfig")
            .field("api_url", &self.api_url)
            .field("app_id", &self.app_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

/// A metric definition
#[derive(Debug, Clone, Deserialize)]
pub struct Metric {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub unit: Option<String>,
}

/// A server group, CoScale's grouping of the containers of one workload
#[derive(Debug, Clone, Deserialize)]
pub struct ServerGroup {
    pub id: i64,
    #[serde(default)]
    pub path: Option<String>,
}

/// One data series as `[timestamp, value]` pairs
#[derive(Debug, Clone, Deserialize)]
pub struct MetricSeries {
    #[serde(default)]
    pub values: Vec<(f64, Option<f64>)>,
}

/// CoScale API client
pub struct CoScaleClient {
    http: reqwest::Client,
    config: CoScaleConfig,
    session: RwLock<Option<String>>,
}

impl CoScaleClient {
    /// Create a client whose requests give up after `timeout`
    pub fn new(config: CoScaleConfig, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        info!(
            app_id = %config.app_id,
            api_url = %config.api_url,
            "Connecting to Application {} on {}",
            config.app_id,
            config.api_url
        );
        Ok(Self {
            http,
            config,
            session: RwLock::new(None),
        })
    }

    /// Look up a metric by its name
    pub async fn metric_by_name(&self, name: &str) -> Result<Metric> {
        let metrics: Vec<Metric> = self
            .get_json("/metrics/", &[("selectByName", name.to_string())])
            .await?;
        metrics
            .into_iter()
            .next()
            .ok_or_else(|| AutoscalerError::NotFound(format!("metric '{}'", name)))
    }

    /// Look up a server group by its path
    pub async fn server_group_by_path(&self, path: &str) -> Result<ServerGroup> {
        let groups: Vec<ServerGroup> = self
            .get_json("/servergroups/", &[("selectByPath", path.to_string())])
            .await?;
        groups
            .into_iter()
            .next()
            .ok_or_else(|| AutoscalerError::NotFound(format!("server group '{}'", path)))
    }

    /// Raw data of a metric for a server group over the trailing window
    pub async fn metric_data(
        &self,
        metric_id: i64,
        server_group_id: i64,
        window: Duration,
    ) -> Result<Vec<MetricSeries>> {
        let span = window.as_secs().saturating_add(WINDOW_SLACK_SECS);
        let start = -i64::try_from(span).unwrap_or(i64::MAX);

        self.get_json(
            "/data/get/",
            &[
                ("id", metric_id.to_string()),
                ("subjectIds", format!("g{}", server_group_id)),
                ("start", start.to_string()),
                ("stop", "0".to_string()),
            ],
        )
        .await
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/api/v1/app/{}{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.app_id,
            path
        )
    }

    async fn session_token(&self) -> Result<String> {
        if let Some(token) = self.session.read().await.as_ref() {
            return Ok(token.clone());
        }

        let mut session = self.session.write().await;
        // Another evaluation may have logged in while we waited for the lock
        if let Some(token) = session.as_ref() {
            return Ok(token.clone());
        }

        let token = self.login().await?;
        *session = Some(token.clone());
        Ok(token)
    }

    async fn login(&self) -> Result<String> {
        debug!(app_id = %self.config.app_id, "Logging in to CoScale");

        let response = self
            .http
            .post(self.url("/login/"))
            .header(ACCEPT, "application/json")
            .form(&[("accessToken", self.config.access_token.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AutoscalerError::MetricSource(format!(
                "login failed with status {}: {}",
                status, body
            )));
        }

        let login: LoginResponse = response.json().await?;
        Ok(login.token)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        let token = self.session_token().await?;

        let response = self
            .http
            .get(self.url(path))
            .query(params)
            .header(AUTH_HEADER, token)
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            *self.session.write().await = None;
            warn!(path = %path, "CoScale rejected the session, will log in again");
            return Err(AutoscalerError::MetricSource(format!(
                "GET {} was not authorized",
                path
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AutoscalerError::MetricSource(format!(
                "GET {} returned {}: {}",
                path, status, body
            )));
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl MetricSource for CoScaleClient {
    async fn average_metric(&self, query: &MetricQuery) -> Result<MetricSample> {
        let metric = self.metric_by_name(&query.metric).await?;
        let group = self
            .server_group_by_path(&server_group_path(&query.workload))
            .await?;
        let series = self.metric_data(metric.id, group.id, query.window).await?;
        let value = average_of_series(&series)?;

        debug!(
            metric = %metric.name,
            metric_id = metric.id,
            server_group_id = group.id,
            value,
            "Fetched metric average"
        );

        Ok(MetricSample {
            value,
            unit: metric.unit.unwrap_or_default(),
        })
    }
}

/// CoScale server group path of a workload
pub fn server_group_path(workload: &WorkloadRef) -> String {
    format!(
        "Kubernetes/Namespaces/{}/{}/{}",
        workload.namespace,
        workload.kind.plural(),
        workload.name
    )
}

fn average_of_series(series: &[MetricSeries]) -> Result<f64> {
    let [single] = series else {
        return Err(AutoscalerError::MetricSource(format!(
            "expected exactly one data series, got {}",
            series.len()
        )));
    };

    let values: Vec<f64> = single.values.iter().filter_map(|(_, v)| *v).collect();
    mean(&values)
        .ok_or_else(|| AutoscalerError::MetricSource("no data points in window".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::WorkloadKind;
    use axum::extract::{Form, Query, State};
    use axum::http::HeaderMap;
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone)]
    struct FakeCoScale {
        logins: Arc<AtomicUsize>,
        reject_next: Arc<AtomicBool>,
        values: Vec<f64>,
    }

    impl FakeCoScale {
        fn new(values: Vec<f64>) -> Self {
            Self {
                logins: Arc::new(AtomicUsize::new(0)),
                reject_next: Arc::new(AtomicBool::new(false)),
                values,
            }
        }
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers
            .get(AUTH_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("session-"))
    }

    async fn login(
        State(fake): State<FakeCoScale>,
        Form(form): Form<HashMap<String, String>>,
    ) -> Response {
        if form.get("accessToken").map(String::as_str) != Some("secret") {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        let n = fake.logins.fetch_add(1, Ordering::SeqCst) + 1;
        Json(json!({ "token": format!("session-{}", n) })).into_response()
    }

    async fn metrics(headers: HeaderMap, Query(q): Query<HashMap<String, String>>) -> Response {
        if !authorized(&headers) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        match q.get("selectByName").map(String::as_str) {
            Some("cpu") => Json(json!([{ "id": 7, "name": "cpu", "unit": "%" }])).into_response(),
            _ => Json(json!([])).into_response(),
        }
    }

    async fn server_groups(
        headers: HeaderMap,
        Query(q): Query<HashMap<String, String>>,
    ) -> Response {
        if !authorized(&headers) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        match q.get("selectByPath").map(String::as_str) {
            Some("Kubernetes/Namespaces/shop/Deployments/frontend") => {
                Json(json!([{ "id": 3, "path": "Kubernetes/Namespaces/shop/Deployments/frontend" }]))
                    .into_response()
            }
            _ => Json(json!([])).into_response(),
        }
    }

    async fn data(
        State(fake): State<FakeCoScale>,
        headers: HeaderMap,
        Query(q): Query<HashMap<String, String>>,
    ) -> Response {
        if fake.reject_next.swap(false, Ordering::SeqCst) || !authorized(&headers) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        let expected = [("id", "7"), ("subjectIds", "g3"), ("start", "-360"), ("stop", "0")];
        if expected
            .iter()
            .any(|(k, v)| q.get(*k).map(String::as_str) != Some(*v))
        {
            return StatusCode::BAD_REQUEST.into_response();
        }
        let values: Vec<_> = fake
            .values
            .iter()
            .enumerate()
            .map(|(i, v)| json!([i * 60, v]))
            .collect();
        Json(json!([{ "values": values }])).into_response()
    }

    async fn spawn_fake(fake: FakeCoScale) -> String {
        let app = Router::new()
            .route("/api/v1/app/app-1/login/", post(login))
            .route("/api/v1/app/app-1/metrics/", get(metrics))
            .route("/api/v1/app/app-1/servergroups/", get(server_groups))
            .route("/api/v1/app/app-1/data/get/", get(data))
            .with_state(fake);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    fn client(api_url: String, access_token: &str) -> CoScaleClient {
        CoScaleClient::new(
            CoScaleConfig {
                api_url,
                app_id: "app-1".to_string(),
                access_token: access_token.to_string(),
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn query(metric: &str, kind: WorkloadKind) -> MetricQuery {
        MetricQuery {
            metric: metric.to_string(),
            workload: WorkloadRef {
                namespace: "shop".to_string(),
                kind,
                name: "frontend".to_string(),
            },
            window: Duration::from_secs(300),
        }
    }

    #[test]
    fn test_server_group_path() {
        let q = query("cpu", WorkloadKind::DeploymentConfig);
        assert_eq!(
            server_group_path(&q.workload),
            "Kubernetes/Namespaces/shop/DeploymentConfigs/frontend"
        );
    }

    #[test]
    fn test_average_of_series() {
        let series: Vec<MetricSeries> =
            serde_json::from_str(r#"[{"values": [[0, 10.0], [60, null], [120, 30.0]]}]"#).unwrap();
        assert_eq!(average_of_series(&series).unwrap(), 20.0);

        let empty: Vec<MetricSeries> = serde_json::from_str(r#"[{"values": []}]"#).unwrap();
        assert!(average_of_series(&empty).is_err());

        let two: Vec<MetricSeries> =
            serde_json::from_str(r#"[{"values": [[0, 1]]}, {"values": [[0, 2]]}]"#).unwrap();
        assert!(average_of_series(&two).is_err());
        assert!(average_of_series(&[]).is_err());
    }

    #[test]
    fn test_config_debug_redacts_token() {
        let config = CoScaleConfig {
            api_url: "https://api.coscale.com".to_string(),
            app_id: "app-1".to_string(),
            access_token: "very-secret".to_string(),
        };
        let debug = format!("{:?}", config);
        assert!(!debug.contains("very-secret"));
        assert!(debug.contains("app-1"));
    }

    #[tokio::test]
    async fn test_average_metric_reuses_session() {
        let fake = FakeCoScale::new(vec![10.0, 20.0, 30.0, 40.0]);
        let logins = Arc::clone(&fake.logins);
        let client = client(spawn_fake(fake).await, "secret");

        let sample = client
            .average_metric(&query("cpu", WorkloadKind::Deployment))
            .await
            .unwrap();
        assert_eq!(sample.value, 25.0);
        assert_eq!(sample.unit, "%");

        client
            .average_metric(&query("cpu", WorkloadKind::Deployment))
            .await
            .unwrap();
        assert_eq!(logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_metric_is_not_found() {
        let client = client(spawn_fake(FakeCoScale::new(vec![1.0])).await, "secret");
        let err = client
            .average_metric(&query("memory", WorkloadKind::Deployment))
            .await
            .unwrap_err();
        assert!(matches!(err, AutoscalerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unknown_server_group_is_not_found() {
        let client = client(spawn_fake(FakeCoScale::new(vec![1.0])).await, "secret");
        let err = client
            .average_metric(&query("cpu", WorkloadKind::DeploymentConfig))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("DeploymentConfigs"));
    }

    #[tokio::test]
    async fn test_rejected_session_logs_in_again() {
        let fake = FakeCoScale::new(vec![5.0]);
        let logins = Arc::clone(&fake.logins);
        let reject_next = Arc::clone(&fake.reject_next);
        let client = client(spawn_fake(fake).await, "secret");

        reject_next.store(true, Ordering::SeqCst);
        let err = client
            .average_metric(&query("cpu", WorkloadKind::Deployment))
            .await
            .unwrap_err();
        assert!(matches!(err, AutoscalerError::MetricSource(_)));

        let sample = client
            .average_metric(&query("cpu", WorkloadKind::Deployment))
            .await
            .unwrap();
        assert_eq!(sample.value, 5.0);
        assert_eq!(logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_window_is_an_error() {
        let client = client(spawn_fake(FakeCoScale::new(vec![])).await, "secret");
        let err = client
            .average_metric(&query("cpu", WorkloadKind::Deployment))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no data points"));
    }

    #[tokio::test]
    async fn test_bad_access_token() {
        let client = client(spawn_fake(FakeCoScale::new(vec![1.0])).await, "wrong");
        let err = client
            .average_metric(&query("cpu", WorkloadKind::Deployment))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("login failed"));
    }
}
