//! Metrics backend contract and Prometheus HTTP client

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gpusched_core::{SchedError, SchedResult};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// One series of an instant-vector result
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

impl Sample {
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// Instant-vector query service
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    async fn query(&self, expr: &str, at: DateTime<Utc>) -> SchedResult<Vec<Sample>>;
}

/// Selector for one pod's series of `metric`
pub fn pod_metric_query(metric: &str, namespace: &str, pod: &str) -> String {
    format!(
        r#"{}{{pod_namespace="{}",pod_name="{}"}}"#,
        metric, namespace, pod
    )
}

#[derive(Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryData {
    result_type: String,
    result: serde_json::Value,
}

#[derive(Deserialize)]
struct VectorSample {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    value: (f64, String),
}

/// Decode a `/api/v1/query` response body; anything but a vector is an error
pub fn decode_query_response(body: &str) -> SchedResult<Vec<Sample>> {
    let response: QueryResponse = serde_json::from_str(body)
        .map_err(|e| SchedError::Metrics(format!("invalid query response: {}", e)))?;

    if response.status != "success" {
        return Err(SchedError::Metrics(
            response.error.unwrap_or_else(|| response.status.clone()),
        ));
    }
    let data = response
        .data
        .ok_or_else(|| SchedError::Metrics("query response has no data".to_string()))?;
    if data.result_type != "vector" {
        return Err(SchedError::Metrics(format!(
            "unexpected result type: {}",
            data.result_type
        )));
    }

    let series: Vec<VectorSample> = serde_json::from_value(data.result)
        .map_err(|e| SchedError::Metrics(format!("invalid vector result: {}", e)))?;
    series
        .into_iter()
        .map(|s| {
            let value = s.value.1.parse::<f64>().map_err(|e| {
                SchedError::Metrics(format!("invalid sample value {:?}: {}", s.value.1, e))
            })?;
            Ok(Sample {
                labels: s.metric,
                value,
            })
        })
        .collect()
}

/// Prometheus HTTP API client
pub struct PrometheusClient {
    client: reqwest::Client,
    base_url: String,
}

impl PrometheusClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> SchedResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SchedError::Metrics(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl MetricsBackend for PrometheusClient {
    async fn query(&self, expr: &str, at: DateTime<Utc>) -> SchedResult<Vec<Sample>> {
        let url = format!("{}/api/v1/query", self.base_url);
        let time = format!("{:.3}", at.timestamp_millis() as f64 / 1000.0);

        let response = self
            .client
            .get(&url)
            .query(&[("query", expr), ("time", time.as_str())])
            .send()
            .await
            .map_err(|e| SchedError::Metrics(format!("query {} failed: {}", expr, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SchedError::Metrics(format!("failed to read response: {}", e)))?;
        // Prometheus reports query errors as JSON on 4xx/5xx too
        if !status.is_success() && !body.trim_start().starts_with('{') {
            return Err(SchedError::Metrics(format!(
                "query {} returned {}",
                expr, status
            )));
        }

        let samples = decode_query_response(&body)?;
        debug!(query = %expr, series = samples.len(), "Metrics query");
        Ok(samples)
    }
}
