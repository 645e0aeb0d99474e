//! Metric sources.
//!
//! Two backends feed the informer: the cluster metric APIs
//! (`metrics.k8s.io`, `custom.metrics.k8s.io`, `external.metrics.k8s.io`)
//! reached through raw API-server requests, and a Prometheus endpoint for
//! external metrics. Values are normalized to milli-units.

use async_trait::async_trait;
use kube::Client;
use serde::Deserialize;

use crate::crd::metrics::{
    CrossVersionObjectReference, ResourceName, parse_quantity_milli,
};

#[derive(Debug, thiserror::Error)]
pub enum MetricError {
    /// The metrics API answered with an empty result set. For resource
    /// metrics this means "not over target", not a failure.
    #[error("no metrics returned")]
    NoMetrics,
    #[error("metric source unsupported by this backend: {0}")]
    Unsupported(&'static str),
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed metric payload: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait MetricsBackend: Send + Sync {
    /// Per-pod resource usage in milli-units, optionally narrowed to one
    /// container.
    async fn resource_usage(
        &self,
        namespace: &str,
        resource: ResourceName,
        pod_selector: &str,
        container: Option<&str>,
    ) -> Result<Vec<i64>, MetricError>;

    /// Raw per-pod custom metric values.
    async fn pod_metric(
        &self,
        namespace: &str,
        metric: &str,
        pod_selector: &str,
        metric_selector: Option<&str>,
    ) -> Result<Vec<i64>, MetricError>;

    /// Single-object scalar metric.
    async fn object_metric(
        &self,
        namespace: &str,
        object: &CrossVersionObjectReference,
        metric: &str,
        metric_selector: Option<&str>,
    ) -> Result<i64, MetricError>;

    /// Cluster-external, label-selected metric values.
    async fn external_metric(
        &self,
        namespace: &str,
        metric: &str,
        metric_selector: Option<&str>,
    ) -> Result<Vec<i64>, MetricError>;
}

// ---------------------------------------------------------------------------
// Cluster metric APIs
// ---------------------------------------------------------------------------

pub struct ClusterMetricsBackend {
    client: Client,
}

#[derive(Deserialize)]
struct PodMetricsList {
    #[serde(default)]
    items: Vec<PodMetricsItem>,
}

#[derive(Deserialize)]
struct PodMetricsItem {
    #[serde(default)]
    containers: Vec<ContainerMetrics>,
}

#[derive(Deserialize)]
struct ContainerMetrics {
    name: String,
    #[serde(default)]
    usage: std::collections::BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct MetricValueList {
    #[serde(default)]
    items: Vec<MetricValueItem>,
}

#[derive(Deserialize)]
struct MetricValueItem {
    value: String,
}

#[derive(Deserialize)]
struct ExternalMetricValueList {
    #[serde(default)]
    items: Vec<ExternalMetricValueItem>,
}

#[derive(Deserialize)]
struct ExternalMetricValueItem {
    value: String,
}

impl ClusterMetricsBackend {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: String,
    ) -> Result<T, MetricError> {
        let request = http::Request::get(path)
            .body(Vec::new())
            .map_err(|e| MetricError::Malformed(e.to_string()))?;
        Ok(self.client.request::<T>(request).await?)
    }
}

fn encode_selector(selector: &str) -> String {
    // label selectors only need ',' and '=' kept intact; both are safe in a
    // query value, so a minimal escape of '%' and '&' suffices here
    selector.replace('%', "%25").replace('&', "%26")
}

#[async_trait]
impl MetricsBackend for ClusterMetricsBackend {
    async fn resource_usage(
        &self,
        namespace: &str,
        resource: ResourceName,
        pod_selector: &str,
        container: Option<&str>,
    ) -> Result<Vec<i64>, MetricError> {
        let path = format!(
            "/apis/metrics.k8s.io/v1beta1/namespaces/{namespace}/pods?labelSelector={}",
            encode_selector(pod_selector)
        );
        let list: PodMetricsList = self.get_json(path).await?;
        if list.items.is_empty() {
            return Err(MetricError::NoMetrics);
        }
        let mut samples = Vec::with_capacity(list.items.len());
        for pod in list.items {
            let mut total = 0_i64;
            let mut seen = false;
            for c in pod.containers {
                if let Some(wanted) = container {
                    if c.name != wanted {
                        continue;
                    }
                }
                if let Some(raw) = c.usage.get(resource.as_str()) {
                    total += parse_quantity_milli(raw).ok_or_else(|| {
                        MetricError::Malformed(format!(
                            "unparseable quantity {raw:?}"
                        ))
                    })?;
                    seen = true;
                }
            }
            if seen {
                samples.push(total);
            }
        }
        if samples.is_empty() {
            return Err(MetricError::NoMetrics);
        }
        Ok(samples)
    }

    async fn pod_metric(
        &self,
        namespace: &str,
        metric: &str,
        pod_selector: &str,
        metric_selector: Option<&str>,
    ) -> Result<Vec<i64>, MetricError> {
        let mut path = format!(
            "/apis/custom.metrics.k8s.io/v1beta1/namespaces/{namespace}/pods/*/{metric}?labelSelector={}",
            encode_selector(pod_selector)
        );
        if let Some(selector) = metric_selector {
            path.push_str(&format!(
                "&metricLabelSelector={}",
                encode_selector(selector)
            ));
        }
        let list: MetricValueList = self.get_json(path).await?;
        if list.items.is_empty() {
            return Err(MetricError::NoMetrics);
        }
        list.items
            .into_iter()
            .map(|item| {
                parse_quantity_milli(&item.value).ok_or_else(|| {
                    MetricError::Malformed(format!(
                        "unparseable quantity {:?}",
                        item.value
                    ))
                })
            })
            .collect()
    }

    async fn object_metric(
        &self,
        namespace: &str,
        object: &CrossVersionObjectReference,
        metric: &str,
        metric_selector: Option<&str>,
    ) -> Result<i64, MetricError> {
        // same plural guess the dynamic client makes
        let plural = format!("{}s", object.kind.to_ascii_lowercase());
        let mut path = format!(
            "/apis/custom.metrics.k8s.io/v1beta1/namespaces/{namespace}/{plural}/{}/{metric}",
            object.name
        );
        if let Some(selector) = metric_selector {
            path.push_str(&format!(
                "?metricLabelSelector={}",
                encode_selector(selector)
            ));
        }
        let list: MetricValueList = self.get_json(path).await?;
        let item = list.items.into_iter().next().ok_or(MetricError::NoMetrics)?;
        parse_quantity_milli(&item.value).ok_or_else(|| {
            MetricError::Malformed(format!(
                "unparseable quantity {:?}",
                item.value
            ))
        })
    }

    async fn external_metric(
        &self,
        namespace: &str,
        metric: &str,
        metric_selector: Option<&str>,
    ) -> Result<Vec<i64>, MetricError> {
        let mut path = format!(
            "/apis/external.metrics.k8s.io/v1beta1/namespaces/{namespace}/{metric}"
        );
        if let Some(selector) = metric_selector {
            path.push_str(&format!(
                "?labelSelector={}",
                encode_selector(selector)
            ));
        }
        let list: ExternalMetricValueList = self.get_json(path).await?;
        if list.items.is_empty() {
            return Err(MetricError::NoMetrics);
        }
        list.items
            .into_iter()
            .map(|item| {
                parse_quantity_milli(&item.value).ok_or_else(|| {
                    MetricError::Malformed(format!(
                        "unparseable quantity {:?}",
                        item.value
                    ))
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Prometheus
// ---------------------------------------------------------------------------

/// Prometheus instant-query backend. Only external metrics map onto a
/// PromQL lookup; the other sources belong to the cluster APIs.
pub struct PrometheusBackend {
    base_url: String,
    http: reqwest::Client,
}

impl PrometheusBackend {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn build_query(metric: &str, selector: Option<&str>) -> String {
        match selector {
            Some(s) if !s.is_empty() => {
                let labels = s
                    .split(',')
                    .filter_map(|pair| pair.split_once('='))
                    .map(|(k, v)| format!("{k}=\"{v}\""))
                    .collect::<Vec<_>>()
                    .join(",");
                format!("{metric}{{{labels}}}")
            }
            _ => metric.to_string(),
        }
    }

    async fn query_instant(&self, expr: &str) -> Result<Vec<i64>, MetricError> {
        let url = format!("{}/api/v1/query", self.base_url);
        let response = self
            .http
            .get(url)
            .query(&[("query", expr)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(MetricError::Malformed(format!(
                "prometheus returned {}",
                response.status()
            )));
        }
        let body: serde_json::Value = response.json().await?;
        let result = body
            .get("data")
            .and_then(|d| d.get("result"))
            .and_then(|r| r.as_array())
            .ok_or_else(|| {
                MetricError::Malformed("missing data.result".to_string())
            })?;
        if result.is_empty() {
            return Err(MetricError::NoMetrics);
        }
        let mut samples = Vec::with_capacity(result.len());
        for series in result {
            let value = series
                .get("value")
                .and_then(|v| v.as_array())
                .and_then(|v| v.get(1))
                .and_then(|v| v.as_str())
                .and_then(|v| v.parse::<f64>().ok())
                .ok_or_else(|| {
                    MetricError::Malformed("missing sample value".to_string())
                })?;
            samples.push((value * 1000.0).round() as i64);
        }
        Ok(samples)
    }
}

#[async_trait]
impl MetricsBackend for PrometheusBackend {
    async fn resource_usage(
        &self,
        _namespace: &str,
        _resource: ResourceName,
        _pod_selector: &str,
        _container: Option<&str>,
    ) -> Result<Vec<i64>, MetricError> {
        Err(MetricError::Unsupported("resource"))
    }

    async fn pod_metric(
        &self,
        _namespace: &str,
        _metric: &str,
        _pod_selector: &str,
        _metric_selector: Option<&str>,
    ) -> Result<Vec<i64>, MetricError> {
        Err(MetricError::Unsupported("pods"))
    }

    async fn object_metric(
        &self,
        _namespace: &str,
        _object: &CrossVersionObjectReference,
        _metric: &str,
        _metric_selector: Option<&str>,
    ) -> Result<i64, MetricError> {
        Err(MetricError::Unsupported("object"))
    }

    async fn external_metric(
        &self,
        _namespace: &str,
        metric: &str,
        metric_selector: Option<&str>,
    ) -> Result<Vec<i64>, MetricError> {
        let expr = Self::build_query(metric, metric_selector);
        self.query_instant(&expr).await
    }
}
