//! Operator configuration.
//!
//! Loaded from a YAML or JSON file (picked by extension), with defaults for
//! everything the deployment does not care to set. Registry credentials are
//! not part of this file; they come from `BEAMLIT_TOKEN`/`BEAMLIT_BASE_URL`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::crd::RemoteBackend;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OperatorConfig {
    /// Address the metric endpoint binds to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_addr: Option<String>,

    /// Address the health probe endpoint binds to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_addr: Option<String>,

    /// HTTP/2 for the served endpoints; disabled by default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_http2: Option<bool>,

    /// Accepted for deployment parity; election itself is delegated to the
    /// deployment topology.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_leader_election: Option<bool>,

    /// Comma-separated namespaces to watch; empty means all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespaces: Option<String>,

    #[serde(default)]
    pub gateway_service: GatewayServiceConfig,

    /// Fallback remote backend for models whose offloading config leaves it
    /// out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_remote_backend: Option<RemoteBackend>,

    #[serde(default)]
    pub actuator: ActuatorKind,

    #[serde(default)]
    pub metrics_backend: MetricsBackendKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prometheus_url: Option<String>,

    #[serde(default = "default_scrape_interval_secs")]
    pub scrape_interval_secs: u64,

    /// Sustained-window length for metric-threshold crossings.
    #[serde(default = "default_metric_window_secs")]
    pub metric_window_secs: u64,
}

fn default_scrape_interval_secs() -> u64 {
    5
}

fn default_metric_window_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayServiceConfig {
    #[serde(default = "default_gateway_namespace")]
    pub namespace: String,
    #[serde(default = "default_gateway_name")]
    pub name: String,
    /// Listener port the gateway serves intercepted traffic on.
    #[serde(default = "default_gateway_port")]
    pub port: i32,
    /// Admin port carrying the route REST API (embedded actuator).
    #[serde(default = "default_gateway_admin_port")]
    pub admin_port: i32,
}

impl Default for GatewayServiceConfig {
    fn default() -> Self {
        Self {
            namespace: default_gateway_namespace(),
            name: default_gateway_name(),
            port: default_gateway_port(),
            admin_port: default_gateway_admin_port(),
        }
    }
}

fn default_gateway_namespace() -> String {
    "default".to_string()
}

fn default_gateway_name() -> String {
    "beamlit-gateway".to_string()
}

fn default_gateway_port() -> i32 {
    8000
}

fn default_gateway_admin_port() -> i32 {
    8080
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default,
)]
pub enum ActuatorKind {
    #[default]
    #[serde(rename = "embedded")]
    Embedded,
    #[serde(rename = "gateway-api")]
    GatewayApi,
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default,
)]
pub enum MetricsBackendKind {
    #[default]
    #[serde(rename = "cluster")]
    Cluster,
    #[serde(rename = "prometheus")]
    Prometheus,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse yaml config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("cannot parse json config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl OperatorConfig {
    /// Loads the file at `path`, sniffing the format from the extension:
    /// `.yaml`/`.yml` parse as YAML, everything else as JSON.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        let config: OperatorConfig = match extension {
            "yaml" | "yml" => serde_yaml::from_str(&raw)?,
            _ => serde_json::from_str(&raw)?,
        };
        Ok(config)
    }

    pub fn metrics_addr(&self) -> &str {
        self.metrics_addr.as_deref().unwrap_or(":8080")
    }

    pub fn probe_addr(&self) -> &str {
        self.probe_addr.as_deref().unwrap_or(":8081")
    }

    /// Watched namespaces; empty means cluster-wide.
    pub fn namespace_list(&self) -> Vec<String> {
        self.namespaces
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|ns| !ns.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.actuator == ActuatorKind::Embedded
            && self.gateway_service.admin_port <= 0
        {
            return Err(ConfigError::Invalid(
                "embedded actuator requires gatewayService.adminPort"
                    .to_string(),
            ));
        }
        if self.metrics_backend == MetricsBackendKind::Prometheus
            && self.prometheus_url.as_deref().unwrap_or("").is_empty()
        {
            return Err(ConfigError::Invalid(
                "prometheus metrics backend requires prometheusUrl"
                    .to_string(),
            ));
        }
        if self.scrape_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "scrapeIntervalSecs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Admin base URL of the embedded gateway, reachable through its
    /// cluster service.
    pub fn gateway_admin_base(&self) -> String {
        format!(
            "http://{}.{}.svc.cluster.local:{}",
            self.gateway_service.name,
            self.gateway_service.namespace,
            self.gateway_service.admin_port
        )
    }
}
