use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::metrics::MetricSpec;

/// ModelDeployment describes a logical model backed by a cluster workload,
/// registered with Beamlit and optionally offloaded to a remote backend.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "deployment.beamlit.com",
    version = "v1alpha1",
    kind = "ModelDeployment",
    plural = "modeldeployments",
    namespaced,
    status = "ModelDeploymentStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ModelDeploymentSpec {
    /// Name of the base model. Together with `environment` this uniquely
    /// identifies the deployment on Beamlit.
    pub model: String,

    /// When false the operator tears down all actuation for this model.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Reference to the workload backing the model (Deployment, StatefulSet,
    /// DaemonSet or ReplicaSet).
    pub model_source_ref: WorkloadReference,

    /// Service exposing the model inside the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_ref: Option<ServiceReference>,

    /// Service exposing the model's metrics inside the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_service_ref: Option<ServiceReference>,

    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<PolicyRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serverless_config: Option<ServerlessConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offloading_config: Option<OffloadingConfig>,
}

fn default_enabled() -> bool {
    true
}

fn default_environment() -> String {
    "production".to_string()
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    /// Port on the Service whose traffic the gateway intercepts.
    pub target_port: i32,
}

#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq,
)]
pub enum PolicyRefType {
    #[serde(rename = "remotePolicy")]
    RemotePolicy,
    #[serde(rename = "localPolicy")]
    LocalPolicy,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRef {
    pub ref_type: PolicyRefType,
    pub name: String,
}

#[derive(
    Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Default,
)]
#[serde(rename_all = "camelCase")]
pub struct ServerlessConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_num_replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_num_replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Minimum replica step when scaling up from zero. Must be at least 2.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_up_minimum: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_down_delay: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stable_window: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_pod_retention_period: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OffloadingConfig {
    /// Remote backend receiving offloaded traffic. Falls back to the
    /// operator-wide default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_backend: Option<RemoteBackend>,

    /// Metrics whose sustained breach triggers offloading.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<MetricSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub behavior: Option<OffloadingBehavior>,
}

impl OffloadingConfig {
    pub fn percentage(&self) -> i32 {
        self.behavior
            .as_ref()
            .map(|b| b.percentage)
            .unwrap_or(DEFAULT_OFFLOAD_PERCENTAGE)
    }
}

pub const DEFAULT_OFFLOAD_PERCENTAGE: i32 = 100;

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OffloadingBehavior {
    /// Percentage of requests diverted to the remote backend when the
    /// metric condition holds.
    pub percentage: i32,
}

#[derive(
    Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Default,
)]
#[serde(rename_all = "camelCase")]
pub struct RemoteBackend {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_config: Option<AuthConfig>,
    /// Path prefix prepended to offloaded requests. `$workspace` and
    /// `$model` are substituted before publication.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path_prefix: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers_to_add: BTreeMap<String, String>,
    #[serde(default)]
    pub scheme: SupportedScheme,
}

#[derive(
    Deserialize,
    Serialize,
    Clone,
    Copy,
    Debug,
    JsonSchema,
    PartialEq,
    Eq,
    Default,
)]
pub enum SupportedScheme {
    #[default]
    #[serde(rename = "http")]
    Http,
    #[serde(rename = "https")]
    Https,
}

impl SupportedScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupportedScheme::Http => "http",
            SupportedScheme::Https => "https",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    #[serde(rename = "type")]
    pub auth_type: AuthType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_config: Option<OAuthConfig>,
}

#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq,
)]
pub enum AuthType {
    #[serde(rename = "oauth")]
    OAuth,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
}

#[derive(
    Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq,
)]
#[serde(rename_all = "camelCase")]
pub struct ModelDeploymentStatus {
    /// True while the model's route diverts a non-zero share of traffic.
    #[serde(default)]
    pub offloading_status: bool,
    /// Pod port the model is served on, resolved from `serviceRef`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serving_port: Option<i32>,
    /// Pod port metrics are exposed on, resolved from `metricServiceRef`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at_on_beamlit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at_on_beamlit: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SpecValidationError {
    #[error("offloadingConfig.behavior.percentage {0} is outside [0, 100]")]
    PercentageOutOfRange(i32),
    #[error("serverlessConfig.scaleUpMinimum {0} must be at least 2")]
    ScaleUpMinimumTooLow(i32),
    #[error("modelSourceRef.kind {0:?} is not a supported workload kind")]
    UnsupportedWorkloadKind(String),
    #[error("offloadingConfig requires spec.serviceRef")]
    MissingServiceRef,
}

impl ModelDeploymentSpec {
    /// Validation the CRD schema cannot express. Malformed specs are logged
    /// and refused actuation; they are not retried until the spec changes.
    pub fn validate(&self) -> Result<(), SpecValidationError> {
        if let Some(offloading) = &self.offloading_config {
            let pct = offloading.percentage();
            if !(0..=100).contains(&pct) {
                return Err(SpecValidationError::PercentageOutOfRange(pct));
            }
            if self.service_ref.is_none() {
                return Err(SpecValidationError::MissingServiceRef);
            }
        }
        if let Some(serverless) = &self.serverless_config {
            if let Some(minimum) = serverless.scale_up_minimum {
                if minimum < 2 {
                    return Err(SpecValidationError::ScaleUpMinimumTooLow(
                        minimum,
                    ));
                }
            }
        }
        if crate::resources::WorkloadKind::parse(&self.model_source_ref.kind)
            .is_none()
        {
            return Err(SpecValidationError::UnsupportedWorkloadKind(
                self.model_source_ref.kind.clone(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_spec() -> ModelDeploymentSpec {
        serde_json::from_value(serde_json::json!({
            "model": "llama",
            "modelSourceRef": {"kind": "Deployment", "name": "llama"},
        }))
        .unwrap()
    }

    #[test]
    fn spec_defaults_apply() {
        let spec = minimal_spec();
        assert!(spec.enabled);
        assert_eq!(spec.environment, "production");
        assert!(spec.offloading_config.is_none());
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn offloading_defaults_to_full_percentage() {
        let config: OffloadingConfig =
            serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(config.percentage(), 100);

        let config: OffloadingConfig = serde_json::from_value(
            serde_json::json!({"behavior": {"percentage": 30}}),
        )
        .unwrap();
        assert_eq!(config.percentage(), 30);
    }

    #[test]
    fn validate_rejects_out_of_range_percentage() {
        let mut spec = minimal_spec();
        spec.service_ref = Some(ServiceReference {
            namespace: None,
            name: "llama".into(),
            target_port: 80,
        });
        spec.offloading_config = Some(OffloadingConfig {
            remote_backend: None,
            metrics: vec![],
            behavior: Some(OffloadingBehavior { percentage: 120 }),
        });
        assert_eq!(
            spec.validate(),
            Err(SpecValidationError::PercentageOutOfRange(120))
        );
    }

    #[test]
    fn validate_requires_service_ref_with_offloading() {
        let mut spec = minimal_spec();
        spec.offloading_config = Some(OffloadingConfig {
            remote_backend: None,
            metrics: vec![],
            behavior: None,
        });
        assert_eq!(
            spec.validate(),
            Err(SpecValidationError::MissingServiceRef)
        );
    }

    #[test]
    fn validate_rejects_low_scale_up_minimum() {
        let mut spec = minimal_spec();
        spec.serverless_config = Some(ServerlessConfig {
            scale_up_minimum: Some(1),
            ..Default::default()
        });
        assert_eq!(
            spec.validate(),
            Err(SpecValidationError::ScaleUpMinimumTooLow(1))
        );
    }

    #[test]
    fn validate_rejects_unknown_workload_kind() {
        let mut spec = minimal_spec();
        spec.model_source_ref.kind = "CronJob".into();
        assert!(matches!(
            spec.validate(),
            Err(SpecValidationError::UnsupportedWorkloadKind(_))
        ));
    }

    #[test]
    fn remote_backend_scheme_defaults_to_http() {
        let backend: RemoteBackend = serde_json::from_value(
            serde_json::json!({"host": "run.beamlit.com"}),
        )
        .unwrap();
        assert_eq!(backend.scheme, SupportedScheme::Http);
        assert!(serde_json::from_value::<RemoteBackend>(serde_json::json!({
            "host": "run.beamlit.com",
            "scheme": "ftp"
        }))
        .is_err());
    }
}
