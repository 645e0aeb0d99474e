//! Wire DTOs for the Beamlit registry API (snake_case on the wire).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crd::{self, ModelDeployment, PolicySpec};

pub const LABEL_MANAGED_BY: &str = "managed-by";
pub const LABEL_OFFLOADING_ENABLED: &str = "offloading-enabled";
pub const LABEL_OFFLOADING: &str = "offloading";
pub const OPERATOR_ID: &str = "beamlit-operator";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Model {
    pub model: String,
    pub environment: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serving_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serverless_config: Option<ServerlessConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerlessConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_num_replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_num_replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_up_minimum: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_down_delay: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stable_window: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_pod_retention_period: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegistryPolicy {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(rename = "type")]
    pub policy_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<PolicyEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flavors: Vec<PolicyEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyEntry {
    #[serde(rename = "type")]
    pub entry_type: String,
    pub name: String,
}

impl Model {
    /// Builds the registry form of a ModelDeployment. `pod_template` comes
    /// from the resource adapter; labels always carry the operator identity
    /// and the offloading flag.
    pub fn from_deployment(
        deployment: &ModelDeployment,
        pod_template: serde_json::Value,
    ) -> Self {
        let spec = &deployment.spec;
        let mut labels: BTreeMap<String, String> = deployment
            .metadata
            .labels
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect();
        labels
            .insert(LABEL_MANAGED_BY.to_string(), OPERATOR_ID.to_string());
        labels.insert(
            LABEL_OFFLOADING_ENABLED.to_string(),
            (spec.enabled && spec.offloading_config.is_some()).to_string(),
        );

        let status = deployment.status.clone().unwrap_or_default();
        Model {
            model: spec.model.clone(),
            environment: spec.environment.clone(),
            labels,
            enabled: spec.enabled,
            serving_port: status.serving_port,
            metric_port: status.metric_port,
            policies: spec.policies.iter().map(|p| p.name.clone()).collect(),
            serverless_config: spec
                .serverless_config
                .as_ref()
                .map(ServerlessConfig::from_spec),
            pod_template: Some(pod_template),
            workspace: None,
            created_at: None,
            updated_at: None,
        }
    }
}

impl ServerlessConfig {
    fn from_spec(spec: &crd::model_deployment::ServerlessConfig) -> Self {
        ServerlessConfig {
            min_num_replicas: spec.min_num_replicas,
            max_num_replicas: spec.max_num_replicas,
            metric: spec.metric.clone(),
            target: spec.target.clone(),
            scale_up_minimum: spec.scale_up_minimum,
            scale_down_delay: spec.scale_down_delay.clone(),
            stable_window: spec.stable_window.clone(),
            last_pod_retention_period: spec.last_pod_retention_period.clone(),
        }
    }
}

impl RegistryPolicy {
    pub fn from_policy(name: &str, spec: &PolicySpec) -> Self {
        RegistryPolicy {
            name: name.to_string(),
            display_name: spec.display_name.clone(),
            policy_type: match spec.policy_type {
                crd::policy::PolicyType::Location => "location".to_string(),
                crd::policy::PolicyType::Flavor => "flavor".to_string(),
            },
            locations: spec
                .locations
                .iter()
                .map(|l| PolicyEntry {
                    entry_type: match l.location_type {
                        crd::policy::PolicyLocationType::Location => {
                            "location".to_string()
                        }
                        crd::policy::PolicyLocationType::Country => {
                            "country".to_string()
                        }
                        crd::policy::PolicyLocationType::Continent => {
                            "continent".to_string()
                        }
                    },
                    name: l.name.clone(),
                })
                .collect(),
            flavors: spec
                .flavors
                .iter()
                .map(|f| PolicyEntry {
                    entry_type: f.flavor_type.clone(),
                    name: f.name.clone(),
                })
                .collect(),
            workspace: None,
            created_at: None,
            updated_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;

    fn deployment(enabled: bool, offloading: bool) -> ModelDeployment {
        let mut dep = ModelDeployment::new(
            "my-model",
            serde_json::from_value(serde_json::json!({
                "model": "llama",
                "environment": "production",
                "enabled": enabled,
                "modelSourceRef": {"kind": "Deployment", "name": "llama"},
                "policies": [
                    {"refType": "remotePolicy", "name": "eu-only"},
                    {"refType": "localPolicy", "name": "gpu-small"}
                ],
            }))
            .unwrap(),
        );
        dep.metadata = ObjectMeta {
            name: Some("my-model".into()),
            namespace: Some("default".into()),
            labels: Some(
                [("team".to_string(), "ml".to_string())].into_iter().collect(),
            ),
            ..Default::default()
        };
        if offloading {
            dep.spec.offloading_config =
                serde_json::from_value(serde_json::json!({})).unwrap();
        }
        dep
    }

    #[test]
    fn model_labels_carry_operator_identity() {
        let model =
            Model::from_deployment(&deployment(true, true), serde_json::json!({}));
        assert_eq!(
            model.labels.get(LABEL_MANAGED_BY).map(String::as_str),
            Some(OPERATOR_ID)
        );
        assert_eq!(
            model
                .labels
                .get(LABEL_OFFLOADING_ENABLED)
                .map(String::as_str),
            Some("true")
        );
        assert_eq!(model.labels.get("team").map(String::as_str), Some("ml"));
        assert_eq!(model.policies, vec!["eu-only", "gpu-small"]);
    }

    #[test]
    fn offloading_enabled_label_requires_both_flags() {
        let disabled =
            Model::from_deployment(&deployment(false, true), serde_json::json!({}));
        assert_eq!(
            disabled
                .labels
                .get(LABEL_OFFLOADING_ENABLED)
                .map(String::as_str),
            Some("false")
        );
        let no_config =
            Model::from_deployment(&deployment(true, false), serde_json::json!({}));
        assert_eq!(
            no_config
                .labels
                .get(LABEL_OFFLOADING_ENABLED)
                .map(String::as_str),
            Some("false")
        );
    }

    #[test]
    fn wire_names_are_snake_case() {
        let model =
            Model::from_deployment(&deployment(true, true), serde_json::json!({}));
        let json = serde_json::to_value(&model).unwrap();
        assert!(json.get("pod_template").is_some());
        assert!(json.get("serving_port").is_none()); // unset → omitted
        assert_eq!(json["environment"], "production");
    }
}
