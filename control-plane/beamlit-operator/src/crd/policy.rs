use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Policy mirrors a Beamlit placement policy into the cluster. The operator
/// only relays it: the remote registry evaluates it.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "authorization.beamlit.com",
    version = "v1alpha1",
    kind = "Policy",
    plural = "policies",
    namespaced,
    status = "PolicyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(rename = "type")]
    pub policy_type: PolicyType,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<PolicyLocation>,

    /// Flavors allowed by the policy; empty means all flavors.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flavors: Vec<PolicyFlavor>,
}

#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq,
)]
pub enum PolicyType {
    #[serde(rename = "location")]
    Location,
    #[serde(rename = "flavor")]
    Flavor,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyLocation {
    #[serde(rename = "type")]
    pub location_type: PolicyLocationType,
    pub name: String,
}

#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq,
)]
pub enum PolicyLocationType {
    #[serde(rename = "location")]
    Location,
    #[serde(rename = "country")]
    Country,
    #[serde(rename = "continent")]
    Continent,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyFlavor {
    #[serde(rename = "type")]
    pub flavor_type: String,
    pub name: String,
}

#[derive(
    Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq,
)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at_on_beamlit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at_on_beamlit: Option<String>,
}
