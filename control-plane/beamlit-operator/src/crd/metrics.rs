//! Offloading metric specs.
//!
//! These mirror the shape of `autoscaling/v2` metric sources so users can
//! paste HPA-style metric blocks into a ModelDeployment, but they are owned
//! here: the informer deduplicates specs by [`MetricSpec::canonical_key`],
//! which compares quantities by value and selectors by their sorted
//! `key=value` form rather than by struct layout.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricSpec {
    #[serde(rename = "type")]
    pub source: MetricSourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceMetricSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pods: Option<PodsMetricSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<ObjectMetricSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_resource: Option<ContainerResourceMetricSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalMetricSource>,
}

#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq,
)]
pub enum MetricSourceType {
    Resource,
    Pods,
    Object,
    ContainerResource,
    External,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetricSource {
    pub name: ResourceName,
    pub target: MetricTarget,
}

#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq,
)]
pub enum ResourceName {
    #[serde(rename = "cpu")]
    Cpu,
    #[serde(rename = "memory")]
    Memory,
    #[serde(rename = "ephemeral-storage")]
    EphemeralStorage,
    #[serde(rename = "storage")]
    Storage,
}

impl ResourceName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceName::Cpu => "cpu",
            ResourceName::Memory => "memory",
            ResourceName::EphemeralStorage => "ephemeral-storage",
            ResourceName::Storage => "storage",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodsMetricSource {
    pub metric: MetricIdentifier,
    pub target: MetricTarget,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetricSource {
    pub described_object: CrossVersionObjectReference,
    pub metric: MetricIdentifier,
    pub target: MetricTarget,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerResourceMetricSource {
    pub name: ResourceName,
    pub container: String,
    pub target: MetricTarget,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalMetricSource {
    pub metric: MetricIdentifier,
    pub target: MetricTarget,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricIdentifier {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
}

#[derive(
    Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Default,
)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    /// Canonical `k=v,k=v` form, sorted by key. Doubles as the
    /// `labelSelector` query parameter for metric API calls.
    pub fn to_query(&self) -> String {
        self.match_labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CrossVersionObjectReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    pub kind: String,
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricTarget {
    #[serde(rename = "type")]
    pub target_type: MetricTargetType,
    /// Quantity string, e.g. `"500m"` or `"2Gi"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_value: Option<String>,
    /// Percentage of requested resources; resource metrics only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_utilization: Option<i32>,
}

#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq,
)]
pub enum MetricTargetType {
    Utilization,
    Value,
    AverageValue,
}

impl MetricSpec {
    /// Canonical string identity for dedup inside the sustained-window
    /// tracker. Two specs that differ only in label ordering or quantity
    /// spelling ("0.5" vs "500m") collapse to the same key.
    pub fn canonical_key(&self) -> String {
        match self.source {
            MetricSourceType::Resource => match &self.resource {
                Some(r) => format!(
                    "resource/{}/{}",
                    r.name.as_str(),
                    r.target.canonical()
                ),
                None => "resource/invalid".to_string(),
            },
            MetricSourceType::Pods => match &self.pods {
                Some(p) => format!(
                    "pods/{}/{}",
                    p.metric.canonical(),
                    p.target.canonical()
                ),
                None => "pods/invalid".to_string(),
            },
            MetricSourceType::Object => match &self.object {
                Some(o) => format!(
                    "object/{}.{}.{}/{}/{}",
                    o.described_object.api_version.as_deref().unwrap_or(""),
                    o.described_object.kind,
                    o.described_object.name,
                    o.metric.canonical(),
                    o.target.canonical()
                ),
                None => "object/invalid".to_string(),
            },
            MetricSourceType::ContainerResource => {
                match &self.container_resource {
                    Some(c) => format!(
                        "containerResource/{}/{}/{}",
                        c.name.as_str(),
                        c.container,
                        c.target.canonical()
                    ),
                    None => "containerResource/invalid".to_string(),
                }
            }
            MetricSourceType::External => match &self.external {
                Some(e) => format!(
                    "external/{}/{}",
                    e.metric.canonical(),
                    e.target.canonical()
                ),
                None => "external/invalid".to_string(),
            },
        }
    }
}

impl MetricIdentifier {
    fn canonical(&self) -> String {
        match &self.selector {
            Some(s) if !s.match_labels.is_empty() => {
                format!("{}{{{}}}", self.name, s.to_query())
            }
            _ => self.name.clone(),
        }
    }
}

impl MetricTarget {
    fn canonical(&self) -> String {
        match self.target_type {
            MetricTargetType::Utilization => format!(
                "utilization:{}",
                self.average_utilization.unwrap_or_default()
            ),
            MetricTargetType::Value => format!(
                "value:{}",
                self.value
                    .as_deref()
                    .and_then(parse_quantity_milli)
                    .unwrap_or_default()
            ),
            MetricTargetType::AverageValue => format!(
                "averageValue:{}",
                self.average_value
                    .as_deref()
                    .and_then(parse_quantity_milli)
                    .unwrap_or_default()
            ),
        }
    }
}

/// Parses a Kubernetes quantity into milli-units (`"1"` → 1000,
/// `"500m"` → 500, `"2Ki"` → 2048000). Returns `None` for malformed input.
pub fn parse_quantity_milli(quantity: &str) -> Option<i64> {
    let quantity = quantity.trim();
    if quantity.is_empty() {
        return None;
    }
    let split_at = quantity
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+' || c == 'e' || c == 'E'))
        .unwrap_or(quantity.len());
    // 'e' is ambiguous between exponents and the (unused) exa suffix; treat a
    // trailing alphabetic run as the suffix.
    let suffix_start = quantity
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_alphabetic())
        .last()
        .map(|(i, _)| i)
        .unwrap_or(quantity.len());
    let (number, suffix) = if suffix_start >= split_at {
        quantity.split_at(suffix_start)
    } else {
        (quantity, "")
    };
    let base: f64 = number.parse().ok()?;
    let multiplier: f64 = match suffix {
        "" => 1.0,
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0f64.powi(4),
        "Pi" => 1024.0f64.powi(5),
        _ => return None,
    };
    Some((base * multiplier * 1000.0).round() as i64)
}
