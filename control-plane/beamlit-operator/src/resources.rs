//! Workload and service resolution.
//!
//! The four supported workload kinds differ only in where the pod template
//! and the replica counts live; [`WorkloadKind`] is the tagged variant and
//! [`resolve_workload`] the single resolver over it.

use k8s_openapi::api::apps::v1::{
    DaemonSet, Deployment, ReplicaSet, StatefulSet,
};
use k8s_openapi::api::core::v1::Service;
use kube::{Api, Client};

use crate::crd::{ServiceReference, WorkloadReference};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
    ReplicaSet,
}

impl WorkloadKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "Deployment" => Some(WorkloadKind::Deployment),
            "StatefulSet" => Some(WorkloadKind::StatefulSet),
            "DaemonSet" => Some(WorkloadKind::DaemonSet),
            "ReplicaSet" => Some(WorkloadKind::ReplicaSet),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::DaemonSet => "DaemonSet",
            WorkloadKind::ReplicaSet => "ReplicaSet",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkloadInfo {
    /// Pod template serialized for the registry DTO.
    pub pod_template: serde_json::Value,
    pub ready_replicas: i32,
    pub total_replicas: i32,
}

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("unsupported workload kind: {0}")]
    UnsupportedKind(String),
    #[error("service {namespace}/{name} has no port {port}")]
    PortNotFound {
        namespace: String,
        name: String,
        port: i32,
    },
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Resolves the referenced workload to its pod template and replica counts.
pub async fn resolve_workload(
    client: Client,
    workload_ref: &WorkloadReference,
    default_namespace: &str,
) -> Result<WorkloadInfo, ResourceError> {
    let kind = WorkloadKind::parse(&workload_ref.kind).ok_or_else(|| {
        ResourceError::UnsupportedKind(workload_ref.kind.clone())
    })?;
    let ns = workload_ref
        .namespace
        .as_deref()
        .unwrap_or(default_namespace);
    let name = &workload_ref.name;

    match kind {
        WorkloadKind::Deployment => {
            let api: Api<Deployment> = Api::namespaced(client, ns);
            let workload = api.get(name).await?;
            let status = workload.status.unwrap_or_default();
            Ok(WorkloadInfo {
                pod_template: serde_json::to_value(
                    workload.spec.map(|s| s.template).unwrap_or_default(),
                )?,
                ready_replicas: status.ready_replicas.unwrap_or(0),
                total_replicas: status.replicas.unwrap_or(0),
            })
        }
        WorkloadKind::StatefulSet => {
            let api: Api<StatefulSet> = Api::namespaced(client, ns);
            let workload = api.get(name).await?;
            let status = workload.status.unwrap_or_default();
            Ok(WorkloadInfo {
                pod_template: serde_json::to_value(
                    workload.spec.map(|s| s.template).unwrap_or_default(),
                )?,
                ready_replicas: status.ready_replicas.unwrap_or(0),
                total_replicas: status.replicas,
            })
        }
        WorkloadKind::DaemonSet => {
            let api: Api<DaemonSet> = Api::namespaced(client, ns);
            let workload = api.get(name).await?;
            let status = workload.status.unwrap_or_default();
            Ok(WorkloadInfo {
                pod_template: serde_json::to_value(
                    workload.spec.map(|s| s.template).unwrap_or_default(),
                )?,
                ready_replicas: status.number_ready,
                total_replicas: status.desired_number_scheduled,
            })
        }
        WorkloadKind::ReplicaSet => {
            let api: Api<ReplicaSet> = Api::namespaced(client, ns);
            let workload = api.get(name).await?;
            let status = workload.status.unwrap_or_default();
            Ok(WorkloadInfo {
                pod_template: serde_json::to_value(
                    workload
                        .spec
                        .and_then(|s| s.template)
                        .unwrap_or_default(),
                )?,
                ready_replicas: status.ready_replicas.unwrap_or(0),
                total_replicas: status.replicas,
            })
        }
    }
}

/// Resolves the pod-side target port of a service reference by matching
/// `ports[].port == target_port` on the referenced Service.
pub async fn resolve_service_target_port(
    client: Client,
    service_ref: &ServiceReference,
    default_namespace: &str,
) -> Result<i32, ResourceError> {
    let ns = service_ref
        .namespace
        .as_deref()
        .unwrap_or(default_namespace);
    let api: Api<Service> = Api::namespaced(client, ns);
    let service = api.get(&service_ref.name).await?;
    let ports = service
        .spec
        .and_then(|s| s.ports)
        .unwrap_or_default();
    for port in ports {
        if port.port == service_ref.target_port {
            if let Some(target) = port.target_port {
                return Ok(match target {
                    k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(i) => i,
                    // named target ports resolve to the service port itself;
                    // the gateway dials pods through the mirrored slice which
                    // carries the numeric port
                    k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::String(_) => port.port,
                });
            }
            return Ok(port.port);
        }
    }
    Err(ResourceError::PortNotFound {
        namespace: ns.to_string(),
        name: service_ref.name.clone(),
        port: service_ref.target_port,
    })
}
