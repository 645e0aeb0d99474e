//! Offload actuators.
//!
//! An actuator turns a `(model, local backend, remote backend, percent)`
//! tuple into a published weighted route. Two interchangeable
//! implementations exist: a declarative Gateway API HTTPRoute and the
//! embedded proxy's imperative REST API. Exactly one is selected at
//! startup.

pub mod beamlit_gateway;
pub mod gateway_api;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;

use crate::beamlit::RegistryError;
use crate::controller::index::ModelKey;
use crate::crd::{ModelDeployment, RemoteBackend, ServiceReference};

pub const HEADER_MODEL: &str = "X-Beamlit-Model";
pub const HEADER_WORKSPACE: &str = "X-Beamlit-Workspace";
pub const HEADER_AUTHORIZATION: &str = "X-Beamlit-Authorization";

#[derive(Debug, thiserror::Error)]
pub enum OffloadError {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("gateway admin api returned {status}: {body}")]
    AdminStatus {
        status: http::StatusCode,
        body: String,
    },
    #[error("token error: {0}")]
    Token(#[from] RegistryError),
    #[error("model has no serviceRef")]
    MissingServiceRef,
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[async_trait]
pub trait Offloader: Send + Sync {
    /// Creates or updates the weighted route for `model`. `remote_percent`
    /// of the traffic goes to the remote backend, the rest to the local
    /// shadow backend. Zero-weight backends stay listed so percentage
    /// flips are single-field mutations.
    async fn configure(
        &self,
        model: &ModelDeployment,
        local_backend: &ServiceReference,
        remote_backend: &RemoteBackend,
        remote_percent: i32,
    ) -> Result<(), OffloadError>;

    /// Removes the route for `key`; absent routes are a silent no-op.
    async fn cleanup(&self, key: &ModelKey) -> Result<(), OffloadError>;

    /// Stops background work (token refresh loops).
    fn shutdown(&self);
}

/// The hostname set a route must match: cluster-IP plus every DNS form of
/// the user's service.
pub(crate) fn route_hostnames(service: &Service) -> Vec<String> {
    let name = service
        .metadata
        .name
        .clone()
        .unwrap_or_default();
    let namespace = service
        .metadata
        .namespace
        .clone()
        .unwrap_or_default();
    let mut hostnames = Vec::with_capacity(5);
    if let Some(cluster_ip) = service
        .spec
        .as_ref()
        .and_then(|s| s.cluster_ip.clone())
        .filter(|ip| !ip.is_empty() && ip != "None")
    {
        hostnames.push(cluster_ip);
    }
    hostnames.push(name.clone());
    hostnames.push(format!("{name}.{namespace}"));
    hostnames.push(format!("{name}.{namespace}.svc"));
    hostnames.push(format!("{name}.{namespace}.svc.cluster.local"));
    hostnames
}

/// Expands `$workspace` and `$model` in a remote path prefix.
pub(crate) fn expand_path_prefix(
    prefix: &str,
    workspace: &str,
    model: &str,
) -> String {
    prefix
        .replace("$workspace", workspace)
        .replace("$model", model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ServiceSpec;
    use kube::core::ObjectMeta;

    #[test]
    fn hostnames_cover_every_dns_form() {
        let service = Service {
            metadata: ObjectMeta {
                name: Some("svc".into()),
                namespace: Some("ml".into()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some("10.0.0.5".into()),
                ..Default::default()
            }),
            status: None,
        };
        assert_eq!(
            route_hostnames(&service),
            vec![
                "10.0.0.5",
                "svc",
                "svc.ml",
                "svc.ml.svc",
                "svc.ml.svc.cluster.local",
            ]
        );
    }

    #[test]
    fn headless_services_have_no_ip_hostname() {
        let service = Service {
            metadata: ObjectMeta {
                name: Some("svc".into()),
                namespace: Some("ml".into()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".into()),
                ..Default::default()
            }),
            status: None,
        };
        assert_eq!(route_hostnames(&service).len(), 4);
    }

    #[test]
    fn path_prefix_expansion_substitutes_both_variables() {
        assert_eq!(
            expand_path_prefix(
                "/$workspace/models/$model",
                "acme",
                "llama"
            ),
            "/acme/models/llama"
        );
        assert_eq!(expand_path_prefix("/static", "acme", "llama"), "/static");
    }
}
