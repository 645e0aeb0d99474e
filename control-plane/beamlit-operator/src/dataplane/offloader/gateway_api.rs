//! Gateway API actuator.
//!
//! Publishes an HTTPRoute per model through server-side apply. The remote
//! backend is reached through an ExternalName Service so the route can
//! reference it as a regular backendRef. A single refresh task rotates the
//! bearer header on every published route when the Beamlit token changes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::core::{DynamicObject, GroupVersionKind, ObjectMeta};
use kube::discovery::ApiResource;
use kube::{Api, Client};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use super::{
    HEADER_AUTHORIZATION, HEADER_MODEL, HEADER_WORKSPACE, OffloadError,
    Offloader, expand_path_prefix, route_hostnames,
};
use crate::beamlit::BeamlitToken;
use crate::controller::index::ModelKey;
use crate::crd::{
    ModelDeployment, RemoteBackend, ServiceReference, SupportedScheme,
};

const TOKEN_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
struct PublishedRoute {
    namespace: String,
    name: String,
}

pub struct GatewayApiOffloader {
    client: Client,
    gateway_name: String,
    gateway_namespace: String,
    default_namespace: String,
    token: Arc<BeamlitToken>,
    routes: Arc<DashMap<ModelKey, PublishedRoute>>,
    refresh_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

fn http_route_api(client: Client, namespace: &str) -> Api<DynamicObject> {
    let gvk =
        GroupVersionKind::gvk("gateway.networking.k8s.io", "v1", "HTTPRoute");
    let resource = ApiResource::from_gvk(&gvk);
    Api::namespaced_with(client, namespace, &resource)
}

impl GatewayApiOffloader {
    pub fn new(
        client: Client,
        gateway_namespace: &str,
        gateway_name: &str,
        default_namespace: &str,
        token: Arc<BeamlitToken>,
    ) -> Arc<Self> {
        let offloader = Arc::new(Self {
            client,
            gateway_name: gateway_name.to_string(),
            gateway_namespace: gateway_namespace.to_string(),
            default_namespace: default_namespace.to_string(),
            token,
            routes: Arc::new(DashMap::new()),
            refresh_task: std::sync::Mutex::new(None),
        });
        let handle = tokio::spawn(refresh_loop(
            offloader.client.clone(),
            offloader.token.clone(),
            offloader.routes.clone(),
        ));
        *offloader.refresh_task.lock().unwrap() = Some(handle);
        offloader
    }

    fn remote_service_name(model_name: &str) -> String {
        format!("{model_name}-beamlit-remote")
    }

    /// Applies an ExternalName Service pointing at the remote host so the
    /// HTTPRoute can back onto it.
    async fn apply_remote_service(
        &self,
        namespace: &str,
        model_name: &str,
        remote: &RemoteBackend,
    ) -> Result<(String, i32), OffloadError> {
        let (host, port) = split_remote_host(remote);
        let name = Self::remote_service_name(model_name);
        let service = Service {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("ExternalName".to_string()),
                external_name: Some(host),
                ports: Some(vec![ServicePort {
                    port,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        };
        let api: Api<Service> =
            Api::namespaced(self.client.clone(), namespace);
        api.patch(
            &name,
            &PatchParams::apply(crate::beamlit::types::OPERATOR_ID).force(),
            &Patch::Apply(&service),
        )
        .await?;
        Ok((name, port))
    }

    fn build_manifest(
        &self,
        route_name: &str,
        namespace: &str,
        hostnames: &[String],
        model: &ModelDeployment,
        local_backend: &ServiceReference,
        remote_service: &str,
        remote_port: i32,
        remote_backend: &RemoteBackend,
        remote_percent: i32,
        bearer: &str,
    ) -> serde_json::Value {
        let workspace = model
            .status
            .as_ref()
            .and_then(|s| s.workspace.clone())
            .unwrap_or_default();
        let local_namespace = local_backend
            .namespace
            .clone()
            .unwrap_or_else(|| self.default_namespace.clone());

        let mut set_headers = vec![
            json!({"name": HEADER_WORKSPACE, "value": workspace}),
            json!({"name": HEADER_MODEL, "value": model.spec.model}),
            json!({
                "name": HEADER_AUTHORIZATION,
                "value": format!("Bearer {bearer}"),
            }),
        ];
        for (name, value) in &remote_backend.headers_to_add {
            set_headers.push(json!({"name": name, "value": value}));
        }

        let mut remote_filters = vec![json!({
            "type": "RequestHeaderModifier",
            "requestHeaderModifier": {"set": set_headers},
        })];
        let path_prefix = expand_path_prefix(
            &remote_backend.path_prefix,
            &workspace,
            &model.spec.model,
        );
        if !path_prefix.is_empty() {
            remote_filters.push(json!({
                "type": "URLRewrite",
                "urlRewrite": {"path": {
                    "type": "ReplacePrefixMatch",
                    "replacePrefixMatch": path_prefix,
                }},
            }));
        }

        json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "HTTPRoute",
            "metadata": {
                "name": route_name,
                "namespace": namespace,
            },
            "spec": {
                "parentRefs": [{
                    "group": "gateway.networking.k8s.io",
                    "kind": "Gateway",
                    "name": self.gateway_name,
                    "namespace": self.gateway_namespace,
                }],
                "hostnames": hostnames,
                "rules": [{
                    "matches": [{
                        "path": {"type": "PathPrefix", "value": "/"}
                    }],
                    "backendRefs": [
                        {
                            "kind": "Service",
                            "name": local_backend.name,
                            "namespace": local_namespace,
                            "port": local_backend.target_port,
                            "weight": 100 - remote_percent,
                        },
                        {
                            "kind": "Service",
                            "name": remote_service,
                            "namespace": namespace,
                            "port": remote_port,
                            "weight": remote_percent,
                            "filters": remote_filters,
                        },
                    ],
                }],
            },
        })
    }
}

fn split_remote_host(remote: &RemoteBackend) -> (String, i32) {
    match remote.host.split_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse().unwrap_or_else(|_| default_port(remote.scheme)),
        ),
        None => (remote.host.clone(), default_port(remote.scheme)),
    }
}

fn default_port(scheme: SupportedScheme) -> i32 {
    match scheme {
        SupportedScheme::Http => 80,
        SupportedScheme::Https => 443,
    }
}

/// Rewrites the bearer header inside an HTTPRoute manifest. Returns true
/// when a header was updated.
fn update_auth_header(manifest: &mut serde_json::Value, bearer: &str) -> bool {
    let mut updated = false;
    let Some(rules) = manifest
        .pointer_mut("/spec/rules")
        .and_then(|r| r.as_array_mut())
    else {
        return false;
    };
    for rule in rules {
        let Some(backend_refs) = rule
            .get_mut("backendRefs")
            .and_then(|b| b.as_array_mut())
        else {
            continue;
        };
        for backend in backend_refs {
            let Some(filters) =
                backend.get_mut("filters").and_then(|f| f.as_array_mut())
            else {
                continue;
            };
            for filter in filters {
                let Some(set) = filter
                    .pointer_mut("/requestHeaderModifier/set")
                    .and_then(|s| s.as_array_mut())
                else {
                    continue;
                };
                for header in set {
                    if header.get("name").and_then(|n| n.as_str())
                        == Some(HEADER_AUTHORIZATION)
                    {
                        header["value"] = json!(format!("Bearer {bearer}"));
                        updated = true;
                    }
                }
            }
        }
    }
    updated
}

/// Periodically re-reads the Beamlit token and patches every published
/// route when the bearer rotates. Failures keep the last good token in
/// place.
async fn refresh_loop(
    client: Client,
    token: Arc<BeamlitToken>,
    routes: Arc<DashMap<ModelKey, PublishedRoute>>,
) {
    let mut current = match token.get_token().await {
        Ok(t) => t,
        Err(_) => String::new(),
    };
    let mut ticker = tokio::time::interval(TOKEN_REFRESH_INTERVAL);
    loop {
        ticker.tick().await;
        let fresh = match token.get_token().await {
            Ok(t) => t,
            Err(error) => {
                warn!(%error, "token refresh failed, keeping last bearer");
                continue;
            }
        };
        if fresh == current {
            continue;
        }
        current = fresh.clone();
        for entry in routes.iter() {
            let route = entry.value().clone();
            let api = http_route_api(client.clone(), &route.namespace);
            let existing = match api.get(&route.name).await {
                Ok(obj) => obj,
                Err(error) => {
                    warn!(route = %route.name, %error, "cannot read route for token rotation");
                    continue;
                }
            };
            let mut manifest = match serde_json::to_value(&existing) {
                Ok(value) => value,
                Err(error) => {
                    warn!(route = %route.name, %error, "cannot serialize route");
                    continue;
                }
            };
            if !update_auth_header(&mut manifest, &fresh) {
                continue;
            }
            let patched: DynamicObject =
                match serde_json::from_value(manifest) {
                    Ok(obj) => obj,
                    Err(error) => {
                        warn!(route = %route.name, %error, "cannot rebuild route");
                        continue;
                    }
                };
            if let Err(error) = api
                .replace(&route.name, &PostParams::default(), &patched)
                .await
            {
                warn!(route = %route.name, %error, "failed to rotate bearer on route");
            } else {
                debug!(route = %route.name, "rotated bearer on route");
            }
        }
    }
}

#[async_trait]
impl Offloader for GatewayApiOffloader {
    #[instrument(skip_all, fields(model = %model.metadata.name.as_deref().unwrap_or(""), percent = remote_percent))]
    async fn configure(
        &self,
        model: &ModelDeployment,
        local_backend: &ServiceReference,
        remote_backend: &RemoteBackend,
        remote_percent: i32,
    ) -> Result<(), OffloadError> {
        let service_ref = model
            .spec
            .service_ref
            .as_ref()
            .ok_or(OffloadError::MissingServiceRef)?;
        let namespace = service_ref
            .namespace
            .clone()
            .unwrap_or_else(|| self.default_namespace.clone());
        let service_api: Api<Service> =
            Api::namespaced(self.client.clone(), &namespace);
        let service = service_api.get(&service_ref.name).await?;
        let hostnames = route_hostnames(&service);

        let model_name = model.metadata.name.as_deref().unwrap_or("");
        let (remote_service, remote_port) = self
            .apply_remote_service(&namespace, model_name, remote_backend)
            .await?;

        let bearer = self.token.get_token().await?;
        let route_name = format!("{model_name}-http-route");
        let manifest = self.build_manifest(
            &route_name,
            &namespace,
            &hostnames,
            model,
            local_backend,
            &remote_service,
            remote_port,
            remote_backend,
            remote_percent,
            &bearer,
        );

        let api = http_route_api(self.client.clone(), &namespace);
        api.patch(
            &route_name,
            &PatchParams::apply(crate::beamlit::types::OPERATOR_ID).force(),
            &Patch::Apply(&manifest),
        )
        .await?;

        let key = ModelKey::new(
            model.metadata.namespace.as_deref().unwrap_or("default"),
            model_name,
        );
        self.routes.insert(
            key,
            PublishedRoute {
                namespace,
                name: route_name,
            },
        );
        Ok(())
    }

    #[instrument(skip(self))]
    async fn cleanup(&self, key: &ModelKey) -> Result<(), OffloadError> {
        let Some((_, route)) = self.routes.remove(key) else {
            return Ok(());
        };
        let api = http_route_api(self.client.clone(), &route.namespace);
        match api.delete(&route.name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(response)) if response.code == 404 => {}
            Err(error) => return Err(error.into()),
        }
        let service_api: Api<Service> =
            Api::namespaced(self.client.clone(), &route.namespace);
        let remote_service = Self::remote_service_name(&key.name);
        match service_api
            .delete(&remote_service, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    fn shutdown(&self) {
        if let Some(handle) = self.refresh_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_remote_host_honors_explicit_port() {
        let backend: RemoteBackend = serde_json::from_value(serde_json::json!({
            "host": "run.beamlit.com:8443",
            "scheme": "https"
        }))
        .unwrap();
        assert_eq!(
            split_remote_host(&backend),
            ("run.beamlit.com".to_string(), 8443)
        );
    }

    #[test]
    fn split_remote_host_defaults_by_scheme() {
        let https: RemoteBackend = serde_json::from_value(serde_json::json!({
            "host": "run.beamlit.com",
            "scheme": "https"
        }))
        .unwrap();
        assert_eq!(split_remote_host(&https).1, 443);
        let http: RemoteBackend = serde_json::from_value(serde_json::json!({
            "host": "run.beamlit.com"
        }))
        .unwrap();
        assert_eq!(split_remote_host(&http).1, 80);
    }

    #[test]
    fn update_auth_header_rewrites_only_the_bearer() {
        let mut manifest = json!({
            "spec": {"rules": [{
                "backendRefs": [
                    {"name": "local", "weight": 50},
                    {"name": "remote", "weight": 50, "filters": [{
                        "type": "RequestHeaderModifier",
                        "requestHeaderModifier": {"set": [
                            {"name": HEADER_MODEL, "value": "llama"},
                            {"name": HEADER_AUTHORIZATION, "value": "Bearer old"},
                        ]}
                    }]}
                ]
            }]}
        });
        assert!(update_auth_header(&mut manifest, "new-token"));
        let set = manifest
            .pointer("/spec/rules/0/backendRefs/1/filters/0/requestHeaderModifier/set")
            .unwrap();
        assert_eq!(set[0]["value"], "llama");
        assert_eq!(set[1]["value"], "Bearer new-token");
    }

    #[test]
    fn update_auth_header_reports_untouched_manifests() {
        let mut manifest = json!({"spec": {"rules": []}});
        assert!(!update_auth_header(&mut manifest, "token"));
    }
}
