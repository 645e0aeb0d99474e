//! Embedded-gateway actuator.
//!
//! Publishes routes through the proxy's admin REST API. The route carries
//! the OAuth credentials verbatim; the gateway itself obtains and refreshes
//! bearer tokens at request time.

use std::collections::BTreeMap;

use async_trait::async_trait;
use beamlit_routes::{Auth, AuthType, Backend, OAuth, Route};
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Service;
use kube::{Api, Client};
use tracing::{debug, instrument};

use super::{
    HEADER_MODEL, HEADER_WORKSPACE, OffloadError, Offloader,
    expand_path_prefix, route_hostnames,
};
use crate::controller::index::ModelKey;
use crate::crd::model_deployment::AuthType as CrdAuthType;
use crate::crd::{ModelDeployment, RemoteBackend, ServiceReference};

pub struct BeamlitGatewayOffloader {
    client: Client,
    http: reqwest::Client,
    admin_base: String,
    default_namespace: String,
    managed_routes: DashMap<ModelKey, String>,
}

impl BeamlitGatewayOffloader {
    pub fn new(
        client: Client,
        admin_base: &str,
        default_namespace: &str,
    ) -> Self {
        Self {
            client,
            http: reqwest::Client::new(),
            admin_base: admin_base.trim_end_matches('/').to_string(),
            default_namespace: default_namespace.to_string(),
            managed_routes: DashMap::new(),
        }
    }

    fn routes_url(&self) -> String {
        format!("{}/v1alpha1/routes", self.admin_base)
    }

    fn route_url(&self, name: &str) -> String {
        format!("{}/v1alpha1/routes/{name}", self.admin_base)
    }

    fn build_route(
        model: &ModelDeployment,
        service: &Service,
        local_backend: &ServiceReference,
        remote_backend: &RemoteBackend,
        remote_percent: i32,
        default_namespace: &str,
    ) -> Route {
        let model_name = model
            .metadata
            .name
            .clone()
            .unwrap_or_else(|| model.spec.model.clone());
        let workspace = model
            .status
            .as_ref()
            .and_then(|s| s.workspace.clone())
            .unwrap_or_default();

        let local_namespace = local_backend
            .namespace
            .clone()
            .unwrap_or_else(|| default_namespace.to_string());
        let local = Backend {
            host: format!(
                "{}.{}.svc.cluster.local:{}",
                local_backend.name, local_namespace, local_backend.target_port
            ),
            weight: 100 - remote_percent,
            auth: None,
            path_prefix: String::new(),
            headers_to_add: BTreeMap::new(),
            scheme: "http".to_string(),
        };

        let mut headers = remote_backend.headers_to_add.clone();
        headers.insert(HEADER_MODEL.to_string(), model.spec.model.clone());
        headers.insert(HEADER_WORKSPACE.to_string(), workspace.clone());

        let auth = remote_backend.auth_config.as_ref().map(|config| Auth {
            auth_type: match config.auth_type {
                CrdAuthType::OAuth => AuthType::OAuth,
            },
            oauth: config.oauth_config.as_ref().map(|oauth| OAuth {
                client_id: oauth.client_id.clone(),
                client_secret: oauth.client_secret.clone(),
                token_url: oauth.token_url.clone(),
            }),
        });

        let remote = Backend {
            host: remote_backend.host.clone(),
            weight: remote_percent,
            auth,
            path_prefix: expand_path_prefix(
                &remote_backend.path_prefix,
                &workspace,
                &model.spec.model,
            ),
            headers_to_add: headers,
            scheme: remote_backend.scheme.as_str().to_string(),
        };

        Route {
            name: model_name,
            hostnames: route_hostnames(service),
            backends: vec![local, remote],
        }
    }

    async fn check(
        response: reqwest::Response,
    ) -> Result<(), OffloadError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(OffloadError::AdminStatus { status, body })
    }
}

#[async_trait]
impl Offloader for BeamlitGatewayOffloader {
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
        let api: Api<Service> =
            Api::namespaced(self.client.clone(), &namespace);
        let service = api.get(&service_ref.name).await?;

        let route = Self::build_route(
            model,
            &service,
            local_backend,
            remote_backend,
            remote_percent,
            &self.default_namespace,
        );
        let key = ModelKey::new(
            model.metadata.namespace.as_deref().unwrap_or("default"),
            model.metadata.name.as_deref().unwrap_or(""),
        );

        let response = if self.managed_routes.contains_key(&key) {
            debug!(route = %route.name, "gateway admin: updating route");
            self.http
                .put(self.route_url(&route.name))
                .json(&route)
                .send()
                .await?
        } else {
            debug!(route = %route.name, "gateway admin: registering route");
            self.http
                .post(self.routes_url())
                .json(&route)
                .send()
                .await?
        };
        Self::check(response).await?;
        self.managed_routes.insert(key, route.name);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn cleanup(&self, key: &ModelKey) -> Result<(), OffloadError> {
        let Some((_, route_name)) = self.managed_routes.remove(key) else {
            return Ok(());
        };
        let response = self
            .http
            .delete(self.route_url(&route_name))
            .send()
            .await?;
        if response.status() == http::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response).await
    }

    fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ServiceSpec;
    use kube::core::ObjectMeta;

    fn model(percent_status_workspace: Option<&str>) -> ModelDeployment {
        let mut model = ModelDeployment::new(
            "my-model",
            serde_json::from_value(serde_json::json!({
                "model": "llama",
                "modelSourceRef": {"kind": "Deployment", "name": "llama"},
                "serviceRef": {"name": "svc", "targetPort": 80},
            }))
            .unwrap(),
        );
        model.metadata = ObjectMeta {
            name: Some("my-model".into()),
            namespace: Some("ml".into()),
            ..Default::default()
        };
        if let Some(workspace) = percent_status_workspace {
            model.status = Some(crate::crd::ModelDeploymentStatus {
                workspace: Some(workspace.into()),
                ..Default::default()
            });
        }
        model
    }

    fn service() -> Service {
        Service {
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
        }
    }

    fn local_backend() -> ServiceReference {
        ServiceReference {
            namespace: Some("ml".into()),
            name: "svc-beamlit".into(),
            target_port: 80,
        }
    }

    fn remote_backend() -> RemoteBackend {
        serde_json::from_value(serde_json::json!({
            "host": "run.beamlit.com",
            "scheme": "https",
            "pathPrefix": "/$workspace/models/$model",
            "headersToAdd": {"X-Env": "prod"},
            "authConfig": {
                "type": "oauth",
                "oauthConfig": {
                    "clientId": "id",
                    "clientSecret": "secret",
                    "tokenUrl": "https://api.beamlit.com/v0/oauth/token"
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn route_splits_weight_between_local_and_remote() {
        let route = BeamlitGatewayOffloader::build_route(
            &model(Some("acme")),
            &service(),
            &local_backend(),
            &remote_backend(),
            30,
            "default",
        );
        assert_eq!(route.name, "my-model");
        assert_eq!(route.backends.len(), 2);
        assert_eq!(
            route.backends[0].host,
            "svc-beamlit.ml.svc.cluster.local:80"
        );
        assert_eq!(route.backends[0].weight, 70);
        assert_eq!(route.backends[1].weight, 30);
        assert_eq!(route.hostnames[0], "10.0.0.5");
    }

    #[test]
    fn zero_percent_keeps_the_remote_backend_listed() {
        let route = BeamlitGatewayOffloader::build_route(
            &model(Some("acme")),
            &service(),
            &local_backend(),
            &remote_backend(),
            0,
            "default",
        );
        assert_eq!(route.backends[0].weight, 100);
        assert_eq!(route.backends[1].weight, 0);
        assert_eq!(route.backends[1].host, "run.beamlit.com");
    }

    #[test]
    fn remote_backend_carries_identity_headers_and_expanded_prefix() {
        let route = BeamlitGatewayOffloader::build_route(
            &model(Some("acme")),
            &service(),
            &local_backend(),
            &remote_backend(),
            50,
            "default",
        );
        let remote = &route.backends[1];
        assert_eq!(remote.path_prefix, "/acme/models/llama");
        assert_eq!(
            remote.headers_to_add.get(HEADER_MODEL).map(String::as_str),
            Some("llama")
        );
        assert_eq!(
            remote
                .headers_to_add
                .get(HEADER_WORKSPACE)
                .map(String::as_str),
            Some("acme")
        );
        assert_eq!(
            remote.headers_to_add.get("X-Env").map(String::as_str),
            Some("prod")
        );
        let oauth = remote.auth.as_ref().unwrap().oauth.as_ref().unwrap();
        assert_eq!(oauth.client_id, "id");
    }

    #[test]
    fn missing_workspace_expands_to_empty() {
        let route = BeamlitGatewayOffloader::build_route(
            &model(None),
            &service(),
            &local_backend(),
            &remote_backend(),
            50,
            "default",
        );
        assert_eq!(route.backends[1].path_prefix, "//models/llama");
    }
}
