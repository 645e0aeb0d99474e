//! Service interception plumbing.
//!
//! Puts the gateway on the data path of a user Service without changing the
//! Service's identity: a shadow service keeps tracking the pods, the
//! original endpoint slices are taken over and emptied, a mirrored slice
//! (minus the serving port) keeps discovery coherent, and the gateway
//! service advertises the user service's cluster-IP and port.

use std::fmt;

use dashmap::DashMap;
use futures_util::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::ObjectMeta;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, ResourceExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::GatewayServiceConfig;
use crate::crd::ServiceReference;

pub const LABEL_SLICE_MANAGED_BY: &str =
    "endpointslice.kubernetes.io/managed-by";
pub const LABEL_SLICE_SERVICE: &str = "kubernetes.io/service-name";
pub const LABEL_TO_UPDATE: &str = "beamlit.com/to-update";
pub const OPERATOR_MANAGER: &str = "beamlit-operator";
pub const DEFAULT_SLICE_CONTROLLER: &str = "endpointslice-controller.k8s.io";

const SHADOW_SUFFIX: &str = "-beamlit";
const MIRRORED_SUFFIX: &str = "-beamlit-mirrored";
const UNCONFIGURE_MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ServiceKey {
    namespace: String,
    name: String,
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigurerError {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
    #[error("target port {1} not found on service {0}")]
    PortNotFound(String, i32),
    #[error("no endpoint slice found for shadow service {0}")]
    NoMirrorSource(String),
    #[error("multiple endpoint slices found for shadow service {0}")]
    AmbiguousMirrorSource(String),
    #[error("no shadow service recorded for {0}")]
    MissingShadow(String),
}

pub struct ServiceConfigurer {
    client: Client,
    gateway: GatewayServiceConfig,
    default_namespace: String,
    shadow_by_service: DashMap<ServiceKey, String>,
    initial_slices: DashMap<ServiceKey, Vec<String>>,
    tasks: DashMap<ServiceKey, Vec<JoinHandle<()>>>,
}

impl ServiceConfigurer {
    pub fn new(
        client: Client,
        gateway: GatewayServiceConfig,
        default_namespace: &str,
    ) -> Self {
        Self {
            client,
            gateway,
            default_namespace: default_namespace.to_string(),
            shadow_by_service: DashMap::new(),
            initial_slices: DashMap::new(),
            tasks: DashMap::new(),
        }
    }

    fn key(&self, service_ref: &ServiceReference) -> ServiceKey {
        ServiceKey {
            namespace: service_ref
                .namespace
                .clone()
                .unwrap_or_else(|| self.default_namespace.clone()),
            name: service_ref.name.clone(),
        }
    }

    /// Returns the shadow backend reference for a configured service, with
    /// the caller's target port carried through.
    pub fn local_shadow(
        &self,
        service_ref: &ServiceReference,
    ) -> Result<ServiceReference, ConfigurerError> {
        let key = self.key(service_ref);
        let shadow = self
            .shadow_by_service
            .get(&key)
            .map(|s| s.clone())
            .ok_or_else(|| ConfigurerError::MissingShadow(key.to_string()))?;
        Ok(ServiceReference {
            namespace: Some(key.namespace),
            name: shadow,
            target_port: service_ref.target_port,
        })
    }

    /// Idempotently installs the interception plumbing for a service.
    #[instrument(skip_all, fields(service = %self.key(service_ref)))]
    pub async fn configure(
        &self,
        service_ref: &ServiceReference,
    ) -> Result<(), ConfigurerError> {
        let key = self.key(service_ref);
        let shadow = self.apply_shadow_service(&key).await?;
        self.admit_on_gateway(&key, service_ref.target_port).await?;
        self.take_over_slices(&key).await?;

        let target_port = shadow
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_ref())
            .and_then(|ports| {
                ports.iter().find(|p| p.port == service_ref.target_port)
            })
            .and_then(|p| match &p.target_port {
                Some(IntOrString::Int(i)) => Some(*i),
                _ => None,
            })
            .ok_or_else(|| {
                ConfigurerError::PortNotFound(
                    key.to_string(),
                    service_ref.target_port,
                )
            })?;

        self.apply_mirrored_slice(&key, target_port).await?;
        self.clean_unused_slices(&key).await?;
        self.spawn_mirror_task(&key, target_port);
        info!("service configured for interception");
        Ok(())
    }

    /// Shadow service: same selector and ports as the original, so its
    /// endpoint slice keeps mirroring the pods after the takeover.
    async fn apply_shadow_service(
        &self,
        key: &ServiceKey,
    ) -> Result<Service, ConfigurerError> {
        let api: Api<Service> =
            Api::namespaced(self.client.clone(), &key.namespace);
        let original = api.get(&key.name).await?;
        let original_spec = original.spec.unwrap_or_default();
        let shadow_name = format!("{}{}", key.name, SHADOW_SUFFIX);

        let shadow = Service {
            metadata: ObjectMeta {
                name: Some(shadow_name.clone()),
                namespace: Some(key.namespace.clone()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: original_spec.selector.clone(),
                ports: original_spec.ports.clone(),
                type_: Some("ClusterIP".to_string()),
                ..Default::default()
            }),
            status: None,
        };
        let applied = api
            .patch(
                &shadow_name,
                &PatchParams::apply(OPERATOR_MANAGER).force(),
                &Patch::Apply(&shadow),
            )
            .await?;
        self.shadow_by_service.insert(key.clone(), shadow_name);
        Ok(applied)
    }

    /// Ensures the gateway service listens on the user service's port and
    /// advertises its cluster-IPs as externalIPs.
    async fn admit_on_gateway(
        &self,
        key: &ServiceKey,
        port: i32,
    ) -> Result<(), ConfigurerError> {
        let gateway_api: Api<Service> =
            Api::namespaced(self.client.clone(), &self.gateway.namespace);
        let mut gateway = gateway_api.get(&self.gateway.name).await?;

        let user_api: Api<Service> =
            Api::namespaced(self.client.clone(), &key.namespace);
        let user = user_api.get(&key.name).await?;
        let user_spec = user.spec.unwrap_or_default();

        let protocol = user_spec
            .ports
            .as_ref()
            .and_then(|ports| ports.iter().find(|p| p.port == port))
            .and_then(|p| p.protocol.clone());

        let spec = gateway.spec.get_or_insert_with(Default::default);
        let ports = spec.ports.get_or_insert_with(Vec::new);
        let already_listening = ports
            .iter()
            .any(|p| p.port == port && p.protocol == protocol);
        if !already_listening {
            ports.push(ServicePort {
                name: Some(format!("{}{}", port, SHADOW_SUFFIX)),
                port,
                protocol: protocol.clone(),
                target_port: Some(IntOrString::Int(self.gateway.port)),
                ..Default::default()
            });
        }

        // additive: other services' stolen IPs must survive
        let external_ips = spec.external_ips.get_or_insert_with(Vec::new);
        for cluster_ip in user_spec.cluster_ips.clone().unwrap_or_default() {
            if cluster_ip != "None" && !external_ips.contains(&cluster_ip) {
                external_ips.push(cluster_ip);
            }
        }

        gateway_api
            .replace(&self.gateway.name, &PostParams::default(), &gateway)
            .await?;
        Ok(())
    }

    /// Relabels the original slices so the default endpoint controller
    /// stops reconciling them, remembering their names for restore.
    async fn take_over_slices(
        &self,
        key: &ServiceKey,
    ) -> Result<(), ConfigurerError> {
        let api: Api<EndpointSlice> =
            Api::namespaced(self.client.clone(), &key.namespace);
        let slices = api
            .list(
                &ListParams::default()
                    .labels(&format!("{LABEL_SLICE_SERVICE}={}", key.name)),
            )
            .await?;

        let mut taken_over = Vec::new();
        for mut slice in slices.items {
            let name = slice.name_any();
            let labels =
                slice.metadata.labels.get_or_insert_with(Default::default);
            if labels.get(LABEL_SLICE_MANAGED_BY).map(String::as_str)
                == Some(OPERATOR_MANAGER)
            {
                continue;
            }
            taken_over.push(name.clone());
            labels.insert(
                LABEL_SLICE_MANAGED_BY.to_string(),
                OPERATOR_MANAGER.to_string(),
            );
            labels
                .insert(LABEL_SLICE_SERVICE.to_string(), key.name.clone());
            api.replace(&name, &PostParams::default(), &slice).await?;
        }
        let mut recorded =
            self.initial_slices.entry(key.clone()).or_default();
        for name in taken_over {
            if !recorded.contains(&name) {
                recorded.push(name);
            }
        }
        Ok(())
    }

    /// Publishes the mirrored slice from the shadow service's slice, minus
    /// the serving target port.
    async fn apply_mirrored_slice(
        &self,
        key: &ServiceKey,
        target_port: i32,
    ) -> Result<(), ConfigurerError> {
        let api: Api<EndpointSlice> =
            Api::namespaced(self.client.clone(), &key.namespace);
        let shadow_name = format!("{}{}", key.name, SHADOW_SUFFIX);
        let slices = api
            .list(
                &ListParams::default()
                    .labels(&format!("{LABEL_SLICE_SERVICE}={shadow_name}")),
            )
            .await?;
        let source = match slices.items.len() {
            0 => {
                return Err(ConfigurerError::NoMirrorSource(
                    key.to_string(),
                ));
            }
            1 => &slices.items[0],
            _ => {
                return Err(ConfigurerError::AmbiguousMirrorSource(
                    key.to_string(),
                ));
            }
        };

        let mirrored =
            mirrored_slice_from(source, &key.namespace, &key.name, target_port);
        let name = mirrored.name_any();
        api.patch(
            &name,
            &PatchParams::apply(OPERATOR_MANAGER).force(),
            &Patch::Apply(&mirrored),
        )
        .await?;
        Ok(())
    }

    /// Empties (but keeps) original slices other than the mirrored one so
    /// roll-back can restore them.
    async fn clean_unused_slices(
        &self,
        key: &ServiceKey,
    ) -> Result<(), ConfigurerError> {
        let api: Api<EndpointSlice> =
            Api::namespaced(self.client.clone(), &key.namespace);
        let slices = api
            .list(
                &ListParams::default()
                    .labels(&format!("{LABEL_SLICE_SERVICE}={}", key.name)),
            )
            .await?;
        let mirrored_name = format!("{}{}", key.name, MIRRORED_SUFFIX);
        for mut slice in slices.items {
            if slice.name_any() == mirrored_name {
                continue;
            }
            let name = slice.name_any();
            slice
                .metadata
                .labels
                .get_or_insert_with(Default::default)
                .insert(
                    LABEL_SLICE_MANAGED_BY.to_string(),
                    OPERATOR_MANAGER.to_string(),
                );
            slice.endpoints.clear();
            slice.ports = None;
            api.replace(&name, &PostParams::default(), &slice).await?;
        }
        Ok(())
    }

    /// Background task republishing the mirrored slice whenever the shadow
    /// service's slice changes.
    fn spawn_mirror_task(&self, key: &ServiceKey, target_port: i32) {
        let client = self.client.clone();
        let key = key.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let api: Api<EndpointSlice> =
                Api::namespaced(client, &key.namespace);
            let shadow_name = format!("{}{}", key.name, SHADOW_SUFFIX);
            let config = watcher::Config::default()
                .labels(&format!("{LABEL_SLICE_SERVICE}={shadow_name}"));
            let mut stream =
                watcher(api.clone(), config).default_backoff().boxed();
            loop {
                match stream.try_next().await {
                    Ok(Some(watcher::Event::Apply(slice)))
                    | Ok(Some(watcher::Event::InitApply(slice))) => {
                        let mirrored = mirrored_slice_from(
                            &slice,
                            &key.namespace,
                            &key.name,
                            target_port,
                        );
                        let name = mirrored.name_any();
                        if let Err(error) = api
                            .patch(
                                &name,
                                &PatchParams::apply(OPERATOR_MANAGER)
                                    .force(),
                                &Patch::Apply(&mirrored),
                            )
                            .await
                        {
                            warn!(%key, %error, "failed to republish mirrored slice");
                        }
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => return,
                    Err(error) => {
                        debug!(%key, %error, "mirror watch error, backing off");
                    }
                }
            }
        });
        self.tasks.entry(task_key).or_default().push(handle);
    }

    /// Inverse of [`configure`](Self::configure): stop mirroring, hand the
    /// original slices back, remove our objects and retract the stolen IPs.
    #[instrument(skip_all, fields(service = %self.key(service_ref)))]
    pub async fn unconfigure(
        &self,
        service_ref: &ServiceReference,
    ) -> Result<(), ConfigurerError> {
        let key = self.key(service_ref);
        if self.shadow_by_service.get(&key).is_none() {
            return Ok(());
        }

        if let Some((_, handles)) = self.tasks.remove(&key) {
            for handle in handles {
                handle.abort();
            }
        }

        self.restore_initial_slices(&key).await?;
        self.delete_owned_slices(&key).await?;
        self.delete_shadow_service(&key).await?;
        self.retract_gateway_ips(&key).await?;
        self.await_slice_repopulation(&key).await;
        self.initial_slices.remove(&key);
        info!("service interception removed");
        Ok(())
    }

    async fn restore_initial_slices(
        &self,
        key: &ServiceKey,
    ) -> Result<(), ConfigurerError> {
        let api: Api<EndpointSlice> =
            Api::namespaced(self.client.clone(), &key.namespace);
        let names = self
            .initial_slices
            .get(key)
            .map(|v| v.clone())
            .unwrap_or_default();
        for name in names {
            let mut slice = match api.get_opt(&name).await? {
                Some(slice) => slice,
                None => continue,
            };
            slice
                .metadata
                .labels
                .get_or_insert_with(Default::default)
                .insert(
                    LABEL_SLICE_MANAGED_BY.to_string(),
                    DEFAULT_SLICE_CONTROLLER.to_string(),
                );
            api.replace(&name, &PostParams::default(), &slice).await?;
        }
        Ok(())
    }

    async fn delete_owned_slices(
        &self,
        key: &ServiceKey,
    ) -> Result<(), ConfigurerError> {
        let api: Api<EndpointSlice> =
            Api::namespaced(self.client.clone(), &key.namespace);
        let slices = api
            .list(
                &ListParams::default()
                    .labels(&format!("{LABEL_SLICE_SERVICE}={}", key.name)),
            )
            .await?;
        let restored = self
            .initial_slices
            .get(key)
            .map(|v| v.clone())
            .unwrap_or_default();
        for slice in slices.items {
            let name = slice.name_any();
            if restored.contains(&name) {
                continue;
            }
            let managed = slice
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(LABEL_SLICE_MANAGED_BY))
                .map(String::as_str)
                == Some(OPERATOR_MANAGER);
            if managed {
                let _ = api.delete(&name, &DeleteParams::default()).await;
            }
        }
        Ok(())
    }

    async fn delete_shadow_service(
        &self,
        key: &ServiceKey,
    ) -> Result<(), ConfigurerError> {
        let Some((_, shadow)) = self.shadow_by_service.remove(key) else {
            return Ok(());
        };
        let api: Api<Service> =
            Api::namespaced(self.client.clone(), &key.namespace);
        match api.delete(&shadow, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    async fn retract_gateway_ips(
        &self,
        key: &ServiceKey,
    ) -> Result<(), ConfigurerError> {
        let gateway_api: Api<Service> =
            Api::namespaced(self.client.clone(), &self.gateway.namespace);
        let mut gateway = gateway_api.get(&self.gateway.name).await?;

        let user_api: Api<Service> =
            Api::namespaced(self.client.clone(), &key.namespace);
        let user_ips = user_api
            .get(&key.name)
            .await?
            .spec
            .and_then(|s| s.cluster_ips)
            .unwrap_or_default();

        if let Some(spec) = gateway.spec.as_mut() {
            if let Some(external_ips) = spec.external_ips.as_mut() {
                external_ips.retain(|ip| !user_ips.contains(ip));
            }
        }
        gateway_api
            .replace(&self.gateway.name, &PostParams::default(), &gateway)
            .await?;
        Ok(())
    }

    /// Bounded wait for the default endpoint controller to repopulate the
    /// restored slices; best-effort, gives up after a few attempts.
    async fn await_slice_repopulation(&self, key: &ServiceKey) {
        let api: Api<EndpointSlice> =
            Api::namespaced(self.client.clone(), &key.namespace);
        let names = self
            .initial_slices
            .get(key)
            .map(|v| v.clone())
            .unwrap_or_default();
        if names.is_empty() {
            return;
        }
        for retry in 1..=UNCONFIGURE_MAX_RETRIES {
            for name in &names {
                if let Ok(Some(slice)) = api.get_opt(name).await {
                    let back_to_default = slice
                        .metadata
                        .labels
                        .as_ref()
                        .and_then(|l| l.get(LABEL_SLICE_MANAGED_BY))
                        .map(String::as_str)
                        == Some(DEFAULT_SLICE_CONTROLLER);
                    if back_to_default && !slice.endpoints.is_empty() {
                        return;
                    }
                }
            }
            let backoff = std::time::Duration::from_millis(
                100 * (1 << (retry - 1)) as u64,
            );
            tokio::time::sleep(backoff).await;
        }
        debug!(%key, "gave up waiting for endpoint slice repopulation");
    }

    pub fn shutdown(&self) {
        for entry in self.tasks.iter() {
            for handle in entry.value() {
                handle.abort();
            }
        }
        self.tasks.clear();
    }
}

#[cfg(test)]
impl ServiceConfigurer {
    /// Seeds the shadow map as if `configure` had run, so callers of
    /// `local_shadow` can be exercised without a cluster.
    pub(crate) fn record_shadow_for_tests(
        &self,
        service_ref: &ServiceReference,
    ) {
        let key = self.key(service_ref);
        let shadow = format!("{}{}", key.name, SHADOW_SUFFIX);
        self.shadow_by_service.insert(key, shadow);
    }
}

/// Builds the mirrored slice for the user service from a shadow-service
/// slice: identical endpoints, ports minus the serving target port.
fn mirrored_slice_from(
    source: &EndpointSlice,
    namespace: &str,
    service: &str,
    target_port: i32,
) -> EndpointSlice {
    let labels = [
        (LABEL_TO_UPDATE.to_string(), "true".to_string()),
        (LABEL_SLICE_SERVICE.to_string(), service.to_string()),
        (
            LABEL_SLICE_MANAGED_BY.to_string(),
            OPERATOR_MANAGER.to_string(),
        ),
    ]
    .into_iter()
    .collect();

    EndpointSlice {
        metadata: ObjectMeta {
            name: Some(format!("{service}{MIRRORED_SUFFIX}")),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        address_type: source.address_type.clone(),
        endpoints: source.endpoints.clone(),
        ports: source.ports.as_ref().map(|ports| {
            ports
                .iter()
                .filter(|p| p.port != Some(target_port))
                .cloned()
                .collect()
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::discovery::v1::{Endpoint, EndpointPort};

    fn source_slice() -> EndpointSlice {
        EndpointSlice {
            metadata: ObjectMeta {
                name: Some("svc-beamlit-abc12".into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            address_type: "IPv4".into(),
            endpoints: vec![Endpoint {
                addresses: vec!["10.1.0.7".into()],
                hostname: Some("pod-a".into()),
                ..Default::default()
            }],
            ports: Some(vec![
                EndpointPort {
                    name: Some("http".into()),
                    port: Some(8080),
                    protocol: Some("TCP".into()),
                    ..Default::default()
                },
                EndpointPort {
                    name: Some("metrics".into()),
                    port: Some(9090),
                    protocol: Some("TCP".into()),
                    ..Default::default()
                },
            ]),
        }
    }

    #[test]
    fn mirrored_slice_drops_the_serving_port() {
        let mirrored =
            mirrored_slice_from(&source_slice(), "default", "svc", 8080);
        assert_eq!(
            mirrored.metadata.name.as_deref(),
            Some("svc-beamlit-mirrored")
        );
        let ports = mirrored.ports.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, Some(9090));
    }

    #[test]
    fn mirrored_slice_targets_the_original_service() {
        let mirrored =
            mirrored_slice_from(&source_slice(), "default", "svc", 8080);
        let labels = mirrored.metadata.labels.unwrap();
        assert_eq!(
            labels.get(LABEL_SLICE_SERVICE).map(String::as_str),
            Some("svc")
        );
        assert_eq!(
            labels.get(LABEL_SLICE_MANAGED_BY).map(String::as_str),
            Some(OPERATOR_MANAGER)
        );
        assert_eq!(
            labels.get(LABEL_TO_UPDATE).map(String::as_str),
            Some("true")
        );
    }

    #[test]
    fn mirrored_slice_copies_endpoints_and_address_type() {
        let mirrored =
            mirrored_slice_from(&source_slice(), "default", "svc", 8080);
        assert_eq!(mirrored.address_type, "IPv4");
        assert_eq!(mirrored.endpoints.len(), 1);
        assert_eq!(mirrored.endpoints[0].addresses, vec!["10.1.0.7"]);
        assert_eq!(
            mirrored.endpoints[0].hostname.as_deref(),
            Some("pod-a")
        );
    }
}
