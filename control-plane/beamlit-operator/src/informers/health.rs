//! Per-model health watchers.
//!
//! Each registered model gets one background task watching its backing
//! workload. The task pushes `(key, healthy)` onto the shared channel on
//! initial sync and on every transition. Unsupported workload kinds emit a
//! single error and the model is never registered.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::{StreamExt, TryStreamExt};
use k8s_openapi::api::apps::v1::{
    DaemonSet, Deployment, ReplicaSet, StatefulSet,
};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{HealthStatus, InformerError};
use crate::controller::index::ModelKey;
use crate::crd::WorkloadReference;
use crate::resources::WorkloadKind;

pub struct HealthInformer {
    client: Client,
    tx: mpsc::Sender<HealthStatus>,
    err_tx: mpsc::Sender<InformerError>,
    watchers: Arc<DashMap<ModelKey, JoinHandle<()>>>,
}

impl HealthInformer {
    pub fn new(
        client: Client,
        tx: mpsc::Sender<HealthStatus>,
        err_tx: mpsc::Sender<InformerError>,
    ) -> Self {
        Self {
            client,
            tx,
            err_tx,
            watchers: Arc::new(DashMap::new()),
        }
    }

    /// Starts (or restarts) the watcher for `key`.
    pub fn register(
        &self,
        key: ModelKey,
        workload: &WorkloadReference,
        default_namespace: &str,
    ) {
        self.unregister(&key);

        let Some(kind) = WorkloadKind::parse(&workload.kind) else {
            let _ = self.err_tx.try_send(InformerError::new(
                key,
                anyhow::anyhow!(
                    "unsupported workload kind: {}",
                    workload.kind
                ),
            ));
            return;
        };

        let ns = workload
            .namespace
            .clone()
            .unwrap_or_else(|| default_namespace.to_string());
        let name = workload.name.clone();
        let tx = self.tx.clone();
        let client = self.client.clone();

        debug!(%key, kind = kind.as_str(), %ns, %name, "health: registering watcher");
        let handle = match kind {
            WorkloadKind::Deployment => tokio::spawn(watch_workload(
                Api::<Deployment>::namespaced(client, &ns),
                name,
                key.clone(),
                deployment_healthy as fn(&Deployment) -> bool,
                tx,
            )),
            WorkloadKind::StatefulSet => tokio::spawn(watch_workload(
                Api::<StatefulSet>::namespaced(client, &ns),
                name,
                key.clone(),
                stateful_set_healthy as fn(&StatefulSet) -> bool,
                tx,
            )),
            WorkloadKind::DaemonSet => tokio::spawn(watch_workload(
                Api::<DaemonSet>::namespaced(client, &ns),
                name,
                key.clone(),
                daemon_set_healthy as fn(&DaemonSet) -> bool,
                tx,
            )),
            WorkloadKind::ReplicaSet => tokio::spawn(watch_workload(
                Api::<ReplicaSet>::namespaced(client, &ns),
                name,
                key.clone(),
                replica_set_healthy as fn(&ReplicaSet) -> bool,
                tx,
            )),
        };
        self.watchers.insert(key, handle);
    }

    /// Stops the watcher for `key` and releases its resources.
    pub fn unregister(&self, key: &ModelKey) {
        if let Some((_, handle)) = self.watchers.remove(key) {
            handle.abort();
        }
    }

    pub fn shutdown(&self) {
        for entry in self.watchers.iter() {
            entry.value().abort();
        }
        self.watchers.clear();
    }
}

/// Watches one workload object and emits health transitions. The watcher
/// stream retries with its default backoff, so transient API failures do
/// not dismantle the watcher.
async fn watch_workload<K>(
    api: Api<K>,
    name: String,
    key: ModelKey,
    healthy: fn(&K) -> bool,
    tx: mpsc::Sender<HealthStatus>,
) where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    K::DynamicType: Hash + Eq + Clone + Default,
{
    let config = watcher::Config::default()
        .fields(&format!("metadata.name={name}"));
    let mut stream = watcher(api, config).default_backoff().boxed();
    let mut last: Option<bool> = None;

    loop {
        match stream.try_next().await {
            Ok(Some(event)) => {
                let current = match event {
                    watcher::Event::Apply(obj)
                    | watcher::Event::InitApply(obj) => healthy(&obj),
                    // a deleted workload has no ready replicas
                    watcher::Event::Delete(_) => false,
                    watcher::Event::Init | watcher::Event::InitDone => {
                        continue;
                    }
                };
                if last != Some(current) {
                    last = Some(current);
                    if tx
                        .send(HealthStatus {
                            key: key.clone(),
                            healthy: current,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
            Ok(None) => return,
            Err(error) => {
                debug!(%key, %error, "health: watch stream error, backing off");
            }
        }
    }
}

fn deployment_healthy(workload: &Deployment) -> bool {
    workload
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0)
        > 0
}

fn stateful_set_healthy(workload: &StatefulSet) -> bool {
    workload
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0)
        > 0
}

fn daemon_set_healthy(workload: &DaemonSet) -> bool {
    workload.status.as_ref().map(|s| s.number_ready).unwrap_or(0) > 0
}

/// ReplicaSets are healthy only when fully rolled out.
fn replica_set_healthy(workload: &ReplicaSet) -> bool {
    let Some(status) = workload.status.as_ref() else {
        return false;
    };
    status.replicas == status.ready_replicas.unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{
        DaemonSetStatus, DeploymentStatus, ReplicaSetStatus,
        StatefulSetStatus,
    };

    #[test]
    fn deployment_healthy_needs_a_ready_replica() {
        let mut workload = Deployment::default();
        assert!(!deployment_healthy(&workload));
        workload.status = Some(DeploymentStatus {
            ready_replicas: Some(0),
            ..Default::default()
        });
        assert!(!deployment_healthy(&workload));
        workload.status.as_mut().unwrap().ready_replicas = Some(1);
        assert!(deployment_healthy(&workload));
    }

    #[test]
    fn stateful_set_healthy_needs_a_ready_replica() {
        let mut workload = StatefulSet::default();
        workload.status = Some(StatefulSetStatus {
            ready_replicas: Some(2),
            ..Default::default()
        });
        assert!(stateful_set_healthy(&workload));
    }

    #[test]
    fn daemon_set_healthy_needs_a_ready_pod() {
        let mut workload = DaemonSet::default();
        workload.status = Some(DaemonSetStatus {
            number_ready: 0,
            ..Default::default()
        });
        assert!(!daemon_set_healthy(&workload));
        workload.status.as_mut().unwrap().number_ready = 3;
        assert!(daemon_set_healthy(&workload));
    }

    #[test]
    fn replica_set_healthy_requires_full_rollout() {
        let mut workload = ReplicaSet::default();
        assert!(!replica_set_healthy(&workload));
        workload.status = Some(ReplicaSetStatus {
            replicas: 3,
            ready_replicas: Some(2),
            ..Default::default()
        });
        assert!(!replica_set_healthy(&workload));
        workload.status.as_mut().unwrap().ready_replicas = Some(3);
        assert!(replica_set_healthy(&workload));
    }

    #[test]
    fn replica_set_zero_of_zero_is_healthy_by_strict_rule() {
        // 0 == 0 ready: the strict rollout predicate accepts an empty set.
        let mut workload = ReplicaSet::default();
        workload.status = Some(ReplicaSetStatus {
            replicas: 0,
            ready_replicas: Some(0),
            ..Default::default()
        });
        assert!(replica_set_healthy(&workload));
    }
}
