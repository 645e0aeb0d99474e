//! Per-model metric watchers.
//!
//! Each registered model gets a poll task that scrapes its configured
//! metrics at a fixed interval, feeds the sustained-window tracker and
//! emits `(key, reached)` transitions. Metric-backend hiccups surface on
//! the error channel without dismantling the watcher.

pub mod backend;
pub mod condition;
pub mod evaluate;

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use k8s_openapi::api::apps::v1::{
    DaemonSet, Deployment, ReplicaSet, StatefulSet,
};
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use self::backend::{MetricError, MetricsBackend};
use self::condition::ConditionTracker;
use self::evaluate::{is_target_reached, is_utilization_reached};
use super::{InformerError, MetricStatus};
use crate::controller::index::ModelKey;
use crate::crd::metrics::{MetricSourceType, MetricTargetType};
use crate::crd::{MetricSpec, WorkloadReference};
use crate::resources::WorkloadKind;

pub struct MetricInformer {
    client: Client,
    backend: Arc<dyn MetricsBackend>,
    tx: mpsc::Sender<MetricStatus>,
    err_tx: mpsc::Sender<InformerError>,
    watchers: DashMap<ModelKey, JoinHandle<()>>,
}

impl MetricInformer {
    pub fn new(
        client: Client,
        backend: Arc<dyn MetricsBackend>,
        tx: mpsc::Sender<MetricStatus>,
        err_tx: mpsc::Sender<InformerError>,
    ) -> Self {
        Self {
            client,
            backend,
            tx,
            err_tx,
            watchers: DashMap::new(),
        }
    }

    /// Starts (or restarts) polling for `key`.
    pub fn register(
        &self,
        key: ModelKey,
        metrics: Vec<MetricSpec>,
        workload: &WorkloadReference,
        default_namespace: &str,
        scrape_interval: Duration,
        window: Duration,
    ) {
        self.unregister(&key);
        let watcher = MetricWatcher {
            client: self.client.clone(),
            backend: self.backend.clone(),
            key: key.clone(),
            metrics,
            workload: workload.clone(),
            namespace: workload
                .namespace
                .clone()
                .unwrap_or_else(|| default_namespace.to_string()),
            scrape_interval,
            tracker: ConditionTracker::new(window),
            tx: self.tx.clone(),
            err_tx: self.err_tx.clone(),
        };
        debug!(%key, interval = ?scrape_interval, window = ?window, "metric: registering watcher");
        self.watchers.insert(key, tokio::spawn(watcher.run()));
    }

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

struct MetricWatcher {
    client: Client,
    backend: Arc<dyn MetricsBackend>,
    key: ModelKey,
    metrics: Vec<MetricSpec>,
    workload: WorkloadReference,
    namespace: String,
    scrape_interval: Duration,
    tracker: ConditionTracker,
    tx: mpsc::Sender<MetricStatus>,
    err_tx: mpsc::Sender<InformerError>,
}

impl MetricWatcher {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.scrape_interval);
        ticker.set_missed_tick_behavior(
            tokio::time::MissedTickBehavior::Delay,
        );
        // the seed state is "not reached"; only transitions are emitted
        let mut last_sent = Some(false);
        loop {
            ticker.tick().await;
            match self.scrape_once().await {
                Ok(()) => {
                    let reached = self.tracker.is_reached(Instant::now());
                    if last_sent != Some(reached) {
                        last_sent = Some(reached);
                        if self
                            .tx
                            .send(MetricStatus {
                                key: self.key.clone(),
                                reached,
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
                Err(error) => {
                    // transient backend failure: report, keep the watcher
                    let _ = self
                        .err_tx
                        .send(InformerError::new(self.key.clone(), error))
                        .await;
                }
            }
        }
    }

    /// One scrape pass: refresh replica/selector info and update the
    /// tracker for every configured metric.
    async fn scrape_once(&mut self) -> Result<(), anyhow::Error> {
        let (replicas, selector) = scale_info(
            self.client.clone(),
            &self.workload,
            &self.namespace,
        )
        .await?;
        let now = Instant::now();

        let metrics = self.metrics.clone();
        if replicas == 0 {
            for metric in &metrics {
                self.tracker.update(metric, false, now);
            }
            return Ok(());
        }

        let mut first_error: Option<anyhow::Error> = None;
        for metric in &metrics {
            match self.evaluate_metric(metric, replicas, &selector).await {
                Ok(reached) => self.tracker.update(metric, reached, now),
                // an empty result set only means this metric is quiet
                Err(MetricError::NoMetrics) => {
                    self.tracker.update(metric, false, now)
                }
                Err(error) => {
                    if first_error.is_none() {
                        first_error = Some(error.into());
                    }
                }
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn evaluate_metric(
        &self,
        metric: &MetricSpec,
        replicas: i32,
        pod_selector: &str,
    ) -> Result<bool, MetricError> {
        match metric.source {
            MetricSourceType::Resource => {
                let source = metric.resource.as_ref().ok_or(
                    MetricError::Malformed("resource source missing".into()),
                )?;
                let usage = self
                    .backend
                    .resource_usage(
                        &self.namespace,
                        source.name,
                        pod_selector,
                        None,
                    )
                    .await?;
                if source.target.target_type == MetricTargetType::Utilization
                {
                    let target_pct =
                        source.target.average_utilization.ok_or(
                            MetricError::Malformed(
                                "averageUtilization missing".into(),
                            ),
                        )?;
                    let requested = requested_milli(
                        self.client.clone(),
                        &self.namespace,
                        pod_selector,
                        source.name.as_str(),
                    )
                    .await?;
                    Ok(is_utilization_reached(
                        &usage, requested, replicas, target_pct,
                    ))
                } else {
                    is_target_reached(&source.target, replicas, &usage)
                        .map_err(|e| MetricError::Malformed(e.to_string()))
                }
            }
            MetricSourceType::ContainerResource => {
                let source = metric.container_resource.as_ref().ok_or(
                    MetricError::Malformed(
                        "containerResource source missing".into(),
                    ),
                )?;
                let usage = self
                    .backend
                    .resource_usage(
                        &self.namespace,
                        source.name,
                        pod_selector,
                        Some(&source.container),
                    )
                    .await?;
                is_target_reached(&source.target, replicas, &usage)
                    .map_err(|e| MetricError::Malformed(e.to_string()))
            }
            MetricSourceType::Pods => {
                let source = metric.pods.as_ref().ok_or(
                    MetricError::Malformed("pods source missing".into()),
                )?;
                let metric_selector = source
                    .metric
                    .selector
                    .as_ref()
                    .map(|s| s.to_query());
                let usage = self
                    .backend
                    .pod_metric(
                        &self.namespace,
                        &source.metric.name,
                        pod_selector,
                        metric_selector.as_deref(),
                    )
                    .await?;
                is_target_reached(&source.target, replicas, &usage)
                    .map_err(|e| MetricError::Malformed(e.to_string()))
            }
            MetricSourceType::Object => {
                let source = metric.object.as_ref().ok_or(
                    MetricError::Malformed("object source missing".into()),
                )?;
                let metric_selector = source
                    .metric
                    .selector
                    .as_ref()
                    .map(|s| s.to_query());
                let usage = self
                    .backend
                    .object_metric(
                        &self.namespace,
                        &source.described_object,
                        &source.metric.name,
                        metric_selector.as_deref(),
                    )
                    .await?;
                is_target_reached(&source.target, replicas, &[usage])
                    .map_err(|e| MetricError::Malformed(e.to_string()))
            }
            MetricSourceType::External => {
                let source = metric.external.as_ref().ok_or(
                    MetricError::Malformed("external source missing".into()),
                )?;
                let metric_selector = source
                    .metric
                    .selector
                    .as_ref()
                    .map(|s| s.to_query());
                let usage = self
                    .backend
                    .external_metric(
                        &self.namespace,
                        &source.metric.name,
                        metric_selector.as_deref(),
                    )
                    .await?;
                is_target_reached(&source.target, replicas, &usage)
                    .map_err(|e| MetricError::Malformed(e.to_string()))
            }
        }
    }
}

/// Reads the scale subresource of the workload: replica count plus the pod
/// selector used to scope metric retrieval.
async fn scale_info(
    client: Client,
    workload: &WorkloadReference,
    namespace: &str,
) -> Result<(i32, String), anyhow::Error> {
    let kind = WorkloadKind::parse(&workload.kind).ok_or_else(|| {
        anyhow::anyhow!("unsupported workload kind: {}", workload.kind)
    })?;
    let scale = match kind {
        WorkloadKind::Deployment => {
            Api::<Deployment>::namespaced(client, namespace)
                .get_scale(&workload.name)
                .await?
        }
        WorkloadKind::StatefulSet => {
            Api::<StatefulSet>::namespaced(client, namespace)
                .get_scale(&workload.name)
                .await?
        }
        WorkloadKind::DaemonSet => {
            Api::<DaemonSet>::namespaced(client, namespace)
                .get_scale(&workload.name)
                .await?
        }
        WorkloadKind::ReplicaSet => {
            Api::<ReplicaSet>::namespaced(client, namespace)
                .get_scale(&workload.name)
                .await?
        }
    };
    let status = scale
        .status
        .ok_or_else(|| anyhow::anyhow!("scale has no status"))?;
    let selector = status
        .selector
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow::anyhow!("scale has no selector"))?;
    Ok((status.replicas, selector))
}

/// Sums the requested amount of `resource` over the selected pods'
/// containers, in milli-units.
async fn requested_milli(
    client: Client,
    namespace: &str,
    pod_selector: &str,
    resource: &str,
) -> Result<i64, MetricError> {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    let pods = api
        .list(&ListParams::default().labels(pod_selector))
        .await?;
    let mut total = 0_i64;
    for pod in pods.items {
        let containers = pod.spec.map(|s| s.containers).unwrap_or_default();
        for container in containers {
            let Some(requests) =
                container.resources.and_then(|r| r.requests)
            else {
                continue;
            };
            if let Some(quantity) = requests.get(resource) {
                total += crate::crd::metrics::parse_quantity_milli(
                    &quantity.0,
                )
                .unwrap_or(0);
            }
        }
    }
    Ok(total)
}
