pub mod fusion;
pub mod index;
pub mod policy;
pub mod reconcile;

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use kube::runtime::controller::Action;
use kube::runtime::{Controller, watcher::Config};
use kube::{Api, Client};
use tracing::{error, info};

use crate::beamlit::RegistryError;
use crate::config::OperatorConfig;
use crate::crd::ModelDeployment;
use crate::dataplane::configurer::{ConfigurerError, ServiceConfigurer};
use crate::dataplane::offloader::{OffloadError, Offloader};
use crate::informers::health::HealthInformer;
use crate::informers::metric::MetricInformer;
use crate::resources::ResourceError;
use index::Indexes;

#[derive(thiserror::Error, Debug)]
pub enum ReconcileErr {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("resource resolution error: {0}")]
    Resource(#[from] ResourceError),
    #[error("configurer error: {0}")]
    Configurer(#[from] ConfigurerError),
    #[error("offload error: {0}")]
    Offload(#[from] OffloadError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ReconcileErr {
    /// Optimistic-concurrency failures get a fast requeue instead of the
    /// error backoff.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ReconcileErr::Kube(kube::Error::Api(response)) if response.code == 409
        )
    }
}

pub struct ControllerContext {
    pub client: Client,
    pub config: OperatorConfig,
    pub registry: crate::beamlit::Client,
    pub configurer: ServiceConfigurer,
    pub offloader: Arc<dyn Offloader>,
    pub health: HealthInformer,
    pub metric: MetricInformer,
    pub indexes: Indexes,
    pub default_namespace: String,
}

impl ControllerContext {
    pub fn scrape_interval(&self) -> Duration {
        Duration::from_secs(self.config.scrape_interval_secs)
    }

    pub fn metric_window(&self) -> Duration {
        Duration::from_secs(self.config.metric_window_secs)
    }
}

/// Runs the ModelDeployment controller until the root context is cancelled.
/// The platform guarantees one in-flight reconcile per key; cross-key work
/// proceeds in parallel.
pub async fn run_controller(ctx: Arc<ControllerContext>) -> anyhow::Result<()> {
    let namespaces = ctx.config.namespace_list();
    let api: Api<ModelDeployment> = match namespaces.as_slice() {
        [single] => Api::namespaced(ctx.client.clone(), single),
        _ => Api::all(ctx.client.clone()),
    };
    if namespaces.len() > 1 {
        info!(
            ?namespaces,
            "multiple watch namespaces configured; watching cluster-wide"
        );
    }

    Controller::new(api, Config::default())
        .run(reconcile::reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((_ref, action)) => {
                    tracing::debug!("reconciled: requeue={:?}", action)
                }
                Err(e) => error!(error = ?e, "reconcile error"),
            }
        })
        .await;

    Ok(())
}

fn error_policy(
    _obj: Arc<ModelDeployment>,
    error: &ReconcileErr,
    _ctx: Arc<ControllerContext>,
) -> Action {
    if error.is_conflict() {
        Action::requeue(Duration::from_secs(1))
    } else {
        Action::requeue(Duration::from_secs(60))
    }
}
