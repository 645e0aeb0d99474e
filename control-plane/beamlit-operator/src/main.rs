use std::path::PathBuf;
use std::sync::Arc;

use kube::Client;
use tokio::sync::mpsc;
use tokio::try_join;
use tracing::info;

use beamlit_operator::beamlit::{self, BeamlitToken};
use beamlit_operator::config::{ActuatorKind, MetricsBackendKind, OperatorConfig};
use beamlit_operator::controller::policy::PolicyContext;
use beamlit_operator::controller::{self, ControllerContext, index::Indexes};
use beamlit_operator::dataplane::configurer::ServiceConfigurer;
use beamlit_operator::dataplane::offloader::beamlit_gateway::BeamlitGatewayOffloader;
use beamlit_operator::dataplane::offloader::gateway_api::GatewayApiOffloader;
use beamlit_operator::dataplane::offloader::Offloader;
use beamlit_operator::informers::health::HealthInformer;
use beamlit_operator::informers::metric::backend::{
    ClusterMetricsBackend, MetricsBackend, PrometheusBackend,
};
use beamlit_operator::informers::metric::MetricInformer;
use beamlit_operator::{init_tracing, informers, web};

const DEFAULT_NAMESPACE: &str = "default";
const INFORMER_CHANNEL_CAPACITY: usize = 64;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");

    let config = match std::env::args().nth(1) {
        Some(path) => OperatorConfig::from_file(&PathBuf::from(path))?,
        None => OperatorConfig::default(),
    };
    config.validate()?;
    info!(?config, "starting beamlit operator");
    if config.enable_leader_election.unwrap_or(false) {
        info!("leader election requested; relying on single-replica deployment topology");
    }

    let client = Client::try_default().await?;
    let registry = beamlit::Client::from_env()?;
    let token = Arc::new(BeamlitToken::from_env()?);

    let (health_tx, health_rx) = mpsc::channel(INFORMER_CHANNEL_CAPACITY);
    let (metric_tx, metric_rx) = mpsc::channel(INFORMER_CHANNEL_CAPACITY);
    let (err_tx, err_rx) = mpsc::channel(INFORMER_CHANNEL_CAPACITY);

    let metrics_backend: Arc<dyn MetricsBackend> = match config.metrics_backend
    {
        MetricsBackendKind::Cluster => {
            Arc::new(ClusterMetricsBackend::new(client.clone()))
        }
        MetricsBackendKind::Prometheus => Arc::new(PrometheusBackend::new(
            config.prometheus_url.as_deref().unwrap_or_default(),
        )),
    };

    let offloader: Arc<dyn Offloader> = match config.actuator {
        ActuatorKind::Embedded => Arc::new(BeamlitGatewayOffloader::new(
            client.clone(),
            &config.gateway_admin_base(),
            DEFAULT_NAMESPACE,
        )),
        ActuatorKind::GatewayApi => GatewayApiOffloader::new(
            client.clone(),
            &config.gateway_service.namespace,
            &config.gateway_service.name,
            DEFAULT_NAMESPACE,
            token.clone(),
        ),
    };

    let ctx = Arc::new(ControllerContext {
        client: client.clone(),
        configurer: ServiceConfigurer::new(
            client.clone(),
            config.gateway_service.clone(),
            DEFAULT_NAMESPACE,
        ),
        offloader,
        health: HealthInformer::new(
            client.clone(),
            health_tx,
            err_tx.clone(),
        ),
        metric: MetricInformer::new(
            client.clone(),
            metrics_backend,
            metric_tx,
            err_tx,
        ),
        indexes: Indexes::new(),
        registry,
        config,
        default_namespace: DEFAULT_NAMESPACE.to_string(),
    });

    let probe_addr = web::parse_bind_addr(ctx.config.probe_addr())?;
    let metrics_addr = web::parse_bind_addr(ctx.config.metrics_addr())?;

    let fusion_ctx = ctx.clone();
    let fusion = tokio::spawn(async move {
        controller::fusion::run_fusion_loop(fusion_ctx, health_rx, metric_rx)
            .await;
        Ok::<_, anyhow::Error>(())
    });
    let errors = tokio::spawn(async move {
        informers::log_informer_errors(err_rx).await;
        Ok::<_, anyhow::Error>(())
    });
    let policy_ctx = Arc::new(PolicyContext::new(
        client.clone(),
        beamlit::Client::from_env()?,
    ));
    let policies = tokio::spawn(async move {
        controller::policy::run_policy_controller(policy_ctx).await
    });
    let models = {
        let ctx = ctx.clone();
        tokio::spawn(async move { controller::run_controller(ctx).await })
    };
    let probes =
        tokio::spawn(async move { web::run_probe_server(probe_addr).await });
    let metrics = tokio::spawn(async move {
        web::run_metrics_server(metrics_addr).await
    });

    let (models, policies, fusion, errors, probes, metrics) =
        try_join!(models, policies, fusion, errors, probes, metrics)?;
    models?;
    policies?;
    fusion?;
    errors?;
    probes?;
    metrics?;
    Ok(())
}
