//! Event fusion.
//!
//! Consumes the health and metric channels concurrently with reconciliation
//! and turns them into actuation decisions. Health dominates: an unhealthy
//! model is pinned at 100% offload and metric events are dropped until
//! health returns.

use std::sync::Arc;

use kube::{Api, ResourceExt};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::index::ModelKey;
use super::reconcile::{effective_offloading, patch_offloading_status};
use super::{ControllerContext, ReconcileErr};
use crate::crd::{ModelDeployment, OffloadingConfig};
use crate::informers::{HealthStatus, MetricStatus};

/// Drains both informer channels until they close. Must run continuously:
/// informer sends are only bounded by this consumer.
pub async fn run_fusion_loop(
    ctx: Arc<ControllerContext>,
    mut health_rx: mpsc::Receiver<HealthStatus>,
    mut metric_rx: mpsc::Receiver<MetricStatus>,
) {
    loop {
        tokio::select! {
            status = health_rx.recv() => match status {
                Some(status) => {
                    if let Err(error) = handle_health(&ctx, &status).await {
                        warn!(key = %status.key, %error, "health actuation failed");
                    }
                }
                None => return,
            },
            status = metric_rx.recv() => match status {
                Some(status) => {
                    if let Err(error) = handle_metric(&ctx, &status).await {
                        warn!(key = %status.key, %error, "metric actuation failed");
                    }
                }
                None => return,
            },
        }
    }
}

async fn fetch_model(
    ctx: &ControllerContext,
    key: &ModelKey,
) -> Result<Option<ModelDeployment>, ReconcileErr> {
    let api: Api<ModelDeployment> =
        Api::namespaced(ctx.client.clone(), &key.namespace);
    Ok(api.get_opt(&key.name).await?)
}

#[instrument(skip(ctx), fields(key = %status.key, healthy = status.healthy))]
pub(crate) async fn handle_health(
    ctx: &ControllerContext,
    status: &HealthStatus,
) -> Result<(), ReconcileErr> {
    let key = &status.key;
    if ctx.indexes.managed(key).is_none() {
        return Ok(());
    }
    let lock = ctx.indexes.lock_for(key);
    let _guard = lock.lock().await;

    let Some(model) = fetch_model(ctx, key).await? else {
        return Ok(());
    };
    let Some(offloading) = effective_offloading(&model, ctx) else {
        return Ok(());
    };

    if !status.healthy {
        // unconditional: unhealthy forces everything to the remote
        info!("workload unhealthy, offloading 100%");
        offload_to(ctx, &model, key, &offloading, 100).await?;
        ctx.indexes.set_model_state(key, false);
        ctx.indexes.set_managed_health(key, false);
        return Ok(());
    }

    ctx.indexes.set_managed_health(key, true);
    let configured = offloading.percentage();
    if ctx.indexes.ongoing_offloading(key) != Some(configured) {
        info!(percent = configured, "workload healthy, restoring configured split");
        offload_to(ctx, &model, key, &offloading, configured).await?;
    }
    ctx.indexes.set_model_state(key, true);
    Ok(())
}

#[instrument(skip(ctx), fields(key = %status.key, reached = status.reached))]
pub(crate) async fn handle_metric(
    ctx: &ControllerContext,
    status: &MetricStatus,
) -> Result<(), ReconcileErr> {
    let key = &status.key;
    // health dominates: drop metric signals while the model is unhealthy
    if ctx.indexes.model_state(key) != Some(true) {
        debug!("model gated unhealthy; dropping metric event");
        return Ok(());
    }
    let Some(current) = ctx.indexes.ongoing_offloading(key) else {
        return Ok(());
    };
    let lock = ctx.indexes.lock_for(key);
    let _guard = lock.lock().await;

    let Some(model) = fetch_model(ctx, key).await? else {
        return Ok(());
    };
    let Some(offloading) = effective_offloading(&model, ctx) else {
        return Ok(());
    };
    let configured = offloading.percentage();

    if !status.reached {
        if current != 0 {
            info!("metric condition cleared, offloading back to 0%");
            offload_to(ctx, &model, key, &offloading, 0).await?;
        }
        return Ok(());
    }
    if current != configured {
        info!(percent = configured, "metric condition sustained, offloading");
        offload_to(ctx, &model, key, &offloading, configured).await?;
    }
    Ok(())
}

/// Publishes the weighted route at `percent` and updates the bookkeeping.
/// Registry notification and status flips are best-effort.
async fn offload_to(
    ctx: &ControllerContext,
    model: &ModelDeployment,
    key: &ModelKey,
    offloading: &OffloadingConfig,
    percent: i32,
) -> Result<(), ReconcileErr> {
    let service_ref = model.spec.service_ref.as_ref().ok_or_else(|| {
        ReconcileErr::Internal("model has no serviceRef".to_string())
    })?;
    let remote_backend = offloading.remote_backend.as_ref().ok_or_else(|| {
        ReconcileErr::Internal("model has no remote backend".to_string())
    })?;

    let local_backend = ctx.configurer.local_shadow(service_ref)?;
    ctx.offloader
        .configure(model, &local_backend, remote_backend, percent)
        .await?;

    let previous = ctx.indexes.ongoing_offloading(key).unwrap_or(0);
    ctx.indexes.set_ongoing_offloading(key, percent);

    if (previous == 0) != (percent == 0) {
        patch_offloading_status(ctx, key, percent != 0).await;
        if let Err(error) = ctx
            .registry
            .notify_offloading(
                &model.spec.model,
                &model.spec.environment,
                percent != 0,
            )
            .await
        {
            warn!(model = %model.name_any(), %error, "failed to notify registry about offloading change");
        }
    }
    Ok(())
}
