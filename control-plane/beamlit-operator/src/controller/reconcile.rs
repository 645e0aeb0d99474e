//! ModelDeployment reconciliation.
//!
//! One pass converts the declared spec into: a registry upsert, the service
//! interception plumbing, registered health/metric watchers and a published
//! route at 0% offload. Deletion runs the inverse under a finalizer so no
//! side effect outlives the object unnoticed.

use std::sync::Arc;

use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::index::{ManagedModel, ModelKey, RegistryKey};
use super::{ControllerContext, ReconcileErr};
use crate::beamlit::Model;
use crate::crd::{ModelDeployment, OffloadingConfig};
use crate::resources;

pub const FINALIZER: &str = "modeldeployment.beamlit.com/finalizer";

fn has_finalizer(obj: &ModelDeployment) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .map(|f| f.iter().any(|x| x == FINALIZER))
        .unwrap_or(false)
}

#[instrument(skip_all, fields(ns = %obj.namespace().unwrap_or_else(|| "default".into()), name = %obj.name_any()))]
pub async fn reconcile(
    obj: Arc<ModelDeployment>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileErr> {
    let ns = obj
        .namespace()
        .unwrap_or_else(|| ctx.default_namespace.clone());
    let name = obj.name_any();
    let key = ModelKey::new(ns.clone(), name.clone());
    let api: Api<ModelDeployment> = Api::namespaced(ctx.client.clone(), &ns);

    // Two-phase delete: teardown runs while the finalizer still holds the
    // object, then the finalizer is stripped.
    if obj.meta().deletion_timestamp.is_some() {
        if has_finalizer(&obj) {
            info!("finalizing model deployment");
            let lock = ctx.indexes.lock_for(&key);
            let _guard = lock.lock().await;
            finalize(&ctx, &obj, &key).await?;
            let finalizers = obj
                .meta()
                .finalizers
                .clone()
                .unwrap_or_default()
                .into_iter()
                .filter(|f| f != FINALIZER)
                .collect::<Vec<_>>();
            let patch = json!({"metadata": {"finalizers": finalizers}});
            api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
        }
        return Ok(Action::await_change());
    }

    if !has_finalizer(&obj) {
        debug!("adding finalizer");
        let mut finalizers = obj.meta().finalizers.clone().unwrap_or_default();
        finalizers.push(FINALIZER.to_string());
        let patch = json!({"metadata": {"finalizers": finalizers}});
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        // the update bumps the watch; the next tick continues
        return Ok(Action::await_change());
    }

    // Malformed specs are refused without retry; only a spec change can fix
    // them.
    if let Err(error) = obj.spec.validate() {
        warn!(%error, "refusing actuation of invalid spec");
        return Ok(Action::await_change());
    }

    let lock = ctx.indexes.lock_for(&key);
    let _guard = lock.lock().await;
    match create_or_update(&ctx, &api, &obj, &key).await {
        Ok(()) => Ok(Action::await_change()),
        Err(error) if error.is_conflict() => {
            debug!("conflict detected, requeueing");
            Ok(Action::requeue(std::time::Duration::from_secs(1)))
        }
        Err(error) => {
            // scrub so the next reconcile starts from a clean slate; the
            // claim may predate the managed entry, so release it explicitly
            ctx.indexes.release_claim(
                &RegistryKey::new(
                    obj.spec.environment.clone(),
                    obj.spec.model.clone(),
                ),
                &key,
            );
            ctx.indexes.scrub(&key);
            Err(error)
        }
    }
}

async fn create_or_update(
    ctx: &ControllerContext,
    api: &Api<ModelDeployment>,
    obj: &ModelDeployment,
    key: &ModelKey,
) -> Result<(), ReconcileErr> {
    let spec = &obj.spec;
    let registry_key =
        RegistryKey::new(spec.environment.clone(), spec.model.clone());

    // Exclusive remote claim: a second claimant is refused without touching
    // the incumbent.
    if let Some(owner) = ctx.indexes.claim_owner(&registry_key) {
        if owner != *key {
            warn!(
                %registry_key, incumbent = %owner,
                "model already claimed by another deployment; skipping"
            );
            return Ok(());
        }
    }

    let generation = obj.meta().generation.unwrap_or(0);
    if let Some(managed) = ctx.indexes.managed(key) {
        if managed.last_applied_generation == generation {
            debug!(generation, "generation unchanged, skipping");
            return Ok(());
        }
    }

    // Port resolution into status.
    let mut status = obj.status.clone().unwrap_or_default();
    if let Some(service_ref) = &spec.service_ref {
        status.serving_port = Some(
            resources::resolve_service_target_port(
                ctx.client.clone(),
                service_ref,
                &key.namespace,
            )
            .await?,
        );
    }
    if let Some(metric_ref) = &spec.metric_service_ref {
        status.metric_port = Some(
            resources::resolve_service_target_port(
                ctx.client.clone(),
                metric_ref,
                &key.namespace,
            )
            .await?,
        );
    }

    // Remote sync: pod template + labels + policies, upserted to Beamlit.
    let workload = resources::resolve_workload(
        ctx.client.clone(),
        &spec.model_source_ref,
        &key.namespace,
    )
    .await?;

    ctx.indexes.claim(registry_key.clone(), key.clone());

    let mut with_status = obj.clone();
    with_status.status = Some(status.clone());
    let registry_model =
        Model::from_deployment(&with_status, workload.pod_template);
    let synced = ctx.registry.create_or_update_model(&registry_model).await?;
    status.workspace = synced.workspace.clone();
    status.created_at_on_beamlit =
        synced.created_at.map(|t| t.to_rfc3339());
    status.updated_at_on_beamlit =
        synced.updated_at.map(|t| t.to_rfc3339());

    with_status.status = Some(status.clone());
    configure_offloading(ctx, &with_status, key).await?;

    api.patch_status(
        &key.name,
        &PatchParams::default(),
        &Patch::Merge(&json!({"status": status})),
    )
    .await?;

    ctx.indexes.insert_managed(ManagedModel {
        key: key.clone(),
        registry_key,
        healthy: true,
        last_applied_generation: generation,
    });
    info!(generation, "model deployment reconciled");
    Ok(())
}

/// Brings the offloading machinery in line with the spec: either the full
/// interception + informer + route setup, or the teardown of a previously
/// configured model that got disabled.
async fn configure_offloading(
    ctx: &ControllerContext,
    model: &ModelDeployment,
    key: &ModelKey,
) -> Result<(), ReconcileErr> {
    let spec = &model.spec;
    let Some(offloading) = spec.offloading_config.as_ref() else {
        return Ok(());
    };

    if !spec.enabled {
        if ctx.indexes.ongoing_offloading(key).is_none() {
            return Ok(());
        }
        info!("offloading disabled; tearing down actuation");
        ctx.health.unregister(key);
        ctx.metric.unregister(key);
        if let Some(service_ref) = &spec.service_ref {
            ctx.configurer.unconfigure(service_ref).await?;
        }
        ctx.offloader.cleanup(key).await?;
        ctx.indexes.clear_offloading(key);
        if let Err(error) = ctx
            .registry
            .notify_offloading(&spec.model, &spec.environment, false)
            .await
        {
            warn!(%error, "failed to notify registry about offloading stop");
        }
        return Ok(());
    }

    let service_ref = spec
        .service_ref
        .as_ref()
        .ok_or_else(|| {
            ReconcileErr::Internal(
                "offloading config without serviceRef".to_string(),
            )
        })?;

    // fall back to the operator-wide remote backend
    let remote_backend = offloading
        .remote_backend
        .clone()
        .or_else(|| ctx.config.default_remote_backend.clone())
        .ok_or_else(|| {
            ReconcileErr::Internal(
                "no remote backend configured and no default set".to_string(),
            )
        })?;

    ctx.configurer.configure(service_ref).await?;

    ctx.metric.register(
        key.clone(),
        offloading.metrics.clone(),
        &spec.model_source_ref,
        &key.namespace,
        ctx.scrape_interval(),
        ctx.metric_window(),
    );
    ctx.health
        .register(key.clone(), &spec.model_source_ref, &key.namespace);

    let local_backend = ctx.configurer.local_shadow(service_ref)?;
    ctx.offloader
        .configure(model, &local_backend, &remote_backend, 0)
        .await?;

    ctx.indexes.set_ongoing_offloading(key, 0);
    ctx.indexes.set_model_state(key, true);
    Ok(())
}

/// Teardown for deletion: data plane first, remote registry last, so a
/// crash mid-way never leaves the registry pointing at a cluster that no
/// longer serves.
async fn finalize(
    ctx: &ControllerContext,
    model: &ModelDeployment,
    key: &ModelKey,
) -> Result<(), ReconcileErr> {
    let spec = &model.spec;
    if spec.offloading_config.is_some() {
        if let Some(service_ref) = &spec.service_ref {
            ctx.configurer.unconfigure(service_ref).await?;
        }
    }
    ctx.health.unregister(key);
    ctx.metric.unregister(key);
    ctx.offloader.cleanup(key).await?;
    ctx.registry
        .delete_model(&spec.model, &spec.environment)
        .await?;
    ctx.indexes.release_claim(
        &RegistryKey::new(spec.environment.clone(), spec.model.clone()),
        key,
    );
    ctx.indexes.scrub(key);
    info!("model deployment finalized");
    Ok(())
}

/// Offloading helpers shared with the event-fusion loop.
pub(crate) fn effective_offloading(
    model: &ModelDeployment,
    ctx: &ControllerContext,
) -> Option<OffloadingConfig> {
    let mut offloading = model.spec.offloading_config.clone()?;
    if offloading.remote_backend.is_none() {
        offloading.remote_backend = ctx.config.default_remote_backend.clone();
    }
    Some(offloading)
}

/// Status is additionally exposed through the status subresource on every
/// offload flip so operators can see the current share.
pub(crate) async fn patch_offloading_status(
    ctx: &ControllerContext,
    key: &ModelKey,
    offloading: bool,
) {
    let api: Api<ModelDeployment> =
        Api::namespaced(ctx.client.clone(), &key.namespace);
    let patch = json!({"status": {"offloadingStatus": offloading}});
    if let Err(error) = api
        .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        debug!(%key, %error, "failed to patch offloading status");
    }
}
