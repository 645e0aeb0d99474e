//! Policy reconciliation.
//!
//! Same finalizer-and-generation skeleton as the model controller, relaying
//! Policy objects to the registry. Policy names are fleet-unique: the first
//! object to claim a name keeps it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::{Controller, watcher::Config};
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use super::ReconcileErr;
use super::index::ModelKey;
use crate::beamlit::RegistryPolicy;
use crate::crd::Policy;

const FINALIZER: &str = "policy.beamlit.com/finalizer";

#[derive(Debug, Clone)]
struct ManagedPolicy {
    key: ModelKey,
    last_applied_generation: i64,
}

pub struct PolicyContext {
    pub client: Client,
    pub registry: crate::beamlit::Client,
    managed: Mutex<HashMap<String, ManagedPolicy>>,
}

impl PolicyContext {
    pub fn new(client: Client, registry: crate::beamlit::Client) -> Self {
        Self {
            client,
            registry,
            managed: Mutex::new(HashMap::new()),
        }
    }
}

pub async fn run_policy_controller(
    ctx: Arc<PolicyContext>,
) -> anyhow::Result<()> {
    let api: Api<Policy> = Api::all(ctx.client.clone());
    Controller::new(api, Config::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            if let Err(e) = result {
                error!(error = ?e, "policy reconcile error");
            }
        })
        .await;
    Ok(())
}

fn has_finalizer(obj: &Policy) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .map(|f| f.iter().any(|x| x == FINALIZER))
        .unwrap_or(false)
}

#[instrument(skip_all, fields(ns = %obj.namespace().unwrap_or_else(|| "default".into()), name = %obj.name_any()))]
async fn reconcile(
    obj: Arc<Policy>,
    ctx: Arc<PolicyContext>,
) -> Result<Action, ReconcileErr> {
    let ns = obj.namespace().unwrap_or_else(|| "default".to_string());
    let name = obj.name_any();
    let api: Api<Policy> = Api::namespaced(ctx.client.clone(), &ns);

    if obj.meta().deletion_timestamp.is_some() {
        if has_finalizer(&obj) {
            info!("finalizing policy");
            ctx.registry.delete_policy(&name).await?;
            ctx.managed.lock().unwrap().remove(&name);
            let finalizers = obj
                .meta()
                .finalizers
                .clone()
                .unwrap_or_default()
                .into_iter()
                .filter(|f| f != FINALIZER)
                .collect::<Vec<_>>();
            api.patch(
                &name,
                &PatchParams::default(),
                &Patch::Merge(&json!({"metadata": {"finalizers": finalizers}})),
            )
            .await?;
        }
        return Ok(Action::await_change());
    }

    if !has_finalizer(&obj) {
        let mut finalizers = obj.meta().finalizers.clone().unwrap_or_default();
        finalizers.push(FINALIZER.to_string());
        api.patch(
            &name,
            &PatchParams::default(),
            &Patch::Merge(&json!({"metadata": {"finalizers": finalizers}})),
        )
        .await?;
        return Ok(Action::await_change());
    }

    let key = ModelKey::new(ns, name.clone());
    let generation = obj.meta().generation.unwrap_or(0);
    {
        let managed = ctx.managed.lock().unwrap();
        if let Some(existing) = managed.get(&name) {
            if existing.key != key {
                warn!(
                    incumbent = %existing.key,
                    "policy name already managed by another object; skipping"
                );
                return Ok(Action::await_change());
            }
            if existing.last_applied_generation == generation {
                debug!(generation, "policy generation unchanged, skipping");
                return Ok(Action::await_change());
            }
        }
    }

    let registry_policy = RegistryPolicy::from_policy(&name, &obj.spec);
    let synced = ctx.registry.create_or_update_policy(&registry_policy).await?;

    let status = json!({"status": {
        "workspace": synced.workspace,
        "createdAtOnBeamlit": synced.created_at.map(|t| t.to_rfc3339()),
        "updatedAtOnBeamlit": synced.updated_at.map(|t| t.to_rfc3339()),
    }});
    api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&status))
        .await?;

    ctx.managed.lock().unwrap().insert(
        name,
        ManagedPolicy {
            key,
            last_applied_generation: generation,
        },
    );
    Ok(Action::await_change())
}

fn error_policy(
    _obj: Arc<Policy>,
    error: &ReconcileErr,
    _ctx: Arc<PolicyContext>,
) -> Action {
    if error.is_conflict() {
        Action::requeue(Duration::from_secs(1))
    } else {
        Action::requeue(Duration::from_secs(60))
    }
}
