//! Typed in-core indexes.
//!
//! The reconciler owns every map here. Per-key locks serialize reconcile
//! and fusion work on the same model while leaving distinct models fully
//! concurrent.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

/// `(namespace, name)` identity of a ModelDeployment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelKey {
    pub namespace: String,
    pub name: String,
}

impl ModelKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// `(environment, model)` identity on the remote registry. At most one
/// ModelKey may claim a given RegistryKey at any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistryKey {
    pub environment: String,
    pub model: String,
}

impl RegistryKey {
    pub fn new(
        environment: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            environment: environment.into(),
            model: model.into(),
        }
    }
}

impl fmt::Display for RegistryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.environment, self.model)
    }
}

/// In-core shadow of a reconciled model.
#[derive(Debug, Clone)]
pub struct ManagedModel {
    pub key: ModelKey,
    pub registry_key: RegistryKey,
    pub healthy: bool,
    pub last_applied_generation: i64,
}

#[derive(Default)]
pub struct Indexes {
    /// RegistryKey → claiming ModelKey; a registry identity has at most
    /// one owner.
    beamlit_models: Mutex<HashMap<RegistryKey, ModelKey>>,
    /// ModelKey → managed shadow.
    managed: Mutex<HashMap<ModelKey, ManagedModel>>,
    /// Currently actuated offload percentage per model.
    ongoing_offloadings: DashMap<ModelKey, i32>,
    /// Health gate: false while the unhealthy actuation forces 100%.
    model_state: DashMap<ModelKey, bool>,
    /// Per-key serialization between reconcile and event fusion.
    locks: DashMap<ModelKey, Arc<tokio::sync::Mutex<()>>>,
}

impl Indexes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-key lock used to linearize reconcile, health and metric work on
    /// the same model.
    pub fn lock_for(&self, key: &ModelKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Claims `registry_key` for `key`. Returns false when another model
    /// already owns it; the incumbent is left untouched.
    pub fn claim(&self, registry_key: RegistryKey, key: ModelKey) -> bool {
        let mut claims = self.beamlit_models.lock().unwrap();
        match claims.get(&registry_key) {
            Some(owner) if *owner != key => false,
            _ => {
                claims.insert(registry_key, key);
                true
            }
        }
    }

    pub fn claim_owner(&self, registry_key: &RegistryKey) -> Option<ModelKey> {
        self.beamlit_models
            .lock()
            .unwrap()
            .get(registry_key)
            .cloned()
    }

    /// Releases the claim if (and only if) `key` holds it.
    pub fn release_claim(&self, registry_key: &RegistryKey, key: &ModelKey) {
        let mut claims = self.beamlit_models.lock().unwrap();
        if claims.get(registry_key) == Some(key) {
            claims.remove(registry_key);
        }
    }

    pub fn managed(&self, key: &ModelKey) -> Option<ManagedModel> {
        self.managed.lock().unwrap().get(key).cloned()
    }

    pub fn insert_managed(&self, model: ManagedModel) {
        self.managed.lock().unwrap().insert(model.key.clone(), model);
    }

    pub fn set_managed_health(&self, key: &ModelKey, healthy: bool) {
        if let Some(model) = self.managed.lock().unwrap().get_mut(key) {
            model.healthy = healthy;
        }
    }

    pub fn ongoing_offloading(&self, key: &ModelKey) -> Option<i32> {
        self.ongoing_offloadings.get(key).map(|v| *v)
    }

    pub fn set_ongoing_offloading(&self, key: &ModelKey, percent: i32) {
        self.ongoing_offloadings.insert(key.clone(), percent);
    }

    pub fn model_state(&self, key: &ModelKey) -> Option<bool> {
        self.model_state.get(key).map(|v| *v)
    }

    pub fn set_model_state(&self, key: &ModelKey, healthy: bool) {
        self.model_state.insert(key.clone(), healthy);
    }

    /// Removes offloading bookkeeping (ongoing percentage + health gate).
    pub fn clear_offloading(&self, key: &ModelKey) {
        self.ongoing_offloadings.remove(key);
        self.model_state.remove(key);
    }

    /// Scrubs every entry for `key` so the next reconcile starts clean.
    pub fn scrub(&self, key: &ModelKey) {
        self.clear_offloading(key);
        let removed = self.managed.lock().unwrap().remove(key);
        if let Some(model) = removed {
            self.release_claim(&model.registry_key, key);
        }
        self.locks.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ModelKey {
        ModelKey::new("default", name)
    }

    #[test]
    fn claim_is_exclusive() {
        let indexes = Indexes::new();
        let registry = RegistryKey::new("prod", "llama");
        assert!(indexes.claim(registry.clone(), key("m1")));
        // re-claim by the same model is idempotent
        assert!(indexes.claim(registry.clone(), key("m1")));
        // a second claimant is refused and the incumbent survives
        assert!(!indexes.claim(registry.clone(), key("m2")));
        assert_eq!(indexes.claim_owner(&registry), Some(key("m1")));
    }

    #[test]
    fn release_claim_only_for_the_owner() {
        let indexes = Indexes::new();
        let registry = RegistryKey::new("prod", "llama");
        assert!(indexes.claim(registry.clone(), key("m1")));
        indexes.release_claim(&registry, &key("m2"));
        assert_eq!(indexes.claim_owner(&registry), Some(key("m1")));
        indexes.release_claim(&registry, &key("m1"));
        assert_eq!(indexes.claim_owner(&registry), None);
    }

    #[test]
    fn scrub_clears_every_entry_for_the_key() {
        let indexes = Indexes::new();
        let registry = RegistryKey::new("prod", "llama");
        let model_key = key("m1");
        assert!(indexes.claim(registry.clone(), model_key.clone()));
        indexes.insert_managed(ManagedModel {
            key: model_key.clone(),
            registry_key: registry.clone(),
            healthy: true,
            last_applied_generation: 3,
        });
        indexes.set_ongoing_offloading(&model_key, 50);
        indexes.set_model_state(&model_key, true);

        indexes.scrub(&model_key);

        assert!(indexes.managed(&model_key).is_none());
        assert!(indexes.ongoing_offloading(&model_key).is_none());
        assert!(indexes.model_state(&model_key).is_none());
        assert_eq!(indexes.claim_owner(&registry), None);
    }

    #[test]
    fn scrub_spares_a_claim_held_by_another_model() {
        let indexes = Indexes::new();
        let registry = RegistryKey::new("prod", "llama");
        assert!(indexes.claim(registry.clone(), key("m1")));
        // m2 never got the claim; scrubbing it must not release m1's
        indexes.insert_managed(ManagedModel {
            key: key("m2"),
            registry_key: registry.clone(),
            healthy: true,
            last_applied_generation: 1,
        });
        indexes.scrub(&key("m2"));
        assert_eq!(indexes.claim_owner(&registry), Some(key("m1")));
    }

    #[test]
    fn generation_gate_reads_through_managed() {
        let indexes = Indexes::new();
        let model_key = key("m1");
        indexes.insert_managed(ManagedModel {
            key: model_key.clone(),
            registry_key: RegistryKey::new("prod", "llama"),
            healthy: true,
            last_applied_generation: 7,
        });
        assert_eq!(
            indexes.managed(&model_key).unwrap().last_applied_generation,
            7
        );
    }
}
