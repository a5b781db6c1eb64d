//! In-memory [`BundleClient`] behaving like a tiny API server
//!
//! Keeps bundles and Secrets in maps, bumps `metadata.generation` when a
//! bundle spec changes, preserves status across applies and rejects changes
//! to immutable Secrets. Tests play the applier by writing conditions with
//! [`FakeBundleClient::set_conditions`].

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use parking_lot::Mutex;

use keel_common::crd::{
    Condition, ConditionStatus, ManagedBundle, ManagedBundleStatus, CONDITION_APPLIED,
    CONDITION_HEALTHY,
};
use keel_common::Error;

use crate::client::{identity, BundleClient};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn rejected(reason: &str, code: u16) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} by fake api server", reason.to_lowercase()),
        reason: reason.to_string(),
        code,
    })
}

#[derive(Default)]
struct State {
    secrets: BTreeMap<Key, Secret>,
    bundles: BTreeMap<Key, ManagedBundle>,
    rejected: BTreeSet<Key>,
    get_bundle_calls: usize,
}

/// Stateful fake of the bundle API
#[derive(Default)]
pub struct FakeBundleClient {
    state: Mutex<State>,
}

impl FakeBundleClient {
    /// Create an empty fake
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a bundle as-is, bypassing apply semantics
    pub fn insert_bundle(&self, bundle: ManagedBundle) {
        let namespace = bundle.metadata.namespace.clone().unwrap_or_default();
        let name = bundle.metadata.name.clone().unwrap_or_default();
        self.state.lock().bundles.insert(key(&namespace, &name), bundle);
    }

    /// Write the `Applied` and `Healthy` conditions of a stored bundle for
    /// its current generation. Returns false if the bundle does not exist.
    pub fn set_conditions(
        &self,
        namespace: &str,
        name: &str,
        applied: ConditionStatus,
        healthy: ConditionStatus,
    ) -> bool {
        let mut state = self.state.lock();
        let Some(bundle) = state.bundles.get_mut(&key(namespace, name)) else {
            return false;
        };
        bundle.status = Some(ManagedBundleStatus {
            observed_generation: bundle.metadata.generation,
            conditions: vec![
                Condition::new(CONDITION_APPLIED, applied, "Fake", ""),
                Condition::new(CONDITION_HEALTHY, healthy, "Fake", ""),
            ],
        });
        true
    }

    /// Mark every stored bundle applied and healthy
    pub fn converge_all(&self) {
        let keys: Vec<Key> = self.state.lock().bundles.keys().cloned().collect();
        for (namespace, name) in keys {
            self.set_conditions(
                &namespace,
                &name,
                ConditionStatus::True,
                ConditionStatus::True,
            );
        }
    }

    /// Make every subsequent write to `namespace/name` fail with 403
    pub fn reject_writes(&self, namespace: &str, name: &str) {
        self.state.lock().rejected.insert(key(namespace, name));
    }

    /// Stored bundle, if any
    pub fn bundle(&self, namespace: &str, name: &str) -> Option<ManagedBundle> {
        self.state.lock().bundles.get(&key(namespace, name)).cloned()
    }

    /// Stored Secret, if any
    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.state.lock().secrets.get(&key(namespace, name)).cloned()
    }

    /// Names of all stored Secrets in `namespace`, sorted
    pub fn secret_names(&self, namespace: &str) -> Vec<String> {
        self.state
            .lock()
            .secrets
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Number of bundles stored across all namespaces
    pub fn bundle_count(&self) -> usize {
        self.state.lock().bundles.len()
    }

    /// Number of `get_bundle` calls served so far
    pub fn get_bundle_calls(&self) -> usize {
        self.state.lock().get_bundle_calls
    }
}

fn matches_selector(secret: &Secret, selector: &str) -> bool {
    let labels = secret.metadata.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => labels.contains_key(term),
        })
}

#[async_trait]
impl BundleClient for FakeBundleClient {
    async fn apply_secret(&self, secret: &Secret) -> Result<(), Error> {
        let (namespace, name) = identity("Secret", &secret.metadata)?;
        let mut state = self.state.lock();
        let k = key(&namespace, &name);
        if state.rejected.contains(&k) {
            return Err(Error::submission(
                "Secret",
                &namespace,
                &name,
                rejected("Forbidden", 403),
            ));
        }
        if let Some(existing) = state.secrets.get(&k) {
            if existing.immutable == Some(true) && existing.data != secret.data {
                return Err(Error::submission(
                    "Secret",
                    &namespace,
                    &name,
                    rejected("Invalid", 422),
                ));
            }
        }
        state.secrets.insert(k, secret.clone());
        Ok(())
    }

    async fn list_secret_names(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<String>, Error> {
        Ok(self
            .state
            .lock()
            .secrets
            .iter()
            .filter(|((ns, _), s)| ns == namespace && matches_selector(s, label_selector))
            .map(|((_, name), _)| name.clone())
            .collect())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.state.lock().secrets.remove(&key(namespace, name));
        Ok(())
    }

    async fn apply_bundle(&self, bundle: &ManagedBundle) -> Result<(), Error> {
        let (namespace, name) = identity("ManagedBundle", &bundle.metadata)?;
        let mut state = self.state.lock();
        let k = key(&namespace, &name);
        if state.rejected.contains(&k) {
            return Err(Error::submission(
                "ManagedBundle",
                &namespace,
                &name,
                rejected("Forbidden", 403),
            ));
        }

        let mut stored = bundle.clone();
        match state.bundles.get(&k) {
            Some(existing) => {
                let generation = existing.metadata.generation.unwrap_or(1);
                stored.metadata.generation = Some(if existing.spec == bundle.spec {
                    generation
                } else {
                    generation + 1
                });
                stored.status = existing.status.clone();
            }
            None => {
                stored.metadata.generation = Some(1);
                stored.status = None;
            }
        }
        state.bundles.insert(k, stored);
        Ok(())
    }

    async fn get_bundle(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ManagedBundle>, Error> {
        let mut state = self.state.lock();
        state.get_bundle_calls += 1;
        Ok(state.bundles.get(&key(namespace, name)).cloned())
    }

    async fn delete_bundle(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock();
        let k = key(namespace, name);
        if state.rejected.contains(&k) {
            return Err(Error::submission(
                "ManagedBundle",
                namespace,
                name,
                rejected("Forbidden", 403),
            ));
        }
        state.bundles.remove(&k);
        Ok(())
    }
}
