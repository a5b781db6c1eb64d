//! Manifest registry: collects rendered objects into a bundle payload
//!
//! Each object is serialized to YAML under a file key derived from its kind,
//! namespace and name, so that every object in a payload has exactly one file.

use std::collections::BTreeMap;

use kube::Resource;
use serde::Serialize;

use keel_common::Error;

/// File key of an object inside a bundle payload.
///
/// `<kind-lowercase>__<namespace>__<name>.yaml`, with `:` in names replaced
/// by `_` (cluster-scoped RBAC names often contain colons).
pub fn manifest_key(kind: &str, namespace: &str, name: &str) -> String {
    format!(
        "{}__{}__{}.yaml",
        kind.to_lowercase(),
        namespace,
        name.replace(':', "_")
    )
}

/// Ordered collection of serialized manifests
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ManifestRegistry {
    entries: BTreeMap<String, Vec<u8>>,
}

impl ManifestRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize `object` and add it under its manifest key.
    ///
    /// Fails if the object has no name or an object with the same key was
    /// already added.
    pub fn add<K>(&mut self, object: &K) -> Result<(), Error>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let kind = K::kind(&());
        let meta = object.meta();
        let name = meta
            .name
            .as_deref()
            .ok_or_else(|| Error::validation(format!("{} without a name", kind)))?;
        let namespace = meta.namespace.as_deref().unwrap_or_default();
        let key = manifest_key(&kind, namespace, name);

        if self.entries.contains_key(&key) {
            return Err(Error::validation(format!("duplicate manifest {}", key)));
        }

        let yaml = serde_yaml::to_string(object)
            .map_err(|e| Error::serialization_for_kind(kind.to_string(), e.to_string()))?;
        self.entries.insert(key, yaml.into_bytes());
        Ok(())
    }

    /// Keys of all added manifests, sorted
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Serialized content of one manifest
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    /// Number of manifests
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no manifest was added
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Consume the registry into a bundle payload
    pub fn into_payload(self) -> BTreeMap<String, Vec<u8>> {
        self.entries
    }
}
