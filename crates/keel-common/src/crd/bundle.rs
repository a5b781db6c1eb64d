//! ManagedBundle Custom Resource Definition
//!
//! A ManagedBundle asks the applier to materialize a set of rendered manifests
//! in one target cluster. The manifests live in the Secrets listed in
//! `spec.secretRefs`. The applier reports progress through the `Applied` and
//! `Healthy` conditions in `status`; keel only ever reads the status.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{find_condition, Condition};

/// Plural resource name used in not-found messages
pub const MANAGED_BUNDLE_RESOURCE: &str = "managedbundles.keel.dev";

/// Reference to a Secret in the bundle's namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct SecretReference {
    /// Secret name
    pub name: String,
}

impl SecretReference {
    /// Create a reference to the named Secret
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Status of a ManagedBundle, written by the applier
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedBundleStatus {
    /// Generation of the spec the conditions describe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ManagedBundleStatus {
    /// Look up a condition by type
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        find_condition(&self.conditions, type_)
    }
}

/// Specification for a ManagedBundle
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "keel.dev",
    version = "v1alpha1",
    kind = "ManagedBundle",
    plural = "managedbundles",
    shortname = "mb",
    namespaced,
    status = "ManagedBundleStatus",
    printcolumn = r#"{"name":"Class","type":"string","jsonPath":".spec.class"}"#,
    printcolumn = r#"{"name":"Applied","type":"string","jsonPath":".status.conditions[?(@.type==\"Applied\")].status"}"#,
    printcolumn = r#"{"name":"Healthy","type":"string","jsonPath":".status.conditions[?(@.type==\"Healthy\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedBundleSpec {
    /// Applier class responsible for this bundle ("seed" for the runtime cluster).
    /// Unset means the objects go to the cluster behind `kubeconfigSecretRef`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,

    /// Secrets holding the manifests, one file per object
    #[serde(default)]
    pub secret_refs: Vec<SecretReference>,

    /// Kubeconfig of the target cluster for bundles without a class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig_secret_ref: Option<SecretReference>,

    /// Leave the applied objects in place when the bundle is deleted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_objects: Option<bool>,
}
