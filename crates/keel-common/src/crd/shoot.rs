//! Shoot Custom Resource Definition
//!
//! A Shoot is a managed (virtual) cluster requested by an end user in the
//! garden cluster. keel only watches Shoots; it never writes them.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Machine type of a worker pool
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    /// Provider-specific machine type (e.g. "m5.large")
    #[serde(rename = "type")]
    pub type_: String,
}

/// A worker pool of a Shoot
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    /// Pool name
    pub name: String,
    /// Minimum number of machines
    pub minimum: i32,
    /// Maximum number of machines
    pub maximum: i32,
    /// Machine configuration
    pub machine: Machine,
}

/// Infrastructure provider of a Shoot
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShootProvider {
    /// Provider type (e.g. "aws")
    #[serde(rename = "type")]
    pub type_: String,
    /// Worker pools
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workers: Vec<Worker>,
}

/// Kubernetes settings of a Shoot
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShootKubernetes {
    /// Kubernetes version (e.g. "1.30.2")
    pub version: String,
}

/// Specification for a Shoot
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "core.keel.dev",
    version = "v1beta1",
    kind = "Shoot",
    plural = "shoots",
    namespaced,
    printcolumn = r#"{"name":"Provider","type":"string","jsonPath":".spec.provider.type"}"#,
    printcolumn = r#"{"name":"Region","type":"string","jsonPath":".spec.region"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ShootSpec {
    /// Cloud profile the Shoot is created from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_profile_name: Option<String>,

    /// Binding to the provider credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_binding_name: Option<String>,

    /// Provider region
    pub region: String,

    /// Infrastructure provider
    pub provider: ShootProvider,

    /// Kubernetes settings
    pub kubernetes: ShootKubernetes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_shoot() {
        let shoot: Shoot = serde_yaml::from_str(
            r#"
apiVersion: core.keel.dev/v1beta1
kind: Shoot
metadata:
  name: dev
  namespace: garden-team
  resourceVersion: "4711"
spec:
  cloudProfileName: test-cloudprofile
  secretBindingName: my-provider-account
  region: foo-region
  provider:
    type: aws
    workers:
      - name: cpu-worker
        minimum: 2
        maximum: 2
        machine:
          type: large
  kubernetes:
    version: 1.30.2
"#,
        )
        .expect("parse shoot");

        assert_eq!(shoot.metadata.resource_version.as_deref(), Some("4711"));
        assert_eq!(shoot.spec.provider.type_, "aws");
        assert_eq!(shoot.spec.provider.workers[0].machine.type_, "large");
        assert_eq!(shoot.spec.kubernetes.version, "1.30.2");
    }
}
