//! VerticalPodAutoscaler for the admission controller Deployment
//!
//! The autoscaler API is not part of k8s-openapi, so only the fields keel
//! renders are modelled here.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{labels, COMPONENT_NAME};

/// Minimum memory recommendation for every container
pub const MIN_ALLOWED_MEMORY: &str = "25Mi";

/// Desired autoscaling of a workload
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "autoscaling.k8s.io",
    version = "v1",
    kind = "VerticalPodAutoscaler",
    plural = "verticalpodautoscalers",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VerticalPodAutoscalerSpec {
    /// Workload whose pods are scaled
    pub target_ref: TargetReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_policy: Option<PodUpdatePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_policy: Option<PodResourcePolicy>,
}

/// Reference to the scaled workload
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

/// How recommendations are applied
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum UpdateMode {
    Off,
    Initial,
    Recreate,
    Auto,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodUpdatePolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_mode: Option<UpdateMode>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodResourcePolicy {
    #[serde(default)]
    pub container_policies: Vec<ContainerResourcePolicy>,
}

/// Per-container bounds; `*` matches every container
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerResourcePolicy {
    pub container_name: String,
    /// Resource name -> quantity
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub min_allowed: BTreeMap<String, String>,
}

pub(crate) fn vertical_pod_autoscaler(namespace: &str) -> VerticalPodAutoscaler {
    VerticalPodAutoscaler {
        metadata: ObjectMeta {
            name: Some(COMPONENT_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels()),
            ..Default::default()
        },
        spec: VerticalPodAutoscalerSpec {
            target_ref: TargetReference {
                api_version: "apps/v1".to_string(),
                kind: "Deployment".to_string(),
                name: COMPONENT_NAME.to_string(),
            },
            update_policy: Some(PodUpdatePolicy {
                update_mode: Some(UpdateMode::Auto),
            }),
            resource_policy: Some(PodResourcePolicy {
                container_policies: vec![ContainerResourcePolicy {
                    container_name: "*".to_string(),
                    min_allowed: BTreeMap::from([(
                        "memory".to_string(),
                        MIN_ALLOWED_MEMORY.to_string(),
                    )]),
                }],
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_targets_the_deployment_with_auto_updates() {
        let vpa = vertical_pod_autoscaler("garden");
        assert_eq!(vpa.metadata.namespace.as_deref(), Some("garden"));
        assert_eq!(vpa.spec.target_ref.kind, "Deployment");
        assert_eq!(vpa.spec.target_ref.name, COMPONENT_NAME);

        let yaml = serde_yaml::to_string(&vpa).unwrap();
        assert!(yaml.contains("apiVersion: autoscaling.k8s.io/v1"));
        assert!(yaml.contains("kind: VerticalPodAutoscaler"));
        assert!(yaml.contains("updateMode: Auto"));
        assert!(yaml.contains("containerName: '*'"));
        assert!(yaml.contains("memory: 25Mi"));
    }
}
