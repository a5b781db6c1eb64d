//! Virtual cluster manifests: RBAC and webhook registration

use k8s_openapi::api::admissionregistration::v1::{
    RuleWithOperations, ValidatingWebhook, ValidatingWebhookConfiguration, WebhookClientConfig,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, LabelSelectorRequirement, ObjectMeta,
};

use keel_bundle::ManifestRegistry;
use keel_common::Error;

use crate::values::AdmissionValues;
use crate::{labels, COMPONENT_NAME, SERVICE_ACCOUNT_NAMESPACE};

const CLUSTER_ROLE_NAME: &str = "keel.dev:system:admission-controller";
const CLUSTER_ROLE_BINDING_NAME: &str = "keel.dev:admission-controller";

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn read_rule(group: &str, resources: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![group.to_string()]),
        resources: Some(strings(resources)),
        verbs: strings(&["get", "list", "watch"]),
        ..Default::default()
    }
}

pub(crate) fn cluster_role() -> ClusterRole {
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(CLUSTER_ROLE_NAME.to_string()),
            labels: Some(labels()),
            ..Default::default()
        },
        rules: Some(vec![
            read_rule(
                "core.keel.dev",
                &["backupbuckets", "backupentries", "projects", "seeds", "shoots"],
            ),
            read_rule("", &["namespaces", "secrets", "serviceaccounts"]),
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(strings(&["configmaps"])),
                verbs: strings(&["get"]),
                ..Default::default()
            },
            read_rule("coordination.k8s.io", &["leases"]),
            read_rule("certificates.k8s.io", &["certificatesigningrequests"]),
        ]),
        ..Default::default()
    }
}

pub(crate) fn cluster_role_binding() -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(CLUSTER_ROLE_BINDING_NAME.to_string()),
            labels: Some(labels()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: CLUSTER_ROLE_NAME.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: COMPONENT_NAME.to_string(),
            namespace: Some(SERVICE_ACCOUNT_NAMESPACE.to_string()),
            ..Default::default()
        }]),
    }
}

fn rule(operations: &[&str], group: &str, version: &str, resources: &[&str]) -> RuleWithOperations {
    RuleWithOperations {
        operations: Some(strings(operations)),
        api_groups: Some(vec![group.to_string()]),
        api_versions: Some(vec![version.to_string()]),
        resources: Some(strings(resources)),
        ..Default::default()
    }
}

fn project_namespaces() -> LabelSelector {
    LabelSelector {
        match_labels: Some(
            [("keel.dev/role".to_string(), "project".to_string())]
                .into_iter()
                .collect(),
        ),
        ..Default::default()
    }
}

fn foreign_project_namespaces() -> LabelSelector {
    LabelSelector {
        match_expressions: Some(vec![
            LabelSelectorRequirement {
                key: "keel.dev/role".to_string(),
                operator: "In".to_string(),
                values: Some(strings(&["project"])),
            },
            LabelSelectorRequirement {
                key: "app".to_string(),
                operator: "NotIn".to_string(),
                values: Some(strings(&["keel"])),
            },
        ]),
        ..Default::default()
    }
}

fn webhook(namespace: &str, name: &str, path: &str, rules: Vec<RuleWithOperations>) -> ValidatingWebhook {
    ValidatingWebhook {
        name: format!("{}.keel.dev", name),
        admission_review_versions: strings(&["v1", "v1beta1"]),
        timeout_seconds: Some(10),
        rules: Some(rules),
        failure_policy: Some("Fail".to_string()),
        side_effects: "None".to_string(),
        client_config: WebhookClientConfig {
            url: Some(format!(
                "https://{}.{}/webhooks/{}",
                COMPONENT_NAME, namespace, path
            )),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub(crate) fn validating_webhook_configuration(
    namespace: &str,
    values: &AdmissionValues,
) -> ValidatingWebhookConfiguration {
    let mut webhooks = vec![
        ValidatingWebhook {
            namespace_selector: Some(project_namespaces()),
            ..webhook(
                namespace,
                "validate-namespace-deletion",
                "validate-namespace-deletion",
                vec![rule(&["DELETE"], "", "v1", &["namespaces"])],
            )
        },
        ValidatingWebhook {
            namespace_selector: Some(foreign_project_namespaces()),
            ..webhook(
                namespace,
                "validate-kubeconfig-secrets",
                "validate-kubeconfig-secrets",
                vec![rule(&["CREATE", "UPDATE"], "", "v1", &["secrets"])],
            )
        },
        ValidatingWebhook {
            match_policy: Some("Equivalent".to_string()),
            ..webhook(
                namespace,
                "seed-restriction",
                "admission/seedrestriction",
                vec![
                    rule(&["CREATE"], "", "v1", &["secrets", "serviceaccounts"]),
                    rule(&["CREATE"], "rbac.authorization.k8s.io", "v1", &["clusterrolebindings"]),
                    rule(&["CREATE"], "coordination.k8s.io", "v1", &["leases"]),
                    rule(&["CREATE"], "certificates.k8s.io", "v1", &["certificatesigningrequests"]),
                    rule(&["CREATE"], "core.keel.dev", "v1beta1", &["backupentries"]),
                    rule(&["CREATE", "DELETE"], "core.keel.dev", "v1beta1", &["backupbuckets"]),
                    rule(&["CREATE", "UPDATE", "DELETE"], "core.keel.dev", "v1beta1", &["seeds"]),
                ],
            )
        },
        ValidatingWebhook {
            object_selector: Some(LabelSelector {
                match_labels: Some(
                    [("role".to_string(), "internal-domain".to_string())]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            }),
            ..webhook(
                namespace,
                "internal-domain-secret",
                "admission/validate-internal-domain",
                vec![rule(&["CREATE", "UPDATE", "DELETE"], "", "v1", &["secrets"])],
            )
        },
        ValidatingWebhook {
            namespace_selector: Some(project_namespaces()),
            ..webhook(
                namespace,
                "audit-policies",
                "audit-policies",
                vec![
                    rule(&["CREATE", "UPDATE"], "core.keel.dev", "v1beta1", &["shoots"]),
                    rule(&["UPDATE"], "", "v1", &["configmaps"]),
                ],
            )
        },
    ];

    if let Some(admission) = values
        .resource_admission
        .as_ref()
        .filter(|a| !a.limits.is_empty())
    {
        let rules = admission
            .limits
            .iter()
            .map(|limit| RuleWithOperations {
                operations: Some(strings(&["CREATE", "UPDATE"])),
                api_groups: Some(limit.api_groups.clone()),
                api_versions: Some(limit.api_versions.clone()),
                resources: Some(limit.resources.clone()),
                ..Default::default()
            })
            .collect();
        webhooks.push(ValidatingWebhook {
            namespace_selector: Some(foreign_project_namespaces()),
            ..webhook(namespace, "validate-resource-size", "validate-resource-size", rules)
        });
    }

    ValidatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(COMPONENT_NAME.to_string()),
            labels: Some(labels()),
            ..Default::default()
        },
        webhooks: Some(webhooks),
    }
}

/// Render the virtual cluster bundle
pub(crate) fn render(namespace: &str, values: &AdmissionValues) -> Result<ManifestRegistry, Error> {
    let mut registry = ManifestRegistry::new();
    registry.add(&cluster_role())?;
    registry.add(&cluster_role_binding())?;
    registry.add(&validating_webhook_configuration(namespace, values))?;
    Ok(registry)
}
