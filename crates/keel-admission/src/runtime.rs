//! Runtime cluster manifests: configuration, Deployment and Service

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, HTTPGetAction, KeyToPath, PodSpec,
    PodTemplateSpec, Probe, ProjectedVolumeSource, ResourceRequirements, SecretProjection,
    SecretVolumeSource, Service, ServicePort, ServiceSpec, Volume, VolumeMount, VolumeProjection,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::Serialize;

use keel_bundle::ManifestRegistry;
use keel_common::naming::make_unique_config_map;
use keel_common::Error;

use crate::values::{AdmissionValues, ResourceAdmissionConfiguration};
use crate::vpa::vertical_pod_autoscaler;
use crate::{labels, ACCESS_SECRET_NAME, COMPONENT_NAME, KUBECONFIG_SECRET_NAME};

const WEBHOOK_PORT: i32 = 2719;
const HEALTH_PORT: i32 = 2722;
const METRICS_PORT: i32 = 2723;

const CONFIG_KEY: &str = "config.yaml";
const CONFIG_DIR: &str = "/etc/keel-admission-controller/config";
const SERVER_CERT_DIR: &str = "/etc/keel-admission-controller/srv";
const KUBECONFIG_DIR: &str = "/var/run/secrets/keel.dev/shoot/generic-kubeconfig";

/// Secret holding the webhook server certificate, issued outside of keel
pub const SERVER_CERT_SECRET_NAME: &str = "keel-admission-controller-cert";

/// Configuration file read by the admission controller process
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AdmissionControllerConfiguration<'a> {
    api_version: &'static str,
    kind: &'static str,
    garden_client_connection: ClientConnection,
    log_level: &'a str,
    log_format: &'static str,
    server: ServerConfiguration<'a>,
}

#[derive(Serialize)]
struct ClientConnection {
    qps: u32,
    burst: u32,
    kubeconfig: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerConfiguration<'a> {
    webhooks: HttpsServer,
    health_probes: Server,
    metrics: Server,
    #[serde(skip_serializing_if = "Option::is_none")]
    resource_admission_configuration: Option<&'a ResourceAdmissionConfiguration>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HttpsServer {
    port: i32,
    tls: TlsServer,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TlsServer {
    server_cert_dir: &'static str,
}

#[derive(Serialize)]
struct Server {
    port: i32,
}

fn render_config(values: &AdmissionValues) -> Result<String, Error> {
    let config = AdmissionControllerConfiguration {
        api_version: "admissioncontroller.config.keel.dev/v1alpha1",
        kind: "AdmissionControllerConfiguration",
        garden_client_connection: ClientConnection {
            qps: 100,
            burst: 130,
            kubeconfig: format!("{}/kubeconfig", KUBECONFIG_DIR),
        },
        log_level: &values.log_level,
        log_format: "json",
        server: ServerConfiguration {
            webhooks: HttpsServer {
                port: WEBHOOK_PORT,
                tls: TlsServer {
                    server_cert_dir: SERVER_CERT_DIR,
                },
            },
            health_probes: Server { port: HEALTH_PORT },
            metrics: Server { port: METRICS_PORT },
            resource_admission_configuration: values.resource_admission.as_ref(),
        },
    };
    serde_yaml::to_string(&config)
        .map_err(|e| Error::serialization_for_kind("AdmissionControllerConfiguration", e.to_string()))
}

/// Content-addressed ConfigMap carrying `config.yaml`
pub(crate) fn config_map(namespace: &str, values: &AdmissionValues) -> Result<ConfigMap, Error> {
    let mut config_map = ConfigMap {
        metadata: ObjectMeta {
            name: Some(COMPONENT_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            CONFIG_KEY.to_string(),
            render_config(values)?,
        )])),
        ..Default::default()
    };
    make_unique_config_map(&mut config_map)?;
    Ok(config_map)
}

fn http_probe(path: &str, initial_delay_seconds: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(HEALTH_PORT),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay_seconds),
        timeout_seconds: Some(5),
        ..Default::default()
    }
}

fn projected_secret(name: &str, key: &str) -> VolumeProjection {
    VolumeProjection {
        secret: Some(SecretProjection {
            name: name.to_string(),
            items: Some(vec![KeyToPath {
                key: key.to_string(),
                path: key.to_string(),
                ..Default::default()
            }]),
            optional: Some(false),
        }),
        ..Default::default()
    }
}

/// Deployment mounting the ConfigMap named `config_map_name`
pub(crate) fn deployment(
    namespace: &str,
    config_map_name: &str,
    values: &AdmissionValues,
) -> Deployment {
    let mut pod_labels = labels();
    pod_labels.insert(
        "networking.keel.dev/to-dns".to_string(),
        "allowed".to_string(),
    );

    Deployment {
        metadata: ObjectMeta {
            name: Some(COMPONENT_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(values.replicas),
            selector: LabelSelector {
                match_labels: Some(labels()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    automount_service_account_token: Some(false),
                    containers: vec![Container {
                        name: COMPONENT_NAME.to_string(),
                        image: Some(values.image.clone()),
                        image_pull_policy: Some("IfNotPresent".to_string()),
                        args: Some(vec![format!("--config={}/{}", CONFIG_DIR, CONFIG_KEY)]),
                        resources: Some(ResourceRequirements {
                            requests: Some(BTreeMap::from([
                                ("cpu".to_string(), Quantity("100m".to_string())),
                                ("memory".to_string(), Quantity("200Mi".to_string())),
                            ])),
                            ..Default::default()
                        }),
                        liveness_probe: Some(http_probe("/healthz", 15)),
                        readiness_probe: Some(http_probe("/readyz", 10)),
                        volume_mounts: Some(vec![
                            VolumeMount {
                                name: "server-cert".to_string(),
                                mount_path: SERVER_CERT_DIR.to_string(),
                                read_only: Some(true),
                                ..Default::default()
                            },
                            VolumeMount {
                                name: "config".to_string(),
                                mount_path: CONFIG_DIR.to_string(),
                                ..Default::default()
                            },
                            VolumeMount {
                                name: "kubeconfig".to_string(),
                                mount_path: KUBECONFIG_DIR.to_string(),
                                read_only: Some(true),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![
                        Volume {
                            name: "server-cert".to_string(),
                            secret: Some(SecretVolumeSource {
                                secret_name: Some(SERVER_CERT_SECRET_NAME.to_string()),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                        Volume {
                            name: "config".to_string(),
                            config_map: Some(ConfigMapVolumeSource {
                                name: config_map_name.to_string(),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                        Volume {
                            name: "kubeconfig".to_string(),
                            projected: Some(ProjectedVolumeSource {
                                default_mode: Some(0o644),
                                sources: Some(vec![
                                    projected_secret(KUBECONFIG_SECRET_NAME, "kubeconfig"),
                                    projected_secret(ACCESS_SECRET_NAME, "token"),
                                ]),
                            }),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn service(namespace: &str, values: &AdmissionValues) -> Service {
    let mut service_labels = labels();
    let mut annotations = BTreeMap::from([(
        "networking.keel.dev/from-all-webhook-targets-allowed-ports".to_string(),
        format!(r#"[{{"protocol":"TCP","port":{}}}]"#, WEBHOOK_PORT),
    )]);
    if values.topology_aware_routing {
        service_labels.insert(
            "endpoint-slice-hints.resources.keel.dev/consider".to_string(),
            "true".to_string(),
        );
        annotations.insert(
            "service.kubernetes.io/topology-mode".to_string(),
            "auto".to_string(),
        );
    }

    Service {
        metadata: ObjectMeta {
            name: Some(COMPONENT_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(service_labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(labels()),
            ports: Some(vec![
                ServicePort {
                    name: Some("https".to_string()),
                    protocol: Some("TCP".to_string()),
                    port: 443,
                    target_port: Some(IntOrString::Int(WEBHOOK_PORT)),
                    ..Default::default()
                },
                ServicePort {
                    name: Some("metrics".to_string()),
                    protocol: Some("TCP".to_string()),
                    port: METRICS_PORT,
                    target_port: Some(IntOrString::Int(METRICS_PORT)),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Render the runtime bundle. Returns the manifests and the name the
/// ConfigMap received, which the Deployment already references.
pub(crate) fn render(
    namespace: &str,
    values: &AdmissionValues,
) -> Result<(ManifestRegistry, String), Error> {
    let config_map = config_map(namespace, values)?;
    let config_map_name = config_map
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::internal_with_context(COMPONENT_NAME, "config map lost its name"))?;

    let mut registry = ManifestRegistry::new();
    registry.add(&config_map)?;
    registry.add(&deployment(namespace, &config_map_name, values))?;
    registry.add(&service(namespace, values))?;
    registry.add(&vertical_pod_autoscaler(namespace))?;
    Ok((registry, config_map_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::ResourceLimit;

    fn with_limit(size: &str) -> AdmissionValues {
        AdmissionValues {
            resource_admission: Some(ResourceAdmissionConfiguration {
                limits: vec![ResourceLimit {
                    api_groups: vec![String::new()],
                    api_versions: vec!["v1".to_string()],
                    resources: vec!["secrets".to_string()],
                    size: Quantity(size.to_string()),
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_config_map_name_follows_content() {
        let base = config_map("garden", &AdmissionValues::default()).unwrap();
        let again = config_map("garden", &AdmissionValues::default()).unwrap();
        let limited = config_map("garden", &with_limit("1Mi")).unwrap();
        let other_limit = config_map("garden", &with_limit("2Mi")).unwrap();

        assert_eq!(base.metadata.name, again.metadata.name);
        assert_ne!(base.metadata.name, limited.metadata.name);
        assert_ne!(limited.metadata.name, other_limit.metadata.name);
        assert!(base
            .metadata
            .name
            .unwrap()
            .starts_with("keel-admission-controller-"));
        assert_eq!(limited.immutable, Some(true));
    }

    #[test]
    fn test_config_contains_limits() {
        let config = render_config(&with_limit("1Mi")).unwrap();
        assert!(config.contains("resourceAdmissionConfiguration"));
        assert!(config.contains("size: 1Mi"));
        assert!(config.contains("port: 2719"));

        let config = render_config(&AdmissionValues::default()).unwrap();
        assert!(!config.contains("resourceAdmissionConfiguration"));
    }

    #[test]
    fn test_deployment_mounts_given_config_map() {
        let deployment = deployment("garden", "keel-admission-controller-0123abcd", &AdmissionValues::default());
        let volumes = deployment.spec.unwrap().template.spec.unwrap().volumes.unwrap();
        let config = volumes.iter().find(|v| v.name == "config").unwrap();
        assert_eq!(
            config.config_map.as_ref().unwrap().name,
            "keel-admission-controller-0123abcd"
        );
    }

    #[test]
    fn test_topology_aware_routing() {
        let plain = service("garden", &AdmissionValues::default());
        assert!(!plain
            .metadata
            .annotations
            .unwrap()
            .contains_key("service.kubernetes.io/topology-mode"));

        let routed = service(
            "garden",
            &AdmissionValues {
                topology_aware_routing: true,
                ..Default::default()
            },
        );
        assert_eq!(
            routed.metadata.annotations.unwrap()["service.kubernetes.io/topology-mode"],
            "auto"
        );
        assert_eq!(
            routed.metadata.labels.unwrap()["endpoint-slice-hints.resources.keel.dev/consider"],
            "true"
        );
    }

    #[test]
    fn test_render_registers_every_object() {
        let (registry, config_map_name) = render("garden", &AdmissionValues::default()).unwrap();
        let keys: Vec<_> = registry.keys().collect();
        assert_eq!(
            keys,
            vec![
                format!("configmap__garden__{}.yaml", config_map_name),
                "deployment__garden__keel-admission-controller.yaml".to_string(),
                "service__garden__keel-admission-controller.yaml".to_string(),
                "verticalpodautoscaler__garden__keel-admission-controller.yaml".to_string(),
            ]
        );
    }
}
