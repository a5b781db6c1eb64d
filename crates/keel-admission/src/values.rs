//! Configuration values of the admission controller component

use k8s_openapi::api::rbac::v1::Subject;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};

use keel_common::Error;

use crate::COMPONENT_NAME;

/// Image deployed when none is configured
pub const DEFAULT_IMAGE: &str = "ghcr.io/keel-dev/admission-controller:v0.1.0";

/// Values the component is rendered from
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AdmissionValues {
    /// Container image
    pub image: String,
    /// Log level of the admission controller process
    pub log_level: String,
    /// Number of replicas
    pub replicas: i32,
    /// Size limits enforced on admitted resources
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_admission: Option<ResourceAdmissionConfiguration>,
    /// Ask the service proxy to prefer endpoints in the caller's zone
    pub topology_aware_routing: bool,
}

impl Default for AdmissionValues {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            log_level: "info".to_string(),
            replicas: 1,
            resource_admission: None,
            topology_aware_routing: false,
        }
    }
}

impl AdmissionValues {
    /// Parse values from YAML; omitted fields take their defaults
    pub fn from_yaml(content: &str) -> Result<Self, Error> {
        let values: Self = serde_yaml::from_str(content)
            .map_err(|e| Error::serialization_for_kind("AdmissionValues", e.to_string()))?;
        values.validate()?;
        Ok(values)
    }

    /// Reject values the admission controller would refuse to start with
    pub fn validate(&self) -> Result<(), Error> {
        if self.image.is_empty() {
            return Err(Error::validation_for(COMPONENT_NAME, "image must not be empty"));
        }
        if self.replicas < 0 {
            return Err(Error::validation_for(
                COMPONENT_NAME,
                format!("replicas must not be negative, got {}", self.replicas),
            ));
        }
        if let Some(admission) = &self.resource_admission {
            for (i, limit) in admission.limits.iter().enumerate() {
                if limit.resources.is_empty() {
                    return Err(Error::validation_for(
                        COMPONENT_NAME,
                        format!("resourceAdmission.limits[{}] has no resources", i),
                    ));
                }
                if limit.size.0.is_empty() {
                    return Err(Error::validation_for(
                        COMPONENT_NAME,
                        format!("resourceAdmission.limits[{}] has no size", i),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Whether any resource size limit is configured
    pub fn has_size_limits(&self) -> bool {
        self.resource_admission
            .as_ref()
            .is_some_and(|a| !a.limits.is_empty())
    }
}

/// Resource size admission settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAdmissionConfiguration {
    /// Per-resource size limits
    #[serde(default)]
    pub limits: Vec<ResourceLimit>,
    /// Subjects exempt from the limits
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unrestricted_subjects: Vec<Subject>,
    /// Whether oversized requests are rejected or only logged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_mode: Option<OperationMode>,
}

/// Maximum size of matching resources
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimit {
    /// API groups the limit applies to ("" is the core group)
    #[serde(default)]
    pub api_groups: Vec<String>,
    /// API versions the limit applies to
    #[serde(default)]
    pub api_versions: Vec<String>,
    /// Resources the limit applies to
    pub resources: Vec<String>,
    /// Maximum serialized size
    pub size: Quantity,
}

/// What happens to a request exceeding a limit
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    /// Reject the request
    Block,
    /// Admit the request and log it
    Log,
}
