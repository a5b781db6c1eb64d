//! Bundle descriptors: "these manifests should exist in target cluster T"

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;

use keel_common::crd::{ManagedBundle, ManagedBundleSpec, SecretReference};
use keel_common::naming::make_unique_secret;
use keel_common::{Error, SEED_CLASS};

/// Prefix of the Secrets carrying bundle payloads
pub const BUNDLE_SECRET_PREFIX: &str = "managedbundle-";

/// Label on payload Secrets naming the bundle they belong to
pub const LABEL_BUNDLE: &str = "resources.keel.dev/bundle";

/// Label on keel-written objects naming the component that owns them
pub const LABEL_ORIGIN: &str = "resources.keel.dev/origin";

/// Where the applier materializes a bundle
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetCluster {
    /// The cluster the bundle object itself lives in
    Runtime,
    /// A remote cluster reached through a kubeconfig stored in a Secret
    Remote {
        /// Secret (in the bundle's namespace) holding the kubeconfig
        kubeconfig_secret: String,
    },
}

/// A (role, cluster) pair with its own bundle and convergence timeline
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    /// Logical role of the target (e.g. "runtime", "virtual")
    pub role: String,
    /// Name of the ManagedBundle object
    pub name: String,
    /// Namespace of the ManagedBundle object
    pub namespace: String,
    /// Cluster the manifests are applied to
    pub cluster: TargetCluster,
}

impl Target {
    /// Target the runtime cluster
    pub fn runtime(
        role: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            role: role.into(),
            name: name.into(),
            namespace: namespace.into(),
            cluster: TargetCluster::Runtime,
        }
    }

    /// Target a remote cluster
    pub fn remote(
        role: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        kubeconfig_secret: impl Into<String>,
    ) -> Self {
        Self {
            role: role.into(),
            name: name.into(),
            namespace: namespace.into(),
            cluster: TargetCluster::Remote {
                kubeconfig_secret: kubeconfig_secret.into(),
            },
        }
    }

    /// `<namespace>/<name>` of the bundle object
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Label selector matching this target's payload Secrets
    pub fn payload_selector(&self) -> String {
        format!("{}={}", LABEL_BUNDLE, self.name)
    }
}

/// Desired lifecycle of a bundle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Lifecycle {
    /// The bundle should exist with the given payload
    #[default]
    Present,
    /// The bundle should be removed
    Absent,
}

/// A named set of rendered manifests destined for one target
#[derive(Clone, Debug, PartialEq)]
pub struct Bundle {
    /// Where the manifests go
    pub target: Target,
    /// Manifest file key -> serialized manifest (opaque to the engine)
    pub payload: BTreeMap<String, Vec<u8>>,
    /// Whether the bundle should exist
    pub lifecycle: Lifecycle,
    /// Component that owns the bundle (set as origin label)
    pub origin: Option<String>,
}

impl Bundle {
    /// A bundle that should exist with `payload`
    pub fn new(target: Target, payload: BTreeMap<String, Vec<u8>>) -> Self {
        Self {
            target,
            payload,
            lifecycle: Lifecycle::Present,
            origin: None,
        }
    }

    /// A bundle that should not exist
    pub fn absent(target: Target) -> Self {
        Self {
            target,
            payload: BTreeMap::new(),
            lifecycle: Lifecycle::Absent,
            origin: None,
        }
    }

    /// Record the owning component
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        if let Some(origin) = &self.origin {
            labels.insert(LABEL_ORIGIN.to_string(), origin.clone());
        }
        labels
    }

    /// Build the content-addressed, immutable Secret holding the payload.
    ///
    /// The Secret is named `managedbundle-<bundle>-<hash8>`; any change to the
    /// payload yields a new name.
    pub fn payload_secret(&self) -> Result<Secret, Error> {
        let mut labels = self.labels();
        labels.insert(LABEL_BUNDLE.to_string(), self.target.name.clone());

        let mut secret = Secret {
            metadata: ObjectMeta {
                name: Some(format!("{}{}", BUNDLE_SECRET_PREFIX, self.target.name)),
                namespace: Some(self.target.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            data: Some(
                self.payload
                    .iter()
                    .map(|(k, v)| (k.clone(), ByteString(v.clone())))
                    .collect(),
            ),
            ..Default::default()
        };
        make_unique_secret(&mut secret)?;
        Ok(secret)
    }

    /// Build the ManagedBundle object referencing the payload Secret
    pub fn managed_bundle(&self, payload_secret: &str) -> ManagedBundle {
        let (class, kubeconfig_secret_ref) = match &self.target.cluster {
            TargetCluster::Runtime => (Some(SEED_CLASS.to_string()), None),
            TargetCluster::Remote { kubeconfig_secret } => {
                (None, Some(SecretReference::new(kubeconfig_secret.clone())))
            }
        };

        let mut bundle = ManagedBundle::new(
            &self.target.name,
            ManagedBundleSpec {
                class,
                secret_refs: vec![SecretReference::new(payload_secret)],
                kubeconfig_secret_ref,
                keep_objects: None,
            },
        );
        bundle.metadata.namespace = Some(self.target.namespace.clone());
        let labels = self.labels();
        if !labels.is_empty() {
            bundle.metadata.labels = Some(labels);
        }
        bundle
    }
}
