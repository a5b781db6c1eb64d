//! Admission controller component
//!
//! Deploys the keel admission controller through two bundles:
//!
//! - `runtime`: configuration ConfigMap, Deployment, Service and
//!   VerticalPodAutoscaler in the runtime cluster. The ConfigMap name
//!   carries a hash of its content, so any configuration change rolls the
//!   Deployment.
//! - `virtual`: RBAC and the ValidatingWebhookConfiguration in the virtual
//!   cluster, reached through the `generic-token-kubeconfig` Secret.
//!
//! A token-requestor access Secret for the controller's service account is
//! created alongside and removed on destroy.

pub mod values;

mod runtime;
mod virtual_cluster;
pub mod vpa;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{info, instrument};

use keel_bundle::deploy_waiter::ensure_live;
use keel_bundle::{Bundle, BundleClient, BundleSet, DeployWaiter, Target};
use keel_common::retry::RetryPolicy;
use keel_common::{Error, OperationContext};

pub use runtime::SERVER_CERT_SECRET_NAME;
pub use values::{AdmissionValues, OperationMode, ResourceAdmissionConfiguration, ResourceLimit};

/// Name shared by the component's workload objects
pub const COMPONENT_NAME: &str = "keel-admission-controller";

/// Bundle holding the runtime cluster objects
pub const BUNDLE_NAME_RUNTIME: &str = "keel-admission-controller-runtime";

/// Bundle holding the virtual cluster objects
pub const BUNDLE_NAME_VIRTUAL: &str = "keel-admission-controller-virtual";

/// Secret with the kubeconfig of the virtual cluster
pub const KUBECONFIG_SECRET_NAME: &str = "generic-token-kubeconfig";

/// Token-requestor Secret for the controller's virtual cluster identity
pub const ACCESS_SECRET_NAME: &str = "shoot-access-keel-admission-controller";

/// Namespace of the controller's service account in the virtual cluster
pub const SERVICE_ACCOUNT_NAMESPACE: &str = "kube-system";

pub(crate) fn labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), "keel".to_string()),
        ("role".to_string(), "admission-controller".to_string()),
    ])
}

/// Access Secret the token requestor fills with a service account token
pub fn access_secret(namespace: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(ACCESS_SECRET_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([
                (
                    "resources.keel.dev/purpose".to_string(),
                    "token-requestor".to_string(),
                ),
                ("resources.keel.dev/class".to_string(), "shoot".to_string()),
            ])),
            annotations: Some(BTreeMap::from([
                (
                    "serviceaccount.resources.keel.dev/name".to_string(),
                    COMPONENT_NAME.to_string(),
                ),
                (
                    "serviceaccount.resources.keel.dev/namespace".to_string(),
                    SERVICE_ACCOUNT_NAMESPACE.to_string(),
                ),
            ])),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

/// The admission controller as a managed component
pub struct AdmissionController {
    namespace: String,
    values: AdmissionValues,
    bundles: BundleSet,
}

impl AdmissionController {
    /// Create the component for `namespace`
    pub fn new(
        client: Arc<dyn BundleClient>,
        namespace: impl Into<String>,
        values: AdmissionValues,
        policy: RetryPolicy,
    ) -> Self {
        let namespace = namespace.into();
        let targets = vec![
            Target::runtime("runtime", &namespace, BUNDLE_NAME_RUNTIME),
            Target::remote(
                "virtual",
                &namespace,
                BUNDLE_NAME_VIRTUAL,
                KUBECONFIG_SECRET_NAME,
            ),
        ];
        Self {
            bundles: BundleSet::new(client, targets, policy),
            namespace,
            values,
        }
    }

    /// Bound `wait` and `wait_cleanup` by `timeout` instead of the five minute default
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.bundles = self.bundles.with_timeout(timeout);
        self
    }

    /// Declared targets (`runtime`, then `virtual`)
    pub fn targets(&self) -> &[Target] {
        self.bundles.targets()
    }

    /// Name the configuration ConfigMap gets for the current values
    pub fn config_map_name(&self) -> Result<String, Error> {
        let (_, name) = runtime::render(&self.namespace, &self.values)?;
        Ok(name)
    }

    /// Render both bundles from the current values
    pub fn render(&self) -> Result<Vec<Bundle>, Error> {
        self.values.validate()?;
        let (runtime_manifests, _) = runtime::render(&self.namespace, &self.values)?;
        let virtual_manifests = virtual_cluster::render(&self.namespace, &self.values)?;

        let mut bundles = Vec::with_capacity(2);
        for (target, payload) in self
            .bundles
            .targets()
            .iter()
            .zip([runtime_manifests.into_payload(), virtual_manifests.into_payload()])
        {
            bundles.push(Bundle::new(target.clone(), payload).with_origin(COMPONENT_NAME));
        }
        Ok(bundles)
    }
}

#[async_trait]
impl DeployWaiter for AdmissionController {
    #[instrument(skip(self, ctx), fields(namespace = %self.namespace))]
    async fn deploy(&self, ctx: &OperationContext) -> Result<(), Error> {
        ensure_live(ctx, "deploy")?;
        let bundles = self.render()?;
        self.bundles
            .client()
            .apply_secret(&access_secret(&self.namespace))
            .await?;
        self.bundles.deploy(ctx, bundles).await?;
        info!("deployed admission controller");
        Ok(())
    }

    async fn wait(&self, ctx: &OperationContext) -> Result<(), Error> {
        self.bundles.wait(ctx).await
    }

    #[instrument(skip(self, ctx), fields(namespace = %self.namespace))]
    async fn destroy(&self, ctx: &OperationContext) -> Result<(), Error> {
        self.bundles.destroy(ctx).await?;
        self.bundles
            .client()
            .delete_secret(&self.namespace, ACCESS_SECRET_NAME)
            .await?;
        info!("destroyed admission controller");
        Ok(())
    }

    async fn wait_cleanup(&self, ctx: &OperationContext) -> Result<(), Error> {
        self.bundles.wait_cleanup(ctx).await
    }
}
