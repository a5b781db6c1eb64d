//! Shoot protocol controller
//!
//! Records the `resourceVersion` of every Shoot in the garden cluster into a
//! ConfigMap `shoot-protocol--<namespace>--<name>` in the runtime cluster.
//! Deleting such a ConfigMap re-enqueues its Shoot, so the record is
//! recreated. ConfigMaps whose name does not split into exactly three parts,
//! or that point at a Shoot which does not exist, are never written.
//!
//! The ConfigMap watch maps every event, not only deletions, back to the
//! Shoot. The controller's own write therefore triggers one more reconcile,
//! whose apply carries identical content and is a no-op on the API server.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::Patch;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, info, instrument};

#[cfg(test)]
use mockall::automock;

use keel_bundle::bundle::LABEL_ORIGIN;
use keel_common::crd::Shoot;
use keel_common::kube_utils::apply_params;
use keel_common::Error;

/// Name of the controller, also used as origin label value
pub const CONTROLLER_NAME: &str = "shoot-protocol";

/// Prefix of every protocol ConfigMap
pub const PROTOCOL_PREFIX: &str = "shoot-protocol--";

/// ConfigMap key holding the recorded resource version
pub const KEY_RESOURCE_VERSION: &str = "resourceVersion";

const SEPARATOR: &str = "--";

/// Name of the protocol ConfigMap of a Shoot
pub fn protocol_config_map_name(shoot_namespace: &str, shoot_name: &str) -> String {
    format!("{}{}{}{}", PROTOCOL_PREFIX, shoot_namespace, SEPARATOR, shoot_name)
}

/// Shoot namespace and name encoded in a protocol ConfigMap name.
///
/// `None` unless the name has the protocol prefix and splits into exactly
/// three `--`-separated parts.
pub fn parse_protocol_config_map_name(name: &str) -> Option<(&str, &str)> {
    if !name.starts_with(PROTOCOL_PREFIX) {
        return None;
    }
    let parts: Vec<&str> = name.split(SEPARATOR).collect();
    match parts.as_slice() {
        [_, namespace, shoot] if !namespace.is_empty() && !shoot.is_empty() => {
            Some((namespace, shoot))
        }
        _ => None,
    }
}

/// Map a ConfigMap event to the Shoot it records
pub fn shoot_for_config_map(config_map: ConfigMap) -> Option<ObjectRef<Shoot>> {
    let name = config_map.name_any();
    let (namespace, shoot) = parse_protocol_config_map_name(&name)?;
    Some(ObjectRef::new(shoot).within(namespace))
}

/// Protocol ConfigMap recording `resource_version`
pub fn protocol_config_map(
    namespace: &str,
    shoot_namespace: &str,
    shoot_name: &str,
    resource_version: &str,
) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(protocol_config_map_name(shoot_namespace, shoot_name)),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                LABEL_ORIGIN.to_string(),
                CONTROLLER_NAME.to_string(),
            )])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            KEY_RESOURCE_VERSION.to_string(),
            resource_version.to_string(),
        )])),
        ..Default::default()
    }
}

/// Trait abstracting the reads and writes of the protocol controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProtocolStore: Send + Sync {
    /// Read a Shoot from the garden cluster, `None` if it does not exist
    async fn get_shoot(&self, namespace: &str, name: &str) -> Result<Option<Shoot>, Error>;

    /// Create or update a protocol ConfigMap in the runtime cluster
    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<(), Error>;
}

/// Real implementation backed by a garden and a runtime cluster client
pub struct KubeProtocolStore {
    garden: Client,
    runtime: Client,
}

impl KubeProtocolStore {
    /// Create a store from garden and runtime clients
    pub fn new(garden: Client, runtime: Client) -> Self {
        Self { garden, runtime }
    }
}

#[async_trait]
impl ProtocolStore for KubeProtocolStore {
    async fn get_shoot(&self, namespace: &str, name: &str) -> Result<Option<Shoot>, Error> {
        let api: Api<Shoot> = Api::namespaced(self.garden.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<(), Error> {
        let name = config_map.name_any();
        let namespace = config_map.namespace().unwrap_or_default();
        let api: Api<ConfigMap> = Api::namespaced(self.runtime.clone(), &namespace);
        api.patch(&name, &apply_params(), &Patch::Apply(config_map))
            .await
            .map_err(|e| Error::submission("ConfigMap", &namespace, &name, e))?;
        Ok(())
    }
}

/// Controller context
pub struct Context {
    /// Cluster access
    pub store: Arc<dyn ProtocolStore>,
    /// Namespace of the protocol ConfigMaps
    pub namespace: String,
}

impl Context {
    /// Create a context writing protocol ConfigMaps into `namespace`
    pub fn new(store: Arc<dyn ProtocolStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }
}

/// Record the current resource version of `shoot`
#[instrument(skip(shoot, ctx), fields(shoot = %shoot.name_any(), shoot_namespace = %shoot.namespace().unwrap_or_default()))]
pub async fn reconcile(shoot: Arc<Shoot>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = shoot.name_any();
    let Some(namespace) = shoot.namespace() else {
        return Ok(Action::await_change());
    };

    let Some(current) = ctx.store.get_shoot(&namespace, &name).await? else {
        debug!("shoot is gone, nothing to record");
        return Ok(Action::await_change());
    };

    let resource_version = current.resource_version().unwrap_or_default();
    let config_map = protocol_config_map(&ctx.namespace, &namespace, &name, &resource_version);
    ctx.store.apply_config_map(&config_map).await?;

    info!(resource_version = %resource_version, "recorded shoot resource version");
    Ok(Action::await_change())
}

/// Requeue failed reconciliations after a fixed delay
pub fn error_policy(shoot: Arc<Shoot>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        shoot = %shoot.name_any(),
        "shoot protocol reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}
