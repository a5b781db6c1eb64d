//! Kubernetes access for bundle objects and their payload Secrets
//!
//! The engine only ever writes bundle specs and payloads and reads bundle
//! status. Everything goes through [`BundleClient`] so components and tests
//! can swap the API server for [`crate::fake::FakeBundleClient`].

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{ListParams, ObjectMeta, Patch};
use kube::{Api, Client};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use keel_common::crd::ManagedBundle;
use keel_common::kube_utils::{apply_params, background_delete, is_not_found};
use keel_common::Error;

/// Trait abstracting the API calls the bundle engine makes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BundleClient: Send + Sync {
    /// Create or update a Secret (server-side apply)
    async fn apply_secret(&self, secret: &Secret) -> Result<(), Error>;

    /// Names of the Secrets in `namespace` matching `label_selector`
    async fn list_secret_names(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<String>, Error>;

    /// Delete a Secret. Deleting a missing Secret succeeds.
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Create or update a ManagedBundle spec (server-side apply)
    async fn apply_bundle(&self, bundle: &ManagedBundle) -> Result<(), Error>;

    /// Read a ManagedBundle, `None` if it does not exist
    async fn get_bundle(&self, namespace: &str, name: &str)
        -> Result<Option<ManagedBundle>, Error>;

    /// Delete a ManagedBundle. Deleting a missing bundle succeeds.
    async fn delete_bundle(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Extract namespace and name of an object about to be written
pub(crate) fn identity(kind: &str, meta: &ObjectMeta) -> Result<(String, String), Error> {
    let name = meta
        .name
        .clone()
        .ok_or_else(|| Error::validation_for(kind, "object has no name"))?;
    let namespace = meta
        .namespace
        .clone()
        .ok_or_else(|| Error::validation_for(kind, format!("{} has no namespace", name)))?;
    Ok((namespace, name))
}

/// Real implementation backed by a kube client
pub struct KubeBundleClient {
    client: Client,
}

impl KubeBundleClient {
    /// Create a new KubeBundleClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BundleClient for KubeBundleClient {
    async fn apply_secret(&self, secret: &Secret) -> Result<(), Error> {
        let (namespace, name) = identity("Secret", &secret.metadata)?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        api.patch(&name, &apply_params(), &Patch::Apply(secret))
            .await
            .map_err(|e| Error::submission("Secret", &namespace, &name, e))?;
        debug!(secret = %name, namespace = %namespace, "applied secret");
        Ok(())
    }

    async fn list_secret_names(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<String>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secrets = api
            .list_metadata(&ListParams::default().labels(label_selector))
            .await?;
        Ok(secrets
            .items
            .into_iter()
            .filter_map(|s| s.metadata.name)
            .collect())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &background_delete()).await {
            Ok(_) => {
                debug!(secret = %name, namespace = %namespace, "deleted secret");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(Error::submission("Secret", namespace, name, e)),
        }
    }

    async fn apply_bundle(&self, bundle: &ManagedBundle) -> Result<(), Error> {
        let (namespace, name) = identity("ManagedBundle", &bundle.metadata)?;
        let api: Api<ManagedBundle> = Api::namespaced(self.client.clone(), &namespace);
        api.patch(&name, &apply_params(), &Patch::Apply(bundle))
            .await
            .map_err(|e| Error::submission("ManagedBundle", &namespace, &name, e))?;
        debug!(bundle = %name, namespace = %namespace, "applied managed bundle");
        Ok(())
    }

    async fn get_bundle(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ManagedBundle>, Error> {
        let api: Api<ManagedBundle> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn delete_bundle(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<ManagedBundle> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &background_delete()).await {
            Ok(_) => {
                debug!(bundle = %name, namespace = %namespace, "deleted managed bundle");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(Error::submission("ManagedBundle", namespace, name, e)),
        }
    }
}
