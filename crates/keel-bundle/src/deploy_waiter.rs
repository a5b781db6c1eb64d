//! The lifecycle contract of every managed component
//!
//! Components implement [`DeployWaiter`] by holding a private [`BundleSet`]
//! and delegating to it; the set owns the declared targets, the retry policy
//! and the client, and runs the shared submission/wait engine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info, instrument};

use keel_common::retry::RetryPolicy;
use keel_common::{Error, OperationContext};

use crate::bundle::{Bundle, Lifecycle, Target};
use crate::client::BundleClient;
use crate::wait::{wait_all, wait_until_deleted, wait_until_healthy};

/// Uniform lifecycle of a managed component
#[async_trait]
pub trait DeployWaiter: Send + Sync {
    /// Render and submit the bundles of every target. Does not wait.
    async fn deploy(&self, ctx: &OperationContext) -> Result<(), Error>;

    /// Wait until every target's bundle is applied and healthy
    async fn wait(&self, ctx: &OperationContext) -> Result<(), Error>;

    /// Request deletion of every target's bundle and owned ancillary objects
    async fn destroy(&self, ctx: &OperationContext) -> Result<(), Error>;

    /// Wait until every target's bundle is gone
    async fn wait_cleanup(&self, ctx: &OperationContext) -> Result<(), Error>;
}

/// Fail fast when the caller's context is already done
pub fn ensure_live(ctx: &OperationContext, operation: &str) -> Result<(), Error> {
    match ctx.err() {
        Some(cause) => Err(Error::internal_with_context(
            operation,
            format!("{} before submission", cause),
        )),
        None => Ok(()),
    }
}

/// Surface submission failures: a single failure untouched, several joined
pub fn submission_result(mut errors: Vec<Error>) -> Result<(), Error> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Error::join(errors),
    }
}

/// Bound of a single `wait` or `wait_cleanup` unless overridden
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// The declared targets of one component and the engine driving them
pub struct BundleSet {
    client: Arc<dyn BundleClient>,
    targets: Vec<Target>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl BundleSet {
    /// Create a set over `targets`, polled according to `policy`
    pub fn new(client: Arc<dyn BundleClient>, targets: Vec<Target>, policy: RetryPolicy) -> Self {
        Self {
            client,
            targets,
            policy,
            timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }

    /// Bound every wait by `timeout` instead of [`DEFAULT_WAIT_TIMEOUT`].
    ///
    /// The caller's context still applies; the earlier deadline wins.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Declared targets, in declaration order
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Client used for every API call of this set
    pub fn client(&self) -> &dyn BundleClient {
        self.client.as_ref()
    }

    fn scoped(&self, ctx: &OperationContext) -> OperationContext {
        ctx.with_timeout(self.timeout)
    }

    /// Submit `bundles` concurrently.
    ///
    /// Present bundles get their payload Secret and ManagedBundle upserted;
    /// absent ones are deleted. Every bundle must belong to a declared target
    /// and no target may receive more than one bundle.
    #[instrument(skip(self, ctx, bundles), fields(bundles = bundles.len()))]
    pub async fn deploy(&self, ctx: &OperationContext, bundles: Vec<Bundle>) -> Result<(), Error> {
        ensure_live(ctx, "deploy")?;

        let mut seen: Vec<&Target> = Vec::with_capacity(bundles.len());
        for bundle in &bundles {
            if !self.targets.contains(&bundle.target) {
                return Err(Error::validation_for(
                    bundle.target.qualified_name(),
                    "bundle does not belong to a declared target",
                ));
            }
            if seen.contains(&&bundle.target) {
                return Err(Error::validation_for(
                    bundle.target.qualified_name(),
                    "more than one bundle for the same target",
                ));
            }
            seen.push(&bundle.target);
        }

        let results = join_all(bundles.iter().map(|bundle| self.submit(bundle))).await;
        submission_result(results.into_iter().filter_map(Result::err).collect())?;

        info!("submitted bundles");
        Ok(())
    }

    async fn submit(&self, bundle: &Bundle) -> Result<(), Error> {
        match bundle.lifecycle {
            Lifecycle::Present => {
                let secret = bundle.payload_secret()?;
                let secret_name = secret.metadata.name.clone().unwrap_or_default();
                self.client.apply_secret(&secret).await?;
                self.client
                    .apply_bundle(&bundle.managed_bundle(&secret_name))
                    .await?;
                debug!(
                    bundle = %bundle.target.qualified_name(),
                    payload = %secret_name,
                    manifests = bundle.payload.len(),
                    "upserted bundle"
                );
                Ok(())
            }
            Lifecycle::Absent => self.remove(&bundle.target).await,
        }
    }

    async fn remove(&self, target: &Target) -> Result<(), Error> {
        self.client
            .delete_bundle(&target.namespace, &target.name)
            .await?;
        let payloads = self
            .client
            .list_secret_names(&target.namespace, &target.payload_selector())
            .await?;
        for name in payloads {
            self.client.delete_secret(&target.namespace, &name).await?;
        }
        debug!(bundle = %target.qualified_name(), "requested bundle deletion");
        Ok(())
    }

    /// Wait for every target to converge
    #[instrument(skip(self, ctx), fields(targets = self.targets.len()))]
    pub async fn wait(&self, ctx: &OperationContext) -> Result<(), Error> {
        let ctx = self.scoped(ctx);
        let client = self.client.as_ref();
        wait_all(&self.targets, |target| {
            wait_until_healthy(&ctx, client, &self.policy, target)
        })
        .await?;
        info!("all bundles healthy");
        Ok(())
    }

    /// Delete the bundle and payload Secrets of every target
    #[instrument(skip(self, ctx), fields(targets = self.targets.len()))]
    pub async fn destroy(&self, ctx: &OperationContext) -> Result<(), Error> {
        ensure_live(ctx, "destroy")?;
        let results = join_all(self.targets.iter().map(|target| self.remove(target))).await;
        submission_result(results.into_iter().filter_map(Result::err).collect())?;
        info!("requested deletion of all bundles");
        Ok(())
    }

    /// Wait for every target's bundle to disappear
    #[instrument(skip(self, ctx), fields(targets = self.targets.len()))]
    pub async fn wait_cleanup(&self, ctx: &OperationContext) -> Result<(), Error> {
        let ctx = self.scoped(ctx);
        let client = self.client.as_ref();
        wait_all(&self.targets, |target| {
            wait_until_deleted(&ctx, client, &self.policy, target)
        })
        .await?;
        info!("all bundles deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockBundleClient;
    use crate::fake::FakeBundleClient;
    use keel_common::crd::ConditionStatus;
    use std::collections::BTreeMap;

    fn targets() -> Vec<Target> {
        vec![
            Target::runtime("runtime", "garden", "comp-runtime"),
            Target::remote("virtual", "garden", "comp-virtual", "generic-token-kubeconfig"),
        ]
    }

    fn payload(content: &str) -> BTreeMap<String, Vec<u8>> {
        BTreeMap::from([("k.yaml".to_string(), content.as_bytes().to_vec())])
    }

    fn bundles(content: &str) -> Vec<Bundle> {
        targets()
            .into_iter()
            .map(|t| Bundle::new(t, payload(content)))
            .collect()
    }

    fn set(fake: &Arc<FakeBundleClient>) -> BundleSet {
        BundleSet::new(fake.clone(), targets(), RetryPolicy::fake(2))
    }

    fn forbidden() -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "forbidden".to_string(),
            reason: "Forbidden".to_string(),
            code: 403,
        })
    }

    #[tokio::test]
    async fn test_deploy_is_idempotent() {
        let fake = Arc::new(FakeBundleClient::new());
        let set = set(&fake);
        let ctx = OperationContext::background();

        set.deploy(&ctx, bundles("a")).await.unwrap();
        let first = fake.bundle("garden", "comp-runtime").unwrap();
        set.deploy(&ctx, bundles("a")).await.unwrap();
        let second = fake.bundle("garden", "comp-runtime").unwrap();

        assert_eq!(first.spec, second.spec);
        assert_eq!(second.metadata.generation, Some(1));
        assert_eq!(fake.secret_names("garden").len(), 2);
    }

    #[tokio::test]
    async fn test_changed_payload_gets_new_secret() {
        let fake = Arc::new(FakeBundleClient::new());
        let set = set(&fake);
        let ctx = OperationContext::background();

        set.deploy(&ctx, bundles("a")).await.unwrap();
        let before = fake.bundle("garden", "comp-runtime").unwrap().spec.secret_refs;
        set.deploy(&ctx, bundles("b")).await.unwrap();
        let after = fake.bundle("garden", "comp-runtime").unwrap();

        assert_ne!(before, after.spec.secret_refs);
        assert_eq!(after.metadata.generation, Some(2));
        // old payloads stay behind for the garbage collector
        assert_eq!(fake.secret_names("garden").len(), 4);
    }

    #[tokio::test]
    async fn test_deploy_then_wait() {
        let fake = Arc::new(FakeBundleClient::new());
        let set = set(&fake);
        let ctx = OperationContext::background();

        set.deploy(&ctx, bundles("a")).await.unwrap();
        assert!(set.wait(&ctx).await.is_err());

        fake.converge_all();
        set.wait(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_reports_only_the_failing_target() {
        let fake = Arc::new(FakeBundleClient::new());
        let set = set(&fake);
        let ctx = OperationContext::background();

        set.deploy(&ctx, bundles("a")).await.unwrap();
        fake.set_conditions("garden", "comp-runtime", ConditionStatus::True, ConditionStatus::True);
        fake.set_conditions("garden", "comp-virtual", ConditionStatus::True, ConditionStatus::False);

        let err = set.wait(&ctx).await.unwrap_err();
        let entries = err.errors().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].to_string(),
            "retry failed with max attempts reached, last error: managed resource garden/comp-virtual is not healthy"
        );
    }

    #[tokio::test]
    async fn test_absent_bundle_is_removed_on_deploy() {
        let fake = Arc::new(FakeBundleClient::new());
        let set = set(&fake);
        let ctx = OperationContext::background();
        set.deploy(&ctx, bundles("a")).await.unwrap();

        let mut next = bundles("a");
        next[1] = Bundle::absent(targets()[1].clone());
        set.deploy(&ctx, next).await.unwrap();

        assert!(fake.bundle("garden", "comp-runtime").is_some());
        assert!(fake.bundle("garden", "comp-virtual").is_none());
        assert_eq!(fake.secret_names("garden").len(), 1);
    }

    #[tokio::test]
    async fn test_undeclared_target_is_rejected() {
        let fake = Arc::new(FakeBundleClient::new());
        let set = set(&fake);
        let stray = Bundle::new(Target::runtime("other", "garden", "stray"), payload("a"));

        let err = set
            .deploy(&OperationContext::background(), vec![stray])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(fake.bundle_count(), 0);
    }

    #[tokio::test]
    async fn test_single_submission_error_is_not_wrapped() {
        let fake = Arc::new(FakeBundleClient::new());
        fake.reject_writes("garden", "comp-virtual");
        let set = set(&fake);

        let err = set
            .deploy(&OperationContext::background(), bundles("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Submission { .. }));
        assert!(err.to_string().contains("ManagedBundle garden/comp-virtual"));
    }

    #[tokio::test]
    async fn test_submission_errors_are_not_retried() {
        let mut mock = MockBundleClient::new();
        mock.expect_apply_secret()
            .times(2)
            .returning(|_| Err(Error::submission("Secret", "garden", "x", forbidden())));
        mock.expect_apply_bundle().never();

        let set = BundleSet::new(Arc::new(mock), targets(), RetryPolicy::fake(5));
        let err = set
            .deploy(&OperationContext::background(), bundles("a"))
            .await
            .unwrap_err();
        assert_eq!(err.errors().map(<[Error]>::len), Some(2));
    }

    #[tokio::test]
    async fn test_cancelled_context_submits_nothing() {
        let fake = Arc::new(FakeBundleClient::new());
        let set = set(&fake);
        let ctx = OperationContext::background();
        ctx.cancel();

        let err = set.deploy(&ctx, bundles("a")).await.unwrap_err();
        assert!(err.to_string().contains("context canceled"));
        assert_eq!(fake.bundle_count(), 0);
    }

    #[tokio::test]
    async fn test_destroy_and_wait_cleanup() {
        let fake = Arc::new(FakeBundleClient::new());
        let set = set(&fake);
        let ctx = OperationContext::background();

        set.deploy(&ctx, bundles("a")).await.unwrap();
        set.destroy(&ctx).await.unwrap();
        assert_eq!(fake.bundle_count(), 0);
        assert!(fake.secret_names("garden").is_empty());

        set.wait_cleanup(&ctx).await.unwrap();
        // idempotent
        set.destroy(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_cleanup_reports_lingering_bundle() {
        let fake = Arc::new(FakeBundleClient::new());
        let set = set(&fake);
        let ctx = OperationContext::background();
        set.deploy(&ctx, vec![Bundle::new(targets()[0].clone(), payload("a"))])
            .await
            .unwrap();

        let err = set.wait_cleanup(&ctx).await.unwrap_err();
        let entries = err.errors().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].to_string(),
            "retry failed with max attempts reached, last error: resource garden/comp-runtime still exists"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_timeout_bounds_wait() {
        let fake = Arc::new(FakeBundleClient::new());
        let set = BundleSet::new(
            fake.clone(),
            targets(),
            RetryPolicy::until_deadline(Duration::from_secs(1)),
        )
        .with_timeout(Duration::from_secs(3));

        let err = set
            .wait(&OperationContext::background())
            .await
            .unwrap_err();
        assert_eq!(err.errors().map(<[Error]>::len), Some(2));
        assert!(err.to_string().contains("context deadline exceeded"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_policy_wait_is_bounded() {
        let fake = Arc::new(FakeBundleClient::new());
        let set = BundleSet::new(fake.clone(), targets(), RetryPolicy::default());
        let ctx = OperationContext::background();
        set.deploy(&ctx, bundles("a")).await.unwrap();

        let started = tokio::time::Instant::now();
        let err = tokio::time::timeout(Duration::from_secs(24 * 60 * 60), set.wait(&ctx))
            .await
            .expect("wait must give up on its own")
            .unwrap_err();

        assert!(started.elapsed() <= DEFAULT_WAIT_TIMEOUT + Duration::from_secs(2));
        let entries = err.errors().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries
            .iter()
            .all(|e| e.to_string().starts_with("retry failed with context deadline exceeded")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_policy_wait_cleanup_is_bounded() {
        let fake = Arc::new(FakeBundleClient::new());
        let set = BundleSet::new(fake.clone(), targets(), RetryPolicy::default());
        let ctx = OperationContext::background();
        set.deploy(&ctx, bundles("a")).await.unwrap();

        let err = tokio::time::timeout(Duration::from_secs(24 * 60 * 60), set.wait_cleanup(&ctx))
            .await
            .expect("wait_cleanup must give up on its own")
            .unwrap_err();
        assert_eq!(err.errors().map(<[Error]>::len), Some(2));
    }

    #[tokio::test]
    async fn test_duplicate_target_is_rejected() {
        let fake = Arc::new(FakeBundleClient::new());
        let set = set(&fake);
        let twice = vec![
            Bundle::new(targets()[0].clone(), payload("a")),
            Bundle::new(targets()[0].clone(), payload("b")),
        ];

        let err = set
            .deploy(&OperationContext::background(), twice)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(err.to_string().contains("more than one bundle"));
        assert_eq!(fake.bundle_count(), 0);
        assert!(fake.secret_names("garden").is_empty());
    }
}
