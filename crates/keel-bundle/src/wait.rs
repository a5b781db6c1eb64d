//! Per-target waits and the multi-target aggregator
//!
//! [`wait_until_healthy`] and [`wait_until_deleted`] poll one bundle through
//! the retry engine. [`wait_all`] fans a wait out over every target, joins
//! them, and reports one entry per failed target in declaration order.

use std::future::Future;

use futures::future::join_all;
use tracing::{debug, warn};

use keel_common::crd::MANAGED_BUNDLE_RESOURCE;
use keel_common::retry::{until, PollResult, RetryPolicy};
use keel_common::{Error, OperationContext};

use crate::bundle::Target;
use crate::client::BundleClient;
use crate::health::check_bundle;

/// Poll `target` until its bundle is applied and healthy.
///
/// A missing bundle counts as not yet converged. Any other read error stops
/// polling and is returned as is.
pub async fn wait_until_healthy(
    ctx: &OperationContext,
    client: &dyn BundleClient,
    policy: &RetryPolicy,
    target: &Target,
) -> Result<(), Error> {
    until(ctx, policy, "wait_until_healthy", move || async move {
        let (namespace, name) = (&target.namespace, &target.name);
        match client.get_bundle(namespace, name).await {
            Ok(Some(bundle)) => match check_bundle(&bundle) {
                Ok(()) => PollResult::Done(()),
                Err(reason) => {
                    debug!(bundle = %name, namespace = %namespace, role = %target.role, %reason, "bundle not converged");
                    PollResult::Retry(Error::unhealthy(namespace, name, reason))
                }
            },
            Ok(None) => PollResult::Retry(Error::not_found(MANAGED_BUNDLE_RESOURCE, namespace, name)),
            Err(e) if e.is_not_found() => {
                PollResult::Retry(Error::not_found(MANAGED_BUNDLE_RESOURCE, namespace, name))
            }
            Err(e) => PollResult::Abort(e),
        }
    })
    .await
}

/// Poll `target` until its bundle no longer exists
pub async fn wait_until_deleted(
    ctx: &OperationContext,
    client: &dyn BundleClient,
    policy: &RetryPolicy,
    target: &Target,
) -> Result<(), Error> {
    until(ctx, policy, "wait_until_deleted", move || async move {
        let (namespace, name) = (&target.namespace, &target.name);
        match client.get_bundle(namespace, name).await {
            Ok(None) => PollResult::Done(()),
            Err(e) if e.is_not_found() => PollResult::Done(()),
            Ok(Some(_)) => PollResult::Retry(Error::still_exists(namespace, name)),
            Err(e) => PollResult::Abort(e),
        }
    })
    .await
}

/// Run `wait` for every target concurrently and join the outcomes.
///
/// Never short-circuits: every target runs to completion. Failures are
/// returned as an [`Error::Aggregate`] ordered like `targets`.
pub async fn wait_all<'a, F, Fut>(targets: &'a [Target], wait: F) -> Result<(), Error>
where
    F: Fn(&'a Target) -> Fut,
    Fut: Future<Output = Result<(), Error>>,
{
    let results = join_all(targets.iter().map(&wait)).await;

    let errors = targets
        .iter()
        .zip(results)
        .filter_map(|(target, result)| match result {
            Ok(()) => None,
            Err(e) => {
                warn!(
                    bundle = %target.qualified_name(),
                    role = %target.role,
                    error = %e,
                    "target did not reach the awaited state"
                );
                Some(e)
            }
        })
        .collect();

    Error::join(errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockBundleClient;
    use crate::fake::FakeBundleClient;
    use keel_common::crd::{ConditionStatus, ManagedBundle, ManagedBundleSpec};
    use std::time::Duration;

    fn stored(namespace: &str, name: &str) -> ManagedBundle {
        let mut mb = ManagedBundle::new(name, ManagedBundleSpec::default());
        mb.metadata.namespace = Some(namespace.to_string());
        mb.metadata.generation = Some(1);
        mb
    }

    fn targets() -> Vec<Target> {
        vec![
            Target::runtime("runtime", "garden", "a"),
            Target::remote("virtual", "garden", "b", "kubeconfig"),
        ]
    }

    fn forbidden() -> Error {
        Error::from(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "forbidden".to_string(),
            reason: "Forbidden".to_string(),
            code: 403,
        }))
    }

    #[tokio::test]
    async fn test_healthy_target_converges_on_first_read() {
        let fake = FakeBundleClient::new();
        fake.insert_bundle(stored("garden", "a"));
        fake.set_conditions("garden", "a", ConditionStatus::True, ConditionStatus::True);

        let target = Target::runtime("runtime", "garden", "a");
        wait_until_healthy(&OperationContext::background(), &fake, &RetryPolicy::fake(2), &target)
            .await
            .unwrap();
        assert_eq!(fake.get_bundle_calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_bundle_is_retried_then_reported() {
        let fake = FakeBundleClient::new();
        let target = Target::runtime("runtime", "garden", "a");

        let err = wait_until_healthy(
            &OperationContext::background(),
            &fake,
            &RetryPolicy::fake(3),
            &target,
        )
        .await
        .unwrap_err();

        assert_eq!(fake.get_bundle_calls(), 3);
        assert_eq!(
            err.to_string(),
            "retry failed with max attempts reached, last error: managedbundles.keel.dev garden/a not found"
        );
    }

    #[tokio::test]
    async fn test_read_error_aborts_without_retry() {
        let mut mock = MockBundleClient::new();
        mock.expect_get_bundle()
            .times(1)
            .returning(|_, _| Err(forbidden()));

        let target = Target::runtime("runtime", "garden", "a");
        let err = wait_until_healthy(
            &OperationContext::background(),
            &mock,
            &RetryPolicy::fake(5),
            &target,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Kube { .. }));
    }

    #[tokio::test]
    async fn test_api_not_found_counts_as_deleted() {
        let mut mock = MockBundleClient::new();
        mock.expect_get_bundle().times(1).returning(|_, _| {
            Err(Error::from(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "not found".to_string(),
                reason: "NotFound".to_string(),
                code: 404,
            })))
        });

        let target = Target::runtime("runtime", "garden", "a");
        wait_until_deleted(
            &OperationContext::background(),
            &mock,
            &RetryPolicy::fake(5),
            &target,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_wait_all_reports_failures_in_declaration_order() {
        let fake = FakeBundleClient::new();
        fake.insert_bundle(stored("garden", "a"));
        fake.insert_bundle(stored("garden", "b"));
        let targets = targets();
        let ctx = OperationContext::background();
        let policy = RetryPolicy::fake(2);

        let err = wait_all(&targets, |t| wait_until_deleted(&ctx, &fake, &policy, t))
            .await
            .unwrap_err();

        let entries = err.errors().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0].to_string(),
            "retry failed with max attempts reached, last error: resource garden/a still exists"
        );
        assert_eq!(
            entries[1].to_string(),
            "retry failed with max attempts reached, last error: resource garden/b still exists"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_all_orders_by_declaration_not_completion() {
        let targets = targets();
        let finished = std::sync::Mutex::new(Vec::new());

        let err = wait_all(&targets, |t| {
            let finished = &finished;
            async move {
                if t.role == "runtime" {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                finished.lock().unwrap().push(t.name.clone());
                Err(Error::still_exists(t.namespace.clone(), t.name.clone()))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(*finished.lock().unwrap(), vec!["b", "a"]);
        let entries = err.errors().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].to_string(), "resource garden/a still exists");
        assert_eq!(entries[1].to_string(), "resource garden/b still exists");
    }

    #[tokio::test]
    async fn test_wait_all_succeeds_when_every_target_does() {
        let fake = FakeBundleClient::new();
        let targets = targets();
        let ctx = OperationContext::background();
        let policy = RetryPolicy::fake(2);

        wait_all(&targets, |t| wait_until_deleted(&ctx, &fake, &policy, t))
            .await
            .unwrap();
        assert_eq!(fake.get_bundle_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_every_target() {
        let fake = FakeBundleClient::new();
        let targets = targets();
        let ctx = OperationContext::background().with_timeout(Duration::from_secs(5));
        let policy = RetryPolicy::until_deadline(Duration::from_secs(1));

        let err = wait_all(&targets, |t| wait_until_healthy(&ctx, &fake, &policy, t))
            .await
            .unwrap_err();

        let entries = err.errors().unwrap();
        assert_eq!(entries.len(), 2);
        for entry in entries {
            assert!(entry
                .to_string()
                .starts_with("retry failed with context deadline exceeded, last error:"));
        }
    }
}
