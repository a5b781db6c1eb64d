//! One-shot lifecycle runs of the admission controller component

use std::path::Path;

use tracing::info;

use keel_admission::AdmissionValues;
use keel_bundle::DeployWaiter;
use keel_common::{Error, OperationContext};

use crate::config::AdmissionAction;

/// Load values from a YAML file, defaults when no file is given
pub fn load_values(path: Option<&Path>) -> Result<AdmissionValues, Error> {
    let Some(path) = path else {
        return Ok(AdmissionValues::default());
    };
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::internal_with_context(
            "load_values",
            format!("failed to read {}: {}", path.display(), e),
        )
    })?;
    AdmissionValues::from_yaml(&content)
}

/// Deploy then wait, or destroy then wait for cleanup
pub async fn run(
    component: &dyn DeployWaiter,
    action: AdmissionAction,
    ctx: &OperationContext,
) -> Result<(), Error> {
    match action {
        AdmissionAction::Deploy => {
            component.deploy(ctx).await?;
            component.wait(ctx).await?;
            info!("admission controller is healthy");
        }
        AdmissionAction::Destroy => {
            component.destroy(ctx).await?;
            component.wait_cleanup(ctx).await?;
            info!("admission controller is gone");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;

    use keel_admission::AdmissionController;
    use keel_bundle::fake::FakeBundleClient;
    use keel_common::retry::RetryPolicy;

    fn controller(fake: &Arc<FakeBundleClient>) -> AdmissionController {
        AdmissionController::new(
            fake.clone(),
            "garden",
            AdmissionValues::default(),
            RetryPolicy::until_deadline(Duration::from_secs(1)),
        )
        .with_timeout(Duration::from_secs(10))
    }

    #[test]
    fn test_load_values_defaults_without_file() {
        assert_eq!(load_values(None).unwrap(), AdmissionValues::default());
    }

    #[test]
    fn test_load_values_reports_missing_file() {
        let err = load_values(Some(Path::new("/nonexistent/values.yaml"))).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/values.yaml"));
    }

    #[test]
    fn test_load_values_from_file() {
        let path = std::env::temp_dir().join(format!("keel-values-{}.yaml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "replicas: 3\nlogLevel: debug").unwrap();

        let values = load_values(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(values.replicas, 3);
        assert_eq!(values.log_level, "debug");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deploy_then_destroy() {
        let fake = Arc::new(FakeBundleClient::new());
        let component = controller(&fake);
        let ctx = OperationContext::background();

        let applier = {
            let fake = fake.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                fake.converge_all();
            })
        };
        run(&component, AdmissionAction::Deploy, &ctx).await.unwrap();
        applier.await.unwrap();
        assert_eq!(fake.bundle_count(), 2);

        run(&component, AdmissionAction::Destroy, &ctx).await.unwrap();
        assert_eq!(fake.bundle_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deploy_times_out_without_applier() {
        let fake = Arc::new(FakeBundleClient::new());
        let component = controller(&fake);

        let err = run(
            &component,
            AdmissionAction::Deploy,
            &OperationContext::background(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.errors().map(|e| e.len()), Some(2));
    }
}
