//! keel operator - shoot protocol controller and component lifecycle commands

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, CustomResourceExt};
use k8s_openapi::api::core::v1::ConfigMap;
use tokio_util::sync::CancellationToken;

use keel_admission::AdmissionController;
use keel_bundle::KubeBundleClient;
use keel_common::crd::{ManagedBundle, Shoot};
use keel_common::kube_utils::create_client;
use keel_common::telemetry::init_logging;
use keel_common::OperationContext;
use keel_operator::admission;
use keel_operator::config::{AdmissionAction, Cli, Command};
use keel_operator::protocol::{self, shoot_for_config_map, KubeProtocolStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_logging(cli.log_config())?;

    match &cli.command {
        Command::Crd => print_crds(),
        Command::Controller => run_controller(&cli).await,
        Command::Admission { values, action } => {
            run_admission(&cli, values.as_deref(), *action).await
        }
    }
}

fn print_crds() -> anyhow::Result<()> {
    for crd in [ManagedBundle::crd(), Shoot::crd()] {
        let yaml = serde_yaml::to_string(&crd)
            .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {}", e))?;
        println!("---\n{yaml}");
    }
    Ok(())
}

async fn run_controller(cli: &Cli) -> anyhow::Result<()> {
    let runtime = create_client(cli.kubeconfig.as_deref()).await?;
    let garden = match cli.garden_kubeconfig.as_deref() {
        Some(path) => create_client(Some(path)).await?,
        None => runtime.clone(),
    };

    let ctx = Arc::new(protocol::Context::new(
        Arc::new(KubeProtocolStore::new(garden.clone(), runtime.clone())),
        cli.namespace.clone(),
    ));

    tracing::info!(namespace = %cli.namespace, "starting shoot protocol controller");
    let shoots: Api<Shoot> = Api::all(garden);
    let config_maps: Api<ConfigMap> = Api::namespaced(runtime, &cli.namespace);

    Controller::new(shoots, WatcherConfig::default())
        .watches(config_maps, WatcherConfig::default(), shoot_for_config_map)
        .shutdown_on_signal()
        .run(protocol::reconcile, protocol::error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "reconciliation error"),
            }
        })
        .await;

    tracing::info!("shoot protocol controller stopped");
    Ok(())
}

async fn run_admission(
    cli: &Cli,
    values: Option<&std::path::Path>,
    action: AdmissionAction,
) -> anyhow::Result<()> {
    let values = admission::load_values(values)?;
    let client = create_client(cli.kubeconfig.as_deref()).await?;
    let component = AdmissionController::new(
        Arc::new(KubeBundleClient::new(client)),
        cli.namespace.clone(),
        values,
        cli.retry_policy(),
    )
    .with_timeout(cli.wait_timeout());

    let token = CancellationToken::new();
    let ctx = OperationContext::from_token(token.clone());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling");
            token.cancel();
        }
    });

    admission::run(&component, action, &ctx).await?;
    Ok(())
}
