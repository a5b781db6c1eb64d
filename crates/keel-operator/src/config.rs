//! Command line and environment configuration

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use keel_common::retry::RetryPolicy;
use keel_common::telemetry::{LogConfig, LogFormat};

/// keel - bundle-driven lifecycle management for seed and virtual clusters
#[derive(Parser, Debug)]
#[command(name = "keel-operator", version, about, long_about = None)]
pub struct Cli {
    /// Kubeconfig of the runtime (seed) cluster; in-cluster config when unset
    #[arg(long, env = "KEEL_KUBECONFIG", global = true)]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig of the garden cluster; defaults to the runtime cluster
    #[arg(long, env = "KEEL_GARDEN_KUBECONFIG", global = true)]
    pub garden_kubeconfig: Option<PathBuf>,

    /// Namespace of component bundles and shoot protocol ConfigMaps
    #[arg(long, env = "KEEL_NAMESPACE", default_value = "garden", global = true)]
    pub namespace: String,

    /// Log line format (json or text)
    #[arg(long, env = "KEEL_LOG_FORMAT", default_value = "json", global = true)]
    pub log_format: LogFormat,

    /// Seconds between two polls of a bundle
    #[arg(long, env = "KEEL_WAIT_INTERVAL_SECS", default_value_t = 2, global = true)]
    pub wait_interval_secs: u64,

    /// Upper bound in seconds for waiting on convergence or cleanup
    #[arg(long, env = "KEEL_WAIT_TIMEOUT_SECS", default_value_t = 300, global = true)]
    pub wait_timeout_secs: u64,

    /// Maximum polls per bundle (0 = bounded by the timeout only)
    #[arg(long, env = "KEEL_MAX_ATTEMPTS", default_value_t = 0, global = true)]
    pub max_attempts: u32,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Run the shoot protocol controller
    Controller,
    /// Print the CRD manifests and exit
    Crd,
    /// Manage the admission controller component
    Admission {
        /// YAML file with admission controller values
        #[arg(long, env = "KEEL_ADMISSION_VALUES")]
        values: Option<PathBuf>,

        #[command(subcommand)]
        action: AdmissionAction,
    },
}

/// Lifecycle actions of a component
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionAction {
    /// Deploy and wait until healthy
    Deploy,
    /// Destroy and wait until cleaned up
    Destroy,
}

impl Cli {
    /// Retry policy injected into components
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_secs(self.wait_interval_secs),
        )
    }

    /// Bound of a single wait or cleanup wait
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    /// Logging setup
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            format: self.log_format,
            default_filter: None,
        }
    }
}
