//! Common types for keel: errors, retry engine, naming, CRDs and utilities

#![deny(missing_docs)]

pub mod context;
pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod naming;
pub mod retry;
pub mod telemetry;

pub use context::OperationContext;
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every server-side apply issued by keel
pub const FIELD_MANAGER: &str = "keel-controller";

/// Applier class of bundles targeting the runtime (seed) cluster
pub const SEED_CLASS: &str = "seed";
