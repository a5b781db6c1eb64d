//! Bundle deployment and convergence engine
//!
//! A component renders its manifests into [`Bundle`]s, one per [`Target`],
//! and hands them to a [`BundleSet`]. The set upserts them as `ManagedBundle`
//! objects for the out-of-process applier, then polls their conditions until
//! every target converges (or, on teardown, disappears).
//!
//! # Lifecycle
//!
//! ```text
//! deploy ──► wait            (Applied=True && Healthy=True per target)
//! destroy ─► wait_cleanup    (bundle not found per target)
//! ```
//!
//! Waits run concurrently across targets and never short-circuit; failures
//! come back as one aggregate entry per failed target, in declaration order.

pub mod bundle;
pub mod client;
pub mod deploy_waiter;
pub mod fake;
pub mod health;
pub mod registry;
pub mod wait;

pub use bundle::{Bundle, Lifecycle, Target, TargetCluster};
pub use client::{BundleClient, KubeBundleClient};
pub use deploy_waiter::{BundleSet, DeployWaiter};
pub use registry::{manifest_key, ManifestRegistry};
