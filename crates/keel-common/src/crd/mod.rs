//! Custom Resource Definitions for keel
//!
//! `ManagedBundle` is the contract with the out-of-process applier; `Shoot`
//! is the garden-cluster object the protocol controller follows.

mod bundle;
mod shoot;
mod types;

pub use bundle::{
    ManagedBundle, ManagedBundleSpec, ManagedBundleStatus, SecretReference,
    MANAGED_BUNDLE_RESOURCE,
};
pub use shoot::{Machine, Shoot, ShootKubernetes, ShootProvider, ShootSpec, Worker};
pub use types::{
    find_condition, Condition, ConditionStatus, CONDITION_APPLIED, CONDITION_HEALTHY,
};
