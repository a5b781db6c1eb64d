//! Convergence evaluation of a single bundle read
//!
//! A bundle is converged iff, in the same read, its status describes the
//! current spec generation and both `Applied` and `Healthy` are `True`. No
//! past observation is remembered.

use keel_common::crd::{ManagedBundle, CONDITION_APPLIED, CONDITION_HEALTHY};

/// Check one read of a bundle. `Err` carries why it has not converged.
pub fn check_bundle(bundle: &ManagedBundle) -> Result<(), String> {
    let Some(status) = bundle.status.as_ref() else {
        return Err("no status reported yet".to_string());
    };

    if let (Some(generation), Some(observed)) =
        (bundle.metadata.generation, status.observed_generation)
    {
        if observed < generation {
            return Err(format!(
                "observed generation {} is older than generation {}",
                observed, generation
            ));
        }
    }

    for type_ in [CONDITION_APPLIED, CONDITION_HEALTHY] {
        match status.condition(type_) {
            Some(condition) if condition.is_true() => {}
            Some(condition) if condition.message.is_empty() => {
                return Err(format!("condition {} is {}", type_, condition.status));
            }
            Some(condition) => {
                return Err(format!(
                    "condition {} is {}: {}",
                    type_, condition.status, condition.message
                ));
            }
            None => return Err(format!("condition {} has not been reported", type_)),
        }
    }

    Ok(())
}

/// Whether one read of a bundle shows it converged
pub fn is_converged(bundle: &ManagedBundle) -> bool {
    check_bundle(bundle).is_ok()
}
