//! Error types for keel
//!
//! Errors are structured with fields so that every message names the
//! namespace/name of the object involved. Operators should be able to act on
//! a failure without re-deriving context from logs.

use thiserror::Error;

use crate::retry::RetryCause;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for keel operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error that was not attributed to a specific submission
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A create/apply/delete request was rejected by the API server.
    ///
    /// Never retried by the engine: a bad manifest or a permission denial
    /// does not go away by submitting it again.
    #[error("failed to submit {kind} {namespace}/{name}: {source}")]
    Submission {
        /// Kind of the object being written (e.g. "ManagedBundle", "Secret")
        kind: String,
        /// Namespace of the object
        namespace: String,
        /// Name of the object
        name: String,
        /// The underlying kube-rs error
        #[source]
        source: kube::Error,
    },

    /// The object was not found when it was expected to exist
    #[error("{resource} {namespace}/{name} not found")]
    NotFound {
        /// Qualified resource (e.g. "managedbundles.keel.dev")
        resource: String,
        /// Namespace of the object
        namespace: String,
        /// Name of the object
        name: String,
    },

    /// A bundle was read but has not converged
    #[error("managed resource {namespace}/{name} is not healthy")]
    Unhealthy {
        /// Namespace of the bundle
        namespace: String,
        /// Name of the bundle
        name: String,
        /// Why the bundle is not considered healthy (not part of the message)
        reason: String,
    },

    /// An object that should be gone is still present
    #[error("resource {namespace}/{name} still exists")]
    StillExists {
        /// Namespace of the object
        namespace: String,
        /// Name of the object
        name: String,
    },

    /// The retry engine gave up
    #[error("{}", format_retry(.cause, .last.as_deref()))]
    Retry {
        /// Why polling stopped
        cause: RetryCause,
        /// The most recent failure observed before giving up
        last: Option<Box<Error>>,
    },

    /// One entry per failed target, in target declaration order
    #[error("{}", format_aggregate(.0))]
    Aggregate(Vec<Error>),

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Invalid configuration or input
    #[error("validation error for {component}: {message}")]
    Validation {
        /// Component or object the invalid input belongs to
        component: String,
        /// Description of what's invalid
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "client")
        context: String,
    },
}

fn format_retry(cause: &RetryCause, last: Option<&Error>) -> String {
    match last {
        Some(last) => format!("retry failed with {}, last error: {}", cause, last),
        None => format!("retry failed with {}", cause),
    }
}

fn format_aggregate(errors: &[Error]) -> String {
    let joined = errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    match errors.len() {
        1 => format!("1 error occurred: {}", joined),
        n => format!("{} errors occurred: {}", n, joined),
    }
}

impl Error {
    /// Wrap a rejected write request with the identity of the object
    pub fn submission(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        source: kube::Error,
    ) -> Self {
        Self::Submission {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
            source,
        }
    }

    /// Create a not-found error for a namespaced object
    pub fn not_found(
        resource: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            resource: resource.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create an unhealthy-bundle error
    pub fn unhealthy(
        namespace: impl Into<String>,
        name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Unhealthy {
            namespace: namespace.into(),
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a still-exists error
    pub fn still_exists(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::StillExists {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Wrap the last observed failure with the reason polling stopped
    pub fn retry(cause: RetryCause, last: Option<Error>) -> Self {
        Self::Retry {
            cause,
            last: last.map(Box::new),
        }
    }

    /// Collapse a list of per-target failures.
    ///
    /// Returns `Ok(())` for an empty list, otherwise an `Aggregate` holding
    /// exactly the given errors in the given order.
    pub fn join(errors: Vec<Error>) -> Result<(), Error> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Self::Aggregate(errors))
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            component: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error for a specific component
    pub fn validation_for(component: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            component: component.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check whether this error means "the object does not exist"
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube { source } | Error::Submission { source, .. } => {
                crate::kube_utils::is_not_found(source)
            }
            _ => false,
        }
    }

    /// Check if this error is worth retrying by a higher-level loop
    ///
    /// Submission, validation and serialization errors need a configuration
    /// or permission fix. Convergence failures clear up on their own.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Submission { .. } => false,
            Error::NotFound { .. } => true,
            Error::Unhealthy { .. } => true,
            Error::StillExists { .. } => true,
            Error::Retry { .. } => true,
            Error::Aggregate(errors) => errors.iter().all(Error::is_retryable),
            Error::Serialization { .. } => false,
            Error::Validation { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Per-target entries if this is an aggregate error
    pub fn errors(&self) -> Option<&[Error]> {
        match self {
            Error::Aggregate(errors) => Some(errors),
            _ => None,
        }
    }

    /// The failure observed last before the retry engine gave up
    pub fn last_error(&self) -> Option<&Error> {
        match self {
            Error::Retry { last, .. } => last.as_deref(),
            _ => None,
        }
    }
}
