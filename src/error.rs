//! Error types for steward
//!
//! Errors carry enough context (lease key, resource kind, operation) to be
//! useful in a log line without a backtrace. Kubernetes API status codes that
//! the election and mutation paths branch on (404, 409) are lifted into their
//! own variants so callers never match on raw HTTP codes.

use thiserror::Error;

/// Main error type for steward operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error that is not a conflict or a missing object
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A compare-and-swap write lost against a concurrent writer
    #[error("conflict on {kind} {name}: {message}")]
    Conflict {
        /// Resource kind (e.g., "Lease")
        kind: String,
        /// Object name
        name: String,
        /// Description of the conflict
        message: String,
    },

    /// The addressed object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind (e.g., "ReplicaSet")
        kind: String,
        /// Object name
        name: String,
    },

    /// Invalid configuration or input
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The offending field, if known
        field: Option<String>,
    },

    /// The local candidate identity could not be determined
    #[error("cannot resolve candidate identity: {message}")]
    Identity {
        /// Description of what failed
        message: String,
    },

    /// Kubeconfig parsing or client construction failed
    #[error("client configuration error: {message}")]
    ClientConfig {
        /// Description of what failed
        message: String,
    },

    /// The store could not be reached (used by the in-memory store to simulate outages)
    #[error("store unavailable: {message}")]
    Unavailable {
        /// Description of what failed
        message: String,
    },

    /// Application callback or handler failure
    #[error("callback error [{context}]: {message}")]
    Callback {
        /// Description of what failed
        message: String,
        /// Which callback failed (e.g., "on_started_leading", "pod-handler")
        context: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a conflict error for the given object
    pub fn conflict(
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error for the given object
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a validation error for a specific field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an identity resolution error
    pub fn identity(msg: impl Into<String>) -> Self {
        Self::Identity {
            message: msg.into(),
        }
    }

    /// Create a client configuration error
    pub fn client_config(msg: impl Into<String>) -> Self {
        Self::ClientConfig {
            message: msg.into(),
        }
    }

    /// Create a store-unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable {
            message: msg.into(),
        }
    }

    /// Create a callback error with context
    pub fn callback(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Callback {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Map a kube error for a named object, lifting 404 and 409 into typed variants
    pub fn from_kube(kind: &str, name: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => Self::not_found(kind, name),
            kube::Error::Api(ae) if ae.code == 409 => Self::conflict(kind, name, ae.message),
            other => Self::Kube { source: other },
        }
    }

    /// Whether this error is a lost compare-and-swap
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }
}
