//! Error types for the fanout channel control plane
//!
//! Errors carry enough structure for controllers to decide whether a failed
//! reconcile should be retried (dependency missing, API hiccup) or parked until
//! the spec changes (validation, translation, ownership conflicts).

use thiserror::Error;

/// Main error type for channel operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Channel spec failed validation
    #[error("validation error at {field}: {message}")]
    Validation {
        /// Field path of the invalid value (e.g. "spec.subscribers[0]")
        field: String,
        /// Description of what's invalid
        message: String,
    },

    /// One or more required fields are missing
    #[error("missing field(s): {}", fields.join(", "))]
    MissingField {
        /// Field paths that were expected
        fields: Vec<String>,
    },

    /// A dependent resource does not exist
    #[error("{kind} {name} does not exist")]
    NotFound {
        /// Resource kind (Deployment, Service, Endpoints)
        kind: &'static str,
        /// Namespaced name of the resource
        name: String,
    },

    /// A dependent resource exists but cannot serve traffic yet
    #[error("{kind} {name} is not ready: {message}")]
    NotReady {
        /// Resource kind
        kind: &'static str,
        /// Namespaced name of the resource
        name: String,
        /// Why it is not ready
        message: String,
    },

    /// A resource with the expected name is controlled by someone else
    #[error("{owner} does not own {kind} {name}")]
    OwnershipConflict {
        /// Namespaced name of the channel that expected ownership
        owner: String,
        /// Resource kind
        kind: &'static str,
        /// Name of the conflicting resource
        name: String,
    },

    /// A subscriber record could not be turned into a subscription
    #[error("translation error for subscriber {index}: {message}")]
    Translation {
        /// Index of the subscriber in the channel spec
        index: usize,
        /// Description of what failed
        message: String,
    },

    /// Delivering a message to a destination failed
    #[error("dispatch to {destination} failed: {message}")]
    Dispatch {
        /// Destination URL
        destination: String,
        /// Description of what failed
        message: String,
        /// Whether another attempt could succeed
        retryable: bool,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid process configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal/operational error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error for the given field path
    pub fn validation(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error for a dependent resource
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Create a not-ready error for a dependent resource
    pub fn not_ready(kind: &'static str, name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::NotReady {
            kind,
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a translation error for the subscriber at `index`
    pub fn translation(index: usize, msg: impl Into<String>) -> Self {
        Self::Translation {
            index,
            message: msg.into(),
        }
    }

    /// Create a retryable dispatch error for the given destination
    pub fn dispatch(destination: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Dispatch {
            destination: destination.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a dispatch error the destination will keep returning
    pub fn rejected(destination: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Dispatch {
            destination: destination.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is retryable
    ///
    /// Missing or not-ready dependencies and transient API failures are retried
    /// with backoff. Spec problems (validation, translation) and ownership
    /// conflicts wait for a change instead.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(source) => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 404 && ae.code != 409
            ),
            Error::Validation { .. } => false,
            Error::MissingField { .. } => false,
            Error::NotFound { .. } => true,
            Error::NotReady { .. } => true,
            Error::OwnershipConflict { .. } => false,
            Error::Translation { .. } => false,
            Error::Dispatch { retryable, .. } => *retryable,
            Error::Serialization(_) => false,
            Error::Config(_) => false,
            Error::Internal(_) => true,
        }
    }
}
