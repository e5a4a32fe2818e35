//! Error types for the Machina controller
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries contextual information like node names, backend
//! provider ids, and underlying causes. `is_retryable` feeds the
//! rate-limited requeue policy in the reconcile loop.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Machina operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Machine backend (driver) error
    #[error("backend error [{provider}] for {node}: {message}")]
    Backend {
        /// Name of the node whose machine is affected
        node: String,
        /// Backend provider id (e.g. "amazonec2", "openstack")
        provider: String,
        /// Description of what failed
        message: String,
        /// Whether this error is transient
        retryable: bool,
    },

    /// Invalid or malformed node configuration
    #[error("config error for {node}: {message}")]
    Config {
        /// Name of the misconfigured node
        node: String,
        /// Description of what's invalid
        message: String,
    },

    /// Referenced NodeClass does not exist
    #[error("node class {class} not found")]
    ClassNotFound {
        /// Name of the missing class
        class: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "queue")
        context: String,
    },
}

impl Error {
    /// Create a transient backend error without node/provider context
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend {
            node: UNKNOWN_CONTEXT.to_string(),
            provider: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a transient backend error with full context
    pub fn backend_for(
        node: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Backend {
            node: node.into(),
            provider: provider.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a fatal backend error (e.g. unknown provider, rejected config)
    pub fn backend_fatal(
        node: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Backend {
            node: node.into(),
            provider: provider.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a config error for a node
    pub fn config_for(node: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            node: node.into(),
            message: msg.into(),
        }
    }

    /// Create a class-not-found error
    pub fn class_not_found(class: impl Into<String>) -> Self {
        Self::ClassNotFound {
            class: class.into(),
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

    /// Check if this error is retryable
    ///
    /// Conflicts (409) retry so the next pass re-reads the cache; other 4xx
    /// Kubernetes errors do not. Config and class-not-found errors retry up
    /// to the requeue ceiling, after which the key is dropped until the next
    /// external update.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if ae.code == 409 => true,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) => false,
                _ => true,
            },
            Error::Backend { retryable, .. } => *retryable,
            Error::Config { .. } => true,
            Error::ClassNotFound { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the node name if this error is associated with a specific node
    pub fn node(&self) -> Option<&str> {
        match self {
            Error::Backend { node, .. } => Some(node),
            Error::Config { node, .. } => Some(node),
            _ => None,
        }
    }
}
