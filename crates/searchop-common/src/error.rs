//! Error types for the searchop operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the context needed to act on it: the resource or
//! URL involved, the observed status code, the offending version string.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for searchop operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Declared spec fails semantic checks
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.operations[0].url")
        field: Option<String>,
    },

    /// A version string that does not parse as major.minor.patch[-pre]
    #[error("malformed version '{version}': {message}")]
    MalformedVersion {
        /// The raw version string
        version: String,
        /// Why parsing failed
        message: String,
    },

    /// The cluster answered with a status code outside the accepted set
    #[error("unacceptable status {status} from {method} {url}")]
    UnacceptableStatus {
        /// HTTP method of the failed request
        method: String,
        /// Target URL (path relative to the cluster endpoint)
        url: String,
        /// Observed HTTP status code
        status: u16,
    },

    /// A request to the cluster did not complete before its deadline
    #[error("request {method} {url} timed out after {timeout:?}")]
    Timeout {
        /// HTTP method of the request
        method: String,
        /// Target URL
        url: String,
        /// Deadline that was exceeded
        timeout: Duration,
    },

    /// Connection or protocol failure talking to the cluster
    #[error("transport error for {url}: {message}")]
    Transport {
        /// Target URL
        url: String,
        /// Description of the failure
        message: String,
    },

    /// A referenced object does not exist (yet)
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Kind of the missing object (e.g. "SearchCluster")
        kind: String,
        /// Namespace of the missing object
        namespace: String,
        /// Name of the missing object
        name: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// What was being (de)serialized, if known
        kind: Option<String>,
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

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Attach a resource name to a validation error that was raised without one
    pub fn with_resource(self, name: impl Into<String>) -> Self {
        match self {
            Self::Validation {
                resource,
                message,
                field,
            } if resource == UNKNOWN_CONTEXT => Self::Validation {
                resource: name.into(),
                message,
                field,
            },
            other => other,
        }
    }

    /// Create a malformed version error
    pub fn malformed_version(version: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::MalformedVersion {
            version: version.into(),
            message: msg.into(),
        }
    }

    /// Create an unacceptable status error
    pub fn unacceptable_status(
        method: impl Into<String>,
        url: impl Into<String>,
        status: u16,
    ) -> Self {
        Self::UnacceptableStatus {
            method: method.into(),
            url: url.into(),
            status,
        }
    }

    /// Create a timeout error
    pub fn timeout(method: impl Into<String>, url: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            method: method.into(),
            url: url.into(),
            timeout,
        }
    }

    /// Create a transport error
    pub fn transport(url: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transport {
            url: url.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error for a referenced object
    pub fn not_found(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with context on what was being processed
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
    /// Problems with the declared intent (validation, malformed versions,
    /// unparsable stored data) need a spec change and are not retried.
    /// Everything touching live infrastructure is.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Don't retry on 4xx errors (validation, forbidden, ...)
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::Validation { .. } => false,
            Error::MalformedVersion { .. } => false,
            Error::UnacceptableStatus { .. } => true,
            Error::Timeout { .. } => true,
            Error::Transport { .. } => true,
            Error::NotFound { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}
