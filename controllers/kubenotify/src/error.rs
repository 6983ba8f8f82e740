//! Controller-specific error types.
//!
//! Inspection errors never leave the controller: they only feed the
//! scheduling queue's retry policy. Notification errors are handled by the
//! notify client and logged where the notification is sent.

use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the kubenotify controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Watch caches have not finished their initial list
    #[error("NotSynced")]
    NotSynced,

    /// Workload has fewer ready replicas than desired
    #[error("{0}: NotReady")]
    NotReady(String),

    /// Object vanished from the cache between enqueue and processing
    #[error("{kind} not found: {key}")]
    NotFound {
        /// Kind of the missing object
        kind: String,
        /// `namespace/name` of the missing object
        key: String,
    },

    /// Malformed cache key or work item
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Object could not be marshalled for diffing
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error (probe server)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControllerError {
    /// Short label used for metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::NotSynced => "not_synced",
            Self::NotReady(_) => "not_ready",
            Self::NotFound { .. } => "not_found",
            Self::InvalidKey(_) => "invalid_key",
            Self::Serialization(_) => "serialization",
            Self::Kube(_) => "kube",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Watch(_) => "watch",
            Self::Metrics(_) => "metrics",
            Self::Io(_) => "io",
        }
    }
}
