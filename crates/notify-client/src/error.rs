//! Notification client errors

use thiserror::Error;

/// Errors that can occur while delivering a notification
#[derive(Debug, Error)]
pub enum NotifyError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Webhook answered with something other than 200 OK
    #[error("post {url} without ok: {status}")]
    Status {
        /// Webhook URL
        url: String,
        /// HTTP status code returned
        status: u16,
    },

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Writing to a local sink failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
