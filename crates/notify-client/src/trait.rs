//! Notifier trait
//!
//! The controller depends on this trait rather than on a concrete sink, so
//! webhook, stdout and mock sinks are interchangeable.

use crate::error::NotifyError;

/// A best-effort notification sink.
///
/// Implementations are invoked synchronously by the caller, which logs and
/// swallows any error. Retrying is the sink's own business.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a single human-readable message.
    async fn notify(&self, message: &str) -> Result<(), NotifyError>;
}
