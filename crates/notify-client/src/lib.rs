//! Notification sinks for kubenotify
//!
//! The controller only needs a `notify(message)` capability. This crate
//! provides the implementations it can be wired to:
//!
//! - **Webhook**: POST `{"message": "..."}` to a URL, retrying with exponential backoff
//! - **Fan-out**: deliver the same message to several webhooks concurrently
//! - **Stdout**: print one line per message (default when no webhook is configured)
//!
//! # Example
//!
//! ```no_run
//! use notify_client::{Notifier, WebhookClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = WebhookClient::new("http://hooks.internal/kubenotify".to_string())?;
//! client.notify("Deployment(default/web) READY(1/3)").await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod stdout;
#[path = "trait.rs"]
pub mod notifier_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::{RetryPolicy, WebhookClient, WebhookFanout};
pub use error::NotifyError;
pub use notifier_trait::Notifier;
pub use stdout::StdoutNotifier;
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockNotifier;
