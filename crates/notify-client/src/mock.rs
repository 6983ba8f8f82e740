//! Mock notifier for unit testing
//!
//! Records every message in memory and can be switched into a failing mode to
//! exercise the caller's error handling.

use crate::error::NotifyError;
use crate::notifier_trait::Notifier;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Mock notifier for testing
#[derive(Debug, Clone, Default)]
pub struct MockNotifier {
    messages: Arc<Mutex<Vec<String>>>,
    failing: Arc<AtomicBool>,
}

impl MockNotifier {
    /// Create a new mock notifier
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `notify` calls fail (messages are still recorded)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// All messages received so far
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of messages received so far
    #[must_use]
    pub fn count(&self) -> usize {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait::async_trait]
impl Notifier for MockNotifier {
    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.to_string());

        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError::Status {
                url: "mock://notifier".to_string(),
                status: 503,
            });
        }
        Ok(())
    }
}
