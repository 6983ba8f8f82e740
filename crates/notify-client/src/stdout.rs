//! Stdout sink

use crate::error::NotifyError;
use crate::notifier_trait::Notifier;
use std::io::Write;

/// Prints every message on its own line.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutNotifier;

#[async_trait::async_trait]
impl Notifier for StdoutNotifier {
    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        let mut out = std::io::stdout().lock();
        writeln!(out, "{message}")?;
        Ok(())
    }
}
