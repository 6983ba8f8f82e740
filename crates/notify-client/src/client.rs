//! Webhook notification client
//!
//! Posts `{"message": "..."}` to a webhook and treats anything but `200 OK`
//! as a failure. Failures are retried with exponential backoff before being
//! reported to the caller.

use crate::error::NotifyError;
use crate::notifier_trait::Notifier;
use futures::future::join_all;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry schedule used by [`WebhookClient`].
///
/// The default gives 4 attempts spaced 10ms, 50ms and 250ms apart.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub attempts: u32,
    /// Delay before the first retry
    pub initial: Duration,
    /// Multiplier applied to the delay after every retry
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            initial: Duration::from_millis(10),
            factor: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given (0-indexed) failed attempt.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = self.factor.saturating_pow(attempt);
        self.initial.saturating_mul(multiplier)
    }
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    message: &'a str,
}

/// Webhook notification client
#[derive(Debug, Clone)]
pub struct WebhookClient {
    client: Client,
    url: String,
    retry: RetryPolicy,
}

impl WebhookClient {
    /// Create a new webhook client with the default retry policy
    ///
    /// # Arguments
    /// * `url` - Webhook URL receiving the JSON POST
    pub fn new(url: String) -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            client,
            url,
            retry: RetryPolicy::default(),
        })
    }

    /// Replace the retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Get the webhook URL
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post_once(&self, message: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookBody { message })
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(NotifyError::Status {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }

        debug!("Posted notification to {}", self.url);
        Ok(())
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookClient {
    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        let mut attempt = 0;
        loop {
            match self.post_once(message).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 < self.retry.attempts => {
                    warn!("Webhook {} failed (attempt {}): {}", self.url, attempt + 1, e);
                    tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Delivers every message to several webhooks concurrently.
///
/// Individual failures are logged and ignored, so `notify` always succeeds.
#[derive(Debug, Clone)]
pub struct WebhookFanout {
    hooks: Vec<WebhookClient>,
}

impl WebhookFanout {
    /// Build a fan-out over the given webhook URLs
    pub fn new<I>(urls: I) -> Result<Self, NotifyError>
    where
        I: IntoIterator<Item = String>,
    {
        let hooks = urls
            .into_iter()
            .map(WebhookClient::new)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { hooks })
    }

    /// Build a fan-out over already configured clients
    #[must_use]
    pub fn from_clients(hooks: Vec<WebhookClient>) -> Self {
        Self { hooks }
    }

    /// Number of webhooks in the fan-out
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Whether the fan-out has no webhooks
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookFanout {
    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        let results = join_all(self.hooks.iter().map(|hook| hook.notify(message))).await;
        for (hook, result) in self.hooks.iter().zip(results) {
            if let Err(e) = result {
                warn!("Failed to post webhook {}: {}", hook.url(), e);
            }
        }
        Ok(())
    }
}
