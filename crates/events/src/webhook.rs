//! Webhook notifications with exponential-backoff retry.
//!
//! [`WebhookNotifier`] POSTs `{"text", "timestamp"}` to the destination URL.
//! The body shape is accepted by Slack-style incoming webhooks. Failed
//! attempts are retried after 1 s, 2 s and 4 s.

use std::sync::Arc;
use std::time::Duration;

use keymaster_core::retry::{retry, RetryPolicy, Sleeper, TokioSleeper};

use crate::notifier::{Notifier, NotifyError};

/// Retry schedule in seconds: immediate first attempt, then 1s, 2s, 4s.
const RETRY_DELAYS_SECS: [u64; 4] = [0, 1, 2, 4];

/// HTTP request timeout for a single delivery attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Delivers notifications to incoming-webhook endpoints.
pub struct WebhookNotifier {
    client: reqwest::Client,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl WebhookNotifier {
    /// Create a notifier with a pre-configured HTTP client.
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to build reqwest HTTP client");
        Self {
            client,
            policy: RetryPolicy::from_secs(&RETRY_DELAYS_SECS),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Replace the retry schedule and the sleeper driving it.
    pub fn with_retry(mut self, policy: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        self.policy = policy;
        self.sleeper = sleeper;
        self
    }

    /// Execute a single POST request and check the response status.
    async fn try_send(&self, url: &str, payload: &serde_json::Value) -> Result<(), NotifyError> {
        let response = self.client.post(url).json(payload).send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, destination: &str, text: &str) -> Result<(), NotifyError> {
        let payload = serde_json::json!({
            "text": text,
            "timestamp": chrono::Utc::now(),
        });

        let outcome = retry(&self.policy, self.sleeper.as_ref(), |_| {
            self.try_send(destination, &payload)
        })
        .await;

        if let Err(e) = &outcome.result {
            tracing::error!(
                url = destination,
                attempts = outcome.attempts.len(),
                error = %e,
                "Webhook notification failed after all retries",
            );
        }
        outcome.result
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
