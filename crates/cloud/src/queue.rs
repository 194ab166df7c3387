//! Message-queue transport used by the worker's continuous mode.
//!
//! Delivery is at-least-once: a received message stays hidden for the
//! visibility timeout and reappears unless it is deleted.

use std::time::Duration;

use aws_sdk_sqs::error::DisplayErrorContext;
use keymaster_core::config::QUEUE_MAX_BATCH;

/// A received message together with the handle needed to delete it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: String,
    /// Opaque token identifying this particular receipt.
    pub receipt_handle: String,
    pub body: String,
}

/// Errors from a [`QueueTransport`] operation.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue receive failed: {0}")]
    Receive(String),

    #[error("Queue delete failed: {0}")]
    Delete(String),
}

#[async_trait::async_trait]
pub trait QueueTransport: Send + Sync {
    /// Long-poll for up to `max_messages` messages, waiting at most `wait`.
    /// Returned messages are hidden from other consumers for
    /// `visibility_timeout`.
    async fn receive_batch(
        &self,
        max_messages: u32,
        wait: Duration,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    /// Acknowledge a message so it is never redelivered.
    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError>;
}

// ---------------------------------------------------------------------------
// SQS
// ---------------------------------------------------------------------------

/// [`QueueTransport`] backed by Amazon SQS.
pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
    queue_url: String,
}

impl SqsQueue {
    pub fn new(client: aws_sdk_sqs::Client, queue_url: impl Into<String>) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
        }
    }

    pub fn from_config(config: &aws_config::SdkConfig, queue_url: impl Into<String>) -> Self {
        Self::new(aws_sdk_sqs::Client::new(config), queue_url)
    }
}

#[async_trait::async_trait]
impl QueueTransport for SqsQueue {
    async fn receive_batch(
        &self,
        max_messages: u32,
        wait: Duration,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages.clamp(1, QUEUE_MAX_BATCH) as i32)
            .wait_time_seconds(wait.as_secs() as i32)
            .visibility_timeout(visibility_timeout.as_secs() as i32)
            .send()
            .await
            .map_err(|e| QueueError::Receive(DisplayErrorContext(&e).to_string()))?;

        let mut messages = Vec::new();
        for message in output.messages() {
            let Some(receipt_handle) = message.receipt_handle() else {
                tracing::warn!(
                    message_id = ?message.message_id(),
                    "Received message without a receipt handle, ignoring",
                );
                continue;
            };
            messages.push(QueueMessage {
                message_id: message.message_id().unwrap_or_default().to_string(),
                receipt_handle: receipt_handle.to_string(),
                body: message.body().unwrap_or_default().to_string(),
            });
        }

        Ok(messages)
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::Delete(DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }
}
