//! The [`Notifier`] seam and its no-op implementation.

/// Error type for notification delivery failures.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// The underlying HTTP request failed (network, DNS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The remote endpoint returned a non-2xx status code.
    #[error("Notification endpoint returned HTTP {0}")]
    HttpStatus(u16),
}

/// Sends a short text message to an operator channel.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `text` to `destination` (a webhook URL for
    /// [`WebhookNotifier`](crate::WebhookNotifier)).
    async fn send(&self, destination: &str, text: &str) -> Result<(), NotifyError>;
}

/// Discards every message. Used when no channel is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait::async_trait]
impl Notifier for NoopNotifier {
    async fn send(&self, destination: &str, text: &str) -> Result<(), NotifyError> {
        tracing::debug!(destination, text, "Notification discarded (no channel configured)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_display() {
        assert_eq!(
            NotifyError::HttpStatus(502).to_string(),
            "Notification endpoint returned HTTP 502"
        );
    }

    #[tokio::test]
    async fn noop_always_succeeds() {
        assert!(NoopNotifier.send("anywhere", "hello").await.is_ok());
    }
}
