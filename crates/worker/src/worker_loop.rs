//! Continuous queue consumption.
//!
//! ```text
//! POLLING ──messages──▶ DISPATCHING ──batch settled──▶ POLLING
//!    │
//!    └──shutdown──▶ DRAINING ──pool closed──▶ STOPPED
//! ```
//!
//! A message is deleted only when its payload succeeded; anything else
//! stays on the queue and comes back after the visibility timeout.
//! Shutdown is observed before each receive. An in-flight batch always
//! runs to completion.

use std::sync::Arc;
use std::time::Duration;

use keymaster_cloud::{QueueMessage, QueueTransport};
use keymaster_core::config::QueueConfig;
use keymaster_core::retry::RetryPolicy;
use keymaster_pipeline::Dispatcher;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::payload::dispatch_payload;

/// Pause after a failed receive before polling again.
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Polling,
    Dispatching,
    Draining,
    Stopped,
}

/// Counters accumulated over one [`WorkerLoop::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Non-empty receives.
    pub batches: u64,
    pub messages: u64,
    pub deleted: u64,
    /// Messages left on the queue for redelivery.
    pub failed: u64,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub batch_size: u32,
    pub wait: Duration,
    pub visibility_timeout: Duration,
    pub error_backoff: Duration,
}

impl From<&QueueConfig> for WorkerSettings {
    fn from(config: &QueueConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            wait: config.wait,
            visibility_timeout: config.visibility_timeout,
            error_backoff: RECEIVE_ERROR_BACKOFF,
        }
    }
}

/// Rough worst case for one job: every attempt runs to its full timeout
/// budget, plus every retry delay.
pub fn worst_case_job_duration(policy: &RetryPolicy, per_attempt: Duration) -> Duration {
    policy.total_delay() + per_attempt * policy.max_attempts()
}

enum MessageOutcome {
    Deleted,
    Retained,
    DeleteFailed,
}

pub struct WorkerLoop {
    queue: Arc<dyn QueueTransport>,
    dispatcher: Arc<Dispatcher>,
    settings: WorkerSettings,
    state: watch::Sender<WorkerState>,
}

impl WorkerLoop {
    pub fn new(queue: Arc<dyn QueueTransport>, dispatcher: Arc<Dispatcher>, settings: WorkerSettings) -> Self {
        let (state, _) = watch::channel(WorkerState::Polling);
        Self {
            queue,
            dispatcher,
            settings,
            state,
        }
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Poll and dispatch until `cancel` fires, then close the session pool.
    pub async fn run(&self, cancel: CancellationToken) -> WorkerStats {
        let mut stats = WorkerStats::default();
        tracing::info!(
            batch_size = self.settings.batch_size,
            wait_secs = self.settings.wait.as_secs(),
            visibility_timeout_secs = self.settings.visibility_timeout.as_secs(),
            "Worker loop started",
        );

        while !cancel.is_cancelled() {
            self.set_state(WorkerState::Polling);

            let messages = match self
                .queue
                .receive_batch(
                    self.settings.batch_size,
                    self.settings.wait,
                    self.settings.visibility_timeout,
                )
                .await
            {
                Ok(messages) => messages,
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        backoff_ms = self.settings.error_backoff.as_millis() as u64,
                        "Queue receive failed",
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.error_backoff) => continue,
                    }
                }
            };

            // The long-poll wait already bounds idle latency.
            if messages.is_empty() {
                tracing::debug!("No messages received");
                continue;
            }

            self.set_state(WorkerState::Dispatching);
            stats.batches += 1;
            stats.messages += messages.len() as u64;
            tracing::info!(count = messages.len(), "Received messages");

            let outcomes =
                futures::future::join_all(messages.iter().map(|m| self.handle_message(m))).await;
            for outcome in outcomes {
                match outcome {
                    MessageOutcome::Deleted => stats.deleted += 1,
                    MessageOutcome::Retained => stats.failed += 1,
                    MessageOutcome::DeleteFailed => {}
                }
            }
        }

        self.set_state(WorkerState::Draining);
        tracing::info!("Worker draining, closing session pool");
        self.dispatcher.shutdown().await;
        self.set_state(WorkerState::Stopped);

        tracing::info!(
            batches = stats.batches,
            messages = stats.messages,
            deleted = stats.deleted,
            failed = stats.failed,
            "Worker loop stopped",
        );
        stats
    }

    async fn handle_message(&self, message: &QueueMessage) -> MessageOutcome {
        let span = tracing::info_span!("message", message_id = %message.message_id);
        async {
            let origin = format!("message:{}", message.message_id);
            let outcome = dispatch_payload(&self.dispatcher, &origin, &message.body).await;

            if !outcome.is_success() {
                let failures = outcome.results().iter().filter(|r| !r.success).count();
                tracing::warn!(failures, "Message failed, leaving it for redelivery");
                return MessageOutcome::Retained;
            }

            match self.queue.delete(&message.receipt_handle).await {
                Ok(()) => {
                    tracing::info!("Message processed and deleted");
                    MessageOutcome::Deleted
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to delete processed message");
                    MessageOutcome::DeleteFailed
                }
            }
        }
        .instrument(span)
        .await
    }

    fn set_state(&self, next: WorkerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = ?previous, to = ?next, "Worker state changed");
        }
    }
}
