//! Shared fakes for worker integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keymaster_cloud::{QueueError, QueueMessage, QueueTransport};
use keymaster_core::routing::RoutingRules;
use keymaster_core::types::{Job, JobResult};
use keymaster_pipeline::{ConcurrencyGate, Dispatcher, JobRunner};
use keymaster_worker::WorkerSettings;
use tokio_util::sync::CancellationToken;

pub fn message(id: &str, body: &str) -> QueueMessage {
    QueueMessage {
        message_id: id.to_string(),
        receipt_handle: format!("rh-{id}"),
        body: body.to_string(),
    }
}

pub fn object_event(key: &str) -> String {
    serde_json::json!({ "bucket": "assets", "key": key }).to_string()
}

pub fn settings() -> WorkerSettings {
    WorkerSettings {
        batch_size: 10,
        wait: Duration::from_secs(20),
        visibility_timeout: Duration::from_secs(900),
        error_backoff: Duration::from_secs(5),
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Replays scripted receive results, then cancels the loop.
pub struct ScriptedQueue {
    script: Mutex<VecDeque<Result<Vec<QueueMessage>, QueueError>>>,
    cancel: CancellationToken,
    pub receives: AtomicU32,
    pub deleted: Mutex<Vec<String>>,
    pub fail_deletes: bool,
}

impl ScriptedQueue {
    pub fn new(
        script: Vec<Result<Vec<QueueMessage>, QueueError>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            script: Mutex::new(script.into()),
            cancel,
            receives: AtomicU32::new(0),
            deleted: Mutex::new(Vec::new()),
            fail_deletes: false,
        }
    }

    pub fn deleted(&self) -> Vec<String> {
        let mut deleted = self.deleted.lock().unwrap().clone();
        deleted.sort();
        deleted
    }
}

#[async_trait::async_trait]
impl QueueTransport for ScriptedQueue {
    async fn receive_batch(
        &self,
        max_messages: u32,
        _wait: Duration,
        _visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        assert!(max_messages <= 10);
        self.receives.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => {
                self.cancel.cancel();
                Ok(Vec::new())
            }
        }
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        if self.fail_deletes {
            return Err(QueueError::Delete("throttled".into()));
        }
        self.deleted.lock().unwrap().push(receipt_handle.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Succeeds unless the source key contains `fail`.
#[derive(Default)]
pub struct KeyRunner {
    pub executed: Mutex<Vec<String>>,
    pub shutdowns: AtomicU32,
    /// Fires shutdown from inside a job, simulating a signal mid-batch.
    pub cancel_on_execute: Option<CancellationToken>,
}

#[async_trait::async_trait]
impl JobRunner for KeyRunner {
    async fn execute(&self, job: &Job) -> JobResult {
        self.executed.lock().unwrap().push(job.source.key.clone());
        if let Some(cancel) = &self.cancel_on_execute {
            cancel.cancel();
        }
        if job.source.key.contains("fail") {
            JobResult::failed(job.source.to_string(), "portal rejected upload")
        } else {
            JobResult::succeeded(&job.source, &job.destination)
        }
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn dispatcher(runner: Arc<KeyRunner>) -> Arc<Dispatcher> {
    Arc::new(Dispatcher::new(
        runner as Arc<dyn JobRunner>,
        ConcurrencyGate::new(1),
        RoutingRules::default(),
    ))
}
