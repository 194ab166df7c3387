//! Batch dispatch with per-job failure isolation.
//!
//! [`Dispatcher::dispatch`] answers health checks directly, routes every
//! object of an event through [`RoutingRules`], and fans the resulting jobs
//! through the [`ConcurrencyGate`]. A job's failure becomes a failed
//! [`JobResult`]; it never aborts its siblings. The batch resolves only
//! after every admitted job has settled.

use std::sync::Arc;

use keymaster_core::routing::{RouteDecision, RoutingRules, SkipReason};
use keymaster_core::types::{Job, JobResult, ObjectRef};
use serde::Serialize;
use serde_json::json;

use crate::event::InboundEvent;
use crate::executor::JobRunner;
use crate::gate::ConcurrencyGate;

/// Errors surfaced before any job is created.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The payload could not be understood as any known event shape.
    #[error("Malformed input: {0}")]
    MalformedInput(String),
}

/// An object that routing declined to process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedObject {
    pub object: String,
    pub reason: SkipReason,
}

/// Aggregate outcome of one dispatched event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Healthy,
    Processed {
        /// One entry per admitted job, in input order.
        results: Vec<JobResult>,
        skipped: Vec<SkippedObject>,
    },
}

impl DispatchOutcome {
    /// True for a health check, or when every admitted job succeeded.
    /// An event whose objects were all skipped counts as a success.
    pub fn is_success(&self) -> bool {
        match self {
            Self::Healthy => true,
            Self::Processed { results, .. } => results.iter().all(|r| r.success),
        }
    }

    pub fn results(&self) -> &[JobResult] {
        match self {
            Self::Healthy => &[],
            Self::Processed { results, .. } => results,
        }
    }

    /// Handler-style response document.
    pub fn to_response(&self) -> serde_json::Value {
        match self {
            Self::Healthy => json!({ "statusCode": 200, "body": { "status": "healthy" } }),
            Self::Processed { results, skipped } => json!({
                "statusCode": 200,
                "body": { "processed": results, "skipped": skipped },
            }),
        }
    }
}

pub struct Dispatcher {
    runner: Arc<dyn JobRunner>,
    gate: ConcurrencyGate,
    routing: RoutingRules,
}

impl Dispatcher {
    pub fn new(runner: Arc<dyn JobRunner>, gate: ConcurrencyGate, routing: RoutingRules) -> Self {
        Self {
            runner,
            gate,
            routing,
        }
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub fn routing(&self) -> &RoutingRules {
        &self.routing
    }

    /// Normalize `event` into jobs and run them.
    pub async fn dispatch(&self, event: &InboundEvent) -> DispatchOutcome {
        if event.is_health_check() {
            tracing::info!("Health check request");
            return DispatchOutcome::Healthy;
        }

        let (jobs, skipped) = self.plan(&event.objects());
        if !skipped.is_empty() {
            tracing::info!(count = skipped.len(), "Skipped objects outside the pipeline");
        }

        let results = self.run_batch(jobs).await;
        DispatchOutcome::Processed { results, skipped }
    }

    /// Route each object into either a job or a skip record.
    pub fn plan(&self, objects: &[ObjectRef]) -> (Vec<Job>, Vec<SkippedObject>) {
        let mut jobs = Vec::new();
        let mut skipped = Vec::new();
        for object in objects {
            match self.routing.route(object) {
                RouteDecision::Process(job) => jobs.push(job),
                RouteDecision::Skip(reason) => {
                    tracing::debug!(object = %object, ?reason, "Skipping object");
                    skipped.push(SkippedObject {
                        object: object.to_string(),
                        reason,
                    });
                }
            }
        }
        (jobs, skipped)
    }

    /// Run `jobs` through the gate and wait for all of them.
    pub async fn run_batch(&self, jobs: Vec<Job>) -> Vec<JobResult> {
        if jobs.is_empty() {
            return Vec::new();
        }
        tracing::info!(jobs = jobs.len(), width = self.gate.width(), "Dispatching batch");

        let runs = jobs
            .iter()
            .map(|job| self.gate.run(self.runner.execute(job)));
        let results = futures::future::join_all(runs).await;

        let failed = results.iter().filter(|r| !r.success).count();
        tracing::info!(
            succeeded = results.len() - failed,
            failed,
            "Batch settled",
        );
        results
    }

    /// Close long-lived resources held by the runner.
    pub async fn shutdown(&self) {
        self.runner.shutdown().await;
    }
}
