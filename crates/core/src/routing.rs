//! Prefix-based routing of storage objects into jobs.
//!
//! Objects already under the output prefix are skipped so that writing a
//! result back into the watched bucket never re-triggers the pipeline.
//! Objects outside the input prefix are not ours to process.

use serde::Serialize;

use crate::types::{Job, ObjectRef};

/// Default prefix for objects awaiting processing.
pub const DEFAULT_INPUT_PREFIX: &str = "unprocessed/";

/// Default prefix under which results are written.
pub const DEFAULT_OUTPUT_PREFIX: &str = "processed/";

/// Why an object was not turned into a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    UnderOutputPrefix,
    OutsideInputPrefix,
}

/// Result of routing a single object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Process(Job),
    Skip(SkipReason),
}

/// Input/output prefix rules plus an optional fixed output bucket.
#[derive(Debug, Clone)]
pub struct RoutingRules {
    pub input_prefix: String,
    pub output_prefix: String,
    /// When `None`, results go back to the source bucket.
    pub output_bucket: Option<String>,
}

impl Default for RoutingRules {
    fn default() -> Self {
        Self {
            input_prefix: DEFAULT_INPUT_PREFIX.to_string(),
            output_prefix: DEFAULT_OUTPUT_PREFIX.to_string(),
            output_bucket: None,
        }
    }
}

impl RoutingRules {
    /// Decide whether `object` becomes a job, and if so where its output goes.
    ///
    /// The output-prefix check runs first: with overlapping prefixes an
    /// object we wrote ourselves must never be picked up again.
    pub fn route(&self, object: &ObjectRef) -> RouteDecision {
        if !self.output_prefix.is_empty() && object.key.starts_with(&self.output_prefix) {
            return RouteDecision::Skip(SkipReason::UnderOutputPrefix);
        }

        let relative = match object.key.strip_prefix(self.input_prefix.as_str()) {
            Some(rest) => rest,
            None => return RouteDecision::Skip(SkipReason::OutsideInputPrefix),
        };

        let destination = ObjectRef::new(
            self.output_bucket
                .clone()
                .unwrap_or_else(|| object.bucket.clone()),
            format!("{}{}", self.output_prefix, relative),
        );

        RouteDecision::Process(Job::new(object.clone(), relative, destination))
    }
}
