//! Job and result types shared by the pipeline and the worker.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ObjectRef
// ---------------------------------------------------------------------------

/// Location of a blob in object storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

impl ObjectRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One unit of work: a source blob mapped to a destination blob through
/// the external workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: Uuid,
    pub source: ObjectRef,
    /// Source key with the input prefix stripped.
    pub relative_path: String,
    pub destination: ObjectRef,
    /// Filesystem- and key-safe label used to name diagnostic uploads.
    pub debug_tag: String,
}

impl Job {
    /// Create a job with a fresh id and a derived debug tag.
    pub fn new(source: ObjectRef, relative_path: impl Into<String>, destination: ObjectRef) -> Self {
        let id = Uuid::new_v4();
        let relative_path = relative_path.into();
        let debug_tag = debug_tag_for(&id, &relative_path);
        Self {
            id,
            source,
            relative_path,
            destination,
            debug_tag,
        }
    }
}

/// `<first 8 hex chars of id>-<relative path, flattened>`.
fn debug_tag_for(id: &Uuid, relative_path: &str) -> String {
    let short = &id.simple().to_string()[..8];
    let flat: String = relative_path
        .chars()
        .map(|c| match c {
            '/' | '\\' | ' ' => '_',
            c => c,
        })
        .collect();
    if flat.is_empty() {
        short.to_string()
    } else {
        format!("{short}-{flat}")
    }
}

// ---------------------------------------------------------------------------
// JobResult
// ---------------------------------------------------------------------------

/// Outcome of one job, as reported back to the caller of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    /// `s3://bucket/key` of the input.
    pub source: String,
    /// `s3://bucket/key` of the output, when one was written.
    pub destination: Option<String>,
    pub success: bool,
    pub error: Option<String>,
}

impl JobResult {
    pub fn succeeded(source: &ObjectRef, destination: &ObjectRef) -> Self {
        Self {
            source: source.to_string(),
            destination: Some(destination.to_string()),
            success: true,
            error: None,
        }
    }

    pub fn failed(source: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: None,
            success: false,
            error: Some(error.into()),
        }
    }
}
