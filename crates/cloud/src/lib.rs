//! Blob storage and message-queue transports.
//!
//! The pipeline only sees the [`BlobStore`] and [`QueueTransport`] traits.
//! AWS-backed implementations use the async SDK, so every call yields to
//! the runtime instead of blocking it.

pub mod queue;
pub mod storage;

pub use queue::{QueueError, QueueMessage, QueueTransport, SqsQueue};
pub use storage::{BlobStore, LocalBlobStore, S3BlobStore, StorageError};

/// Load the shared AWS configuration (region, credentials) from the
/// standard environment/profile chain.
pub async fn load_aws_config() -> aws_config::SdkConfig {
    aws_config::defaults(aws_config::BehaviorVersion::latest())
        .load()
        .await
}
