//! Blob storage: fetch an object to a local file, upload a local file.

use std::path::{Path, PathBuf};

use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use keymaster_core::types::ObjectRef;
use tokio::io::AsyncWriteExt;

/// Errors from a [`BlobStore`] operation.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The requested object does not exist.
    #[error("Object {object} not found")]
    NotFound { object: String },

    /// The storage service rejected or failed the request.
    #[error("Storage request for {object} failed: {message}")]
    Remote { object: String, message: String },

    /// Reading or writing the local file failed.
    #[error("Local I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Object storage as seen by the job pipeline.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Download `object` into `local_path`, overwriting it.
    async fn get(&self, object: &ObjectRef, local_path: &Path) -> Result<(), StorageError>;

    /// Upload the file at `local_path` as `object`.
    async fn put(&self, local_path: &Path, object: &ObjectRef) -> Result<(), StorageError>;
}

// ---------------------------------------------------------------------------
// S3
// ---------------------------------------------------------------------------

/// [`BlobStore`] backed by Amazon S3.
pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
}

impl S3BlobStore {
    pub fn new(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }

    pub fn from_config(config: &aws_config::SdkConfig) -> Self {
        Self::new(aws_sdk_s3::Client::new(config))
    }
}

#[async_trait::async_trait]
impl BlobStore for S3BlobStore {
    async fn get(&self, object: &ObjectRef, local_path: &Path) -> Result<(), StorageError> {
        let output = self
            .client
            .get_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .send()
            .await
            .map_err(|e| match e.as_service_error() {
                Some(service) if service.is_no_such_key() => StorageError::NotFound {
                    object: object.to_string(),
                },
                _ => StorageError::Remote {
                    object: object.to_string(),
                    message: DisplayErrorContext(&e).to_string(),
                },
            })?;

        let mut file = tokio::fs::File::create(local_path)
            .await
            .map_err(|e| StorageError::io(local_path, e))?;
        let body = output.body.into_async_read();
        tokio::pin!(body);
        let bytes = tokio::io::copy(&mut body, &mut file)
            .await
            .map_err(|e| StorageError::Remote {
                object: object.to_string(),
                message: format!("Failed to stream object body: {e}"),
            })?;
        file.flush().await.map_err(|e| StorageError::io(local_path, e))?;

        tracing::debug!(
            object = %object,
            bytes,
            path = %local_path.display(),
            "Downloaded object",
        );
        Ok(())
    }

    async fn put(&self, local_path: &Path, object: &ObjectRef) -> Result<(), StorageError> {
        // Surface a missing local file as an I/O error rather than an SDK one.
        tokio::fs::metadata(local_path)
            .await
            .map_err(|e| StorageError::io(local_path, e))?;

        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| StorageError::Remote {
                object: object.to_string(),
                message: format!("Failed to open upload body: {e}"),
            })?;

        self.client
            .put_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .body(body)
            .send()
            .await
            .map_err(|e| StorageError::Remote {
                object: object.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        tracing::debug!(object = %object, path = %local_path.display(), "Uploaded object");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Local filesystem
// ---------------------------------------------------------------------------

/// [`BlobStore`] that maps `bucket/key` onto a directory tree.
///
/// Used for local development and tests.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Filesystem location backing `object`.
    pub fn path_for(&self, object: &ObjectRef) -> PathBuf {
        self.root.join(&object.bucket).join(&object.key)
    }
}

#[async_trait::async_trait]
impl BlobStore for LocalBlobStore {
    async fn get(&self, object: &ObjectRef, local_path: &Path) -> Result<(), StorageError> {
        let source = self.path_for(object);
        if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
            return Err(StorageError::NotFound {
                object: object.to_string(),
            });
        }
        tokio::fs::copy(&source, local_path)
            .await
            .map_err(|e| StorageError::io(local_path, e))?;
        Ok(())
    }

    async fn put(&self, local_path: &Path, object: &ObjectRef) -> Result<(), StorageError> {
        let target = self.path_for(object);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent, e))?;
        }
        tokio::fs::copy(local_path, &target)
            .await
            .map_err(|e| StorageError::io(local_path, e))?;
        Ok(())
    }
}
