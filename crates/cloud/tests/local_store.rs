//! Integration tests for the filesystem-backed blob store.

use assert_matches::assert_matches;
use keymaster_cloud::{BlobStore, LocalBlobStore, StorageError};
use keymaster_core::types::ObjectRef;

// ---------------------------------------------------------------------------
// Test: put then get returns the same bytes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn put_creates_nested_key_and_get_reads_it_back() {
    let root = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let store = LocalBlobStore::new(root.path());

    let upload = scratch.path().join("upload.zip");
    tokio::fs::write(&upload, b"zip-bytes").await.unwrap();

    let object = ObjectRef::new("assets", "processed/team/pack.zip");
    store.put(&upload, &object).await.expect("put should succeed");
    assert!(store.path_for(&object).exists());

    let download = scratch.path().join("download.zip");
    store.get(&object, &download).await.expect("get should succeed");
    assert_eq!(tokio::fs::read(&download).await.unwrap(), b"zip-bytes");
}

// ---------------------------------------------------------------------------
// Test: missing object maps to NotFound
// ---------------------------------------------------------------------------

#[tokio::test]
async fn get_missing_object_is_not_found() {
    let root = tempfile::tempdir().unwrap();
    let store = LocalBlobStore::new(root.path());

    let result = store
        .get(
            &ObjectRef::new("assets", "unprocessed/missing.zip"),
            &root.path().join("out.zip"),
        )
        .await;

    assert_matches!(result, Err(StorageError::NotFound { object }) if object == "s3://assets/unprocessed/missing.zip");
}

// ---------------------------------------------------------------------------
// Test: uploading a missing local file is an I/O error
// ---------------------------------------------------------------------------

#[tokio::test]
async fn put_missing_local_file_is_io_error() {
    let root = tempfile::tempdir().unwrap();
    let store = LocalBlobStore::new(root.path());

    let result = store
        .put(
            &root.path().join("nope.zip"),
            &ObjectRef::new("assets", "processed/x.zip"),
        )
        .await;

    assert_matches!(result, Err(StorageError::Io { .. }));
}
