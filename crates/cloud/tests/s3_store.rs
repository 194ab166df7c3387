//! Integration tests for `S3BlobStore` against a minimal local S3 endpoint.

use assert_matches::assert_matches;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use keymaster_cloud::{BlobStore, S3BlobStore, StorageError};
use keymaster_core::types::ObjectRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Serves every request with the given status and body, one connection each.
async fn spawn_endpoint(status: &'static str, body: Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            let body = body.clone();
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut chunk = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = stream.read(&mut chunk).await.unwrap_or(0);
                    if n == 0 {
                        return;
                    }
                    head.extend_from_slice(&chunk[..n]);
                }
                let header = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(header.as_bytes()).await;
                let _ = stream.write_all(&body).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    format!("http://{addr}")
}

fn store_for(endpoint: &str) -> S3BlobStore {
    let config = aws_sdk_s3::Config::builder()
        .behavior_version(BehaviorVersion::latest())
        .region(Region::new("us-east-1"))
        .credentials_provider(Credentials::new("test", "test", None, None, "static"))
        .endpoint_url(endpoint)
        .force_path_style(true)
        .build();
    S3BlobStore::new(aws_sdk_s3::Client::from_conf(config))
}

// ---------------------------------------------------------------------------
// Test: object body is streamed to the local file
// ---------------------------------------------------------------------------

#[tokio::test]
async fn get_streams_large_object_to_file() {
    let payload: Vec<u8> = (0..4 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
    let endpoint = spawn_endpoint("200 OK", payload.clone()).await;
    let store = store_for(&endpoint);
    let scratch = tempfile::tempdir().unwrap();
    let download = scratch.path().join("input.zip");

    store
        .get(&ObjectRef::new("assets", "unprocessed/big.zip"), &download)
        .await
        .expect("get should succeed");

    let written = tokio::fs::read(&download).await.unwrap();
    assert_eq!(written.len(), payload.len());
    assert!(written == payload);
}

#[tokio::test]
async fn missing_key_maps_to_not_found() {
    let body = b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
        <Error><Code>NoSuchKey</Code><Message>The specified key does not exist.</Message></Error>"
        .to_vec();
    let endpoint = spawn_endpoint("404 Not Found", body).await;
    let store = store_for(&endpoint);
    let scratch = tempfile::tempdir().unwrap();

    let result = store
        .get(&ObjectRef::new("assets", "unprocessed/gone.zip"), &scratch.path().join("x.zip"))
        .await;

    assert_matches!(result, Err(StorageError::NotFound { object }) if object == "s3://assets/unprocessed/gone.zip");
}
