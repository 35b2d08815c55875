//! HTTP PUT transport against a mock object store

mod common;

use common::{payloads, within_deadline};
use mockito::{Matcher, Server};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;
use upload_batch::batch::{Batch, FailureKind, OperationId, PayloadRef};
use upload_batch::transport::{HttpPutConfig, HttpPutTransport};
use url::Url;

fn transport_for(base: &str) -> HttpPutTransport {
    let endpoint = Url::parse(base).expect("mock url");
    HttpPutTransport::new(HttpPutConfig::new(endpoint, "test-bucket").with_timeout(Duration::from_secs(5)))
        .expect("client")
}

#[tokio::test]
async fn test_put_batch_with_full_store() {
    let mut server = Server::new_async().await;
    let mut mocks = Vec::new();
    for i in 0..6 {
        let path = format!("/test-bucket/object-{i}");
        let mock = if i == 4 {
            server
                .mock("PUT", path.as_str())
                .with_status(507)
                .with_body("<Error><Code>XMinioStorageFull</Code></Error>")
                .expect(1)
                .create_async()
                .await
        } else {
            server
                .mock("PUT", path.as_str())
                .with_status(200)
                .expect(1)
                .create_async()
                .await
        };
        mocks.push(mock);
    }

    let batch = assert_ok!(Batch::spawn(Arc::new(transport_for(&server.url())), payloads(6, 128), 2));
    let result = assert_ok!(within_deadline(batch.wait()).await);

    assert_eq!(result.success_count(), 5);
    let reason = &result.failures[&OperationId(4)];
    assert_eq!(reason.kind, FailureKind::Transport);
    assert!(reason.message.contains("507"));
    assert!(reason.message.contains("XMinioStorageFull"));
    for mock in &mocks {
        mock.assert_async().await;
    }
}

#[tokio::test]
async fn test_put_streams_file_payload() {
    let mut server = Server::new_async().await;
    let content = "large-file contents";
    let path = std::env::temp_dir().join(format!("upload-batch-{}.bin", uuid::Uuid::new_v4()));
    tokio::fs::write(&path, content).await.unwrap();

    let mock = server
        .mock("PUT", "/test-bucket/object-0")
        .match_header("content-length", content.len().to_string().as_str())
        .match_body(Matcher::Exact(content.to_string()))
        .with_status(200)
        .create_async()
        .await;

    let batch = assert_ok!(Batch::spawn(
        Arc::new(transport_for(&server.url())),
        vec![PayloadRef::file(&path)],
        1
    ));
    let result = assert_ok!(within_deadline(batch.wait()).await);
    let _ = tokio::fs::remove_file(&path).await;

    assert!(result.all_succeeded());
    mock.assert_async().await;
}

#[tokio::test]
async fn test_missing_file_fails_only_that_operation() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("PUT", "/test-bucket/object-1")
        .with_status(200)
        .create_async()
        .await;

    let missing = std::env::temp_dir().join(format!("upload-batch-missing-{}", uuid::Uuid::new_v4()));
    let batch = assert_ok!(Batch::spawn(
        Arc::new(transport_for(&server.url())),
        vec![PayloadRef::file(missing), PayloadRef::bytes("ok")],
        2
    ));
    let result = assert_ok!(within_deadline(batch.wait()).await);

    assert_eq!(result.succeeded.len(), 1);
    assert!(result.failures[&OperationId(0)]
        .message
        .starts_with("cannot read payload"));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_unreachable_store_drains_with_failures() {
    let batch = assert_ok!(Batch::spawn(
        Arc::new(transport_for("http://127.0.0.1:1")),
        payloads(5, 16),
        2
    ));
    let result = assert_ok!(within_deadline(batch.wait()).await);

    assert_eq!(result.failure_count(), 5);
    assert!(result
        .failures
        .values()
        .all(|r| r.kind == FailureKind::Transport));
    assert_eq!(batch.snapshot().permits.available, 2);
}
