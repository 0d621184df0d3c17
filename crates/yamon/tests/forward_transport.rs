// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::RecordingStore;
use core::time::Duration;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use yamon::accumulator::AccumulatorConfig;
use yamon::envelope::{Batch, LogEntry, Metric, RecordKind};
use yamon::errors::ForwardError;
use yamon::forward::client::ForwardClient;
use yamon::forward::server::{router, KeyRing, DEFAULT_MAX_REQUEST_BYTES};
use yamon::forward::ForwardTarget;
use yamon::sink::DataWriter;
use yamon::storage::{StorageWriter, StoreFlusher};

struct TestServer {
    addr: SocketAddr,
    writer: Arc<StorageWriter<RecordingStore>>,
    store: RecordingStore,
    shutdown: CancellationToken,
}

impl TestServer {
    async fn start(keys: &[(&str, &str)]) -> Self {
        let store = RecordingStore::new();
        let writer = Arc::new(StorageWriter::new(
            AccumulatorConfig::server(),
            StoreFlusher::new(store.clone()),
        ));
        let keys = KeyRing::new(
            keys.iter()
                .map(|(id, secret)| (id.to_string(), secret.to_string()))
                .collect::<HashMap<_, _>>(),
        );
        let app = router(
            Arc::clone(&writer) as Arc<dyn DataWriter>,
            keys,
            DEFAULT_MAX_REQUEST_BYTES,
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
                .unwrap();
        });

        TestServer {
            addr,
            writer,
            store,
            shutdown,
        }
    }

    fn client(&self, credentials: &str) -> ForwardClient {
        let target = ForwardTarget::parse(&format!("http://{credentials}{}", self.addr)).unwrap();
        ForwardClient::new(target, Duration::from_secs(5)).unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn sample_batch() -> Batch {
    let mut batch = Batch::new();
    batch.metrics.push(Metric::gauge("load.1", 0.25).with_tag("host", "web-1"));
    batch.metrics.push(Metric::counter("vmstat.pgfault", 1200.0));
    batch.logs.push(LogEntry::new("nginx", "GET / 200").with_level("info"));
    batch
}

#[tokio::test]
async fn test_batch_reaches_store_one_insert_per_kind() {
    let server = TestServer::start(&[("web-1", "s3cret")]).await;
    let client = server.client("web-1:s3cret@");

    client.submit_batch(&sample_batch()).await.unwrap();
    assert_eq!(server.writer.snapshot_len(), (2, 1, 0));
    server.writer.flush().await;

    let metrics = server.store.inserts_of(RecordKind::Metrics);
    let logs = server.store.inserts_of(RecordKind::Logs);
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].rows, 2);
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].rows, 1);
    assert!(server.store.inserts_of(RecordKind::Events).is_empty());

    let stored = server.store.metrics();
    assert_eq!(stored[0].name, "load.1");
    assert_eq!(stored[0].tags.get("host").map(String::as_str), Some("web-1"));
    assert_eq!(server.store.logs()[0].data, "GET / 200");
}

#[tokio::test]
async fn test_rejected_credentials_write_nothing() {
    let server = TestServer::start(&[("web-1", "s3cret")]).await;
    let client = server.client("web-1:wrong@");

    let result = client.submit_batch(&sample_batch()).await;

    assert!(matches!(
        result,
        Err(ForwardError::Status { status: 401, .. })
    ));
    server.writer.flush().await;
    assert_eq!(server.writer.snapshot_len(), (0, 0, 0));
    assert!(server.store.inserts().is_empty());
}

#[tokio::test]
async fn test_missing_credentials_rejected_when_keys_configured() {
    let server = TestServer::start(&[("web-1", "s3cret")]).await;
    let client = server.client("");

    let result = client.submit_batch(&sample_batch()).await;

    assert!(matches!(
        result,
        Err(ForwardError::Status { status: 401, .. })
    ));
    assert_eq!(server.writer.snapshot_len(), (0, 0, 0));
}

#[tokio::test]
async fn test_open_server_accepts_anonymous_batches() {
    let server = TestServer::start(&[]).await;
    let client = server.client("");

    client.submit_batch(&sample_batch()).await.unwrap();

    assert_eq!(server.writer.snapshot_len(), (2, 1, 0));
}

#[tokio::test]
async fn test_invalid_json_is_bad_request() {
    let server = TestServer::start(&[]).await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/v1/submit-batch", server.addr))
        .header("Authorization", "none")
        .body("{\"m\": [")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 400);
    assert_eq!(server.writer.snapshot_len(), (0, 0, 0));
}

#[tokio::test]
async fn test_unreachable_target_is_request_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let target = ForwardTarget::parse(&format!("http://{addr}")).unwrap();
    let client = ForwardClient::new(target, Duration::from_secs(2)).unwrap();

    assert!(matches!(
        client.submit_batch(&sample_batch()).await,
        Err(ForwardError::Request(_))
    ));
}
