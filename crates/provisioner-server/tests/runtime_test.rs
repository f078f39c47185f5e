// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime start/shutdown tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use provisioner_core::admin::MockAdminTransport;
use provisioner_core::cloud::MockCloudProvider;
use provisioner_core::persistence::SqlitePersistence;
use provisioner_core::scheduler::TerminationSchedulerConfig;
use provisioner_server::runtime::ProvisionerRuntime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::test]
async fn test_build_requires_components() {
    let result = ProvisionerRuntime::builder().api_key("k").build();
    assert!(result.is_err());

    let store = Arc::new(SqlitePersistence::in_memory().await.unwrap());
    let result = ProvisionerRuntime::builder()
        .persistence(store)
        .cloud(Arc::new(MockCloudProvider::new()))
        .admin_transport(Arc::new(MockAdminTransport::new()))
        .build();
    let err = result.err().expect("missing api key must fail");
    assert!(err.to_string().contains("api key"));
}

#[tokio::test]
async fn test_runtime_serves_health_and_shuts_down() {
    let store = Arc::new(SqlitePersistence::in_memory().await.unwrap());

    let runtime = ProvisionerRuntime::builder()
        .persistence(store)
        .cloud(Arc::new(MockCloudProvider::new()))
        .admin_transport(Arc::new(MockAdminTransport::new()))
        .bind_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
        .api_key("test-key")
        .scheduler(TerminationSchedulerConfig {
            poll_interval: Duration::from_millis(20),
            shutdown_grace: Duration::from_millis(100),
            ..Default::default()
        })
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    assert!(runtime.is_running());
    assert_ne!(runtime.local_addr().port(), 0);

    let mut stream = TcpStream::connect(runtime.local_addr()).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert!(response.contains("\"healthy\":true"));

    tokio::time::timeout(Duration::from_secs(5), runtime.shutdown())
        .await
        .expect("shutdown timed out")
        .unwrap();
}
