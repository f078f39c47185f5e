// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Router tests over SQLite and the in-memory cloud and admin mocks.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use provisioner_core::admin::{AdminClient, AdminClientConfig, MockAdminTransport};
use provisioner_core::cloud::{CloudError, MockCloudProvider};
use provisioner_core::lifecycle::{InstanceManager, LifecycleConfig};
use provisioner_core::persistence::SqlitePersistence;
use provisioner_server::api::{ApiState, build_router};
use serde_json::{Value, json};
use tower::ServiceExt;

const API_KEY: &str = "user-api-key";
const ADMIN_KEY: &str = "admin-key";

struct TestApp {
    router: Router,
    cloud: Arc<MockCloudProvider>,
}

async fn app() -> TestApp {
    let store = Arc::new(SqlitePersistence::in_memory().await.unwrap());
    let cloud = Arc::new(MockCloudProvider::new());
    let admin = AdminClient::new(
        Arc::new(MockAdminTransport::new()),
        AdminClientConfig {
            api_key: ADMIN_KEY.to_string(),
            ready_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(5),
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(5),
            jitter_max: Duration::ZERO,
            ..Default::default()
        },
    );
    let manager = InstanceManager::new(
        store,
        cloud.clone(),
        admin,
        LifecycleConfig {
            control_api_url: "https://control.test".to_string(),
            ..Default::default()
        },
    );

    TestApp {
        router: build_router(ApiState::new(manager, API_KEY, ADMIN_KEY)),
        cloud,
    }
}

async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, key: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("X-API-Key", key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str, key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(key) = key {
        builder = builder.header("X-API-Key", key);
    }
    builder.body(Body::empty()).unwrap()
}

fn phone_home(cloud_instance_id: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/provisioning/phone-home/{}/done", cloud_instance_id))
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from(format!("instance_id={}&hostname=h", cloud_instance_id)))
        .unwrap()
}

#[tokio::test]
async fn test_health_is_public() {
    let app = app().await;
    let (status, body) = send(&app, get("/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["healthy"], true);
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_execution_routes_require_api_key() {
    let app = app().await;

    let (status, _) = send(&app, post_json("/executions/start", None, json!({"userId": "u1"}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &app,
        post_json("/executions/stop", Some("wrong"), json!({"userId": "u1"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // The admin key is not a user key.
    let (status, _) = send(&app, get("/executions/u1/status", Some(ADMIN_KEY))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    assert!(app.cloud.created().await.is_empty());
}

#[tokio::test]
async fn test_start_requires_user_id() {
    let app = app().await;
    let (status, body) = send(
        &app,
        post_json("/executions/start", Some(API_KEY), json!({"userId": "  "})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "userId is required");
}

#[tokio::test]
async fn test_full_flow_over_http() {
    let app = app().await;

    let (status, body) = send(
        &app,
        post_json(
            "/executions/start",
            Some(API_KEY),
            json!({"userId": "u1", "execution": {"task": "sync"}, "region": "eu-central"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["outcome"], "provisioning");
    let cloud_id = body["cloudInstanceId"].as_str().unwrap().to_string();
    assert_eq!(app.cloud.created().await[0].region, "eu-central");

    // The admin process fetches its config with the admin key.
    let uri = format!("/provisioning/config/{}", cloud_id);
    let (status, _) = send(&app, get(&uri, Some(API_KEY))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, body) = send(&app, get(&uri, Some(ADMIN_KEY))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"task": "sync"}));

    let (status, body) = send(&app, phone_home(&cloud_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "executing");
    assert_eq!(body["execution"], "started");

    let (status, body) = send(&app, get("/executions/u1/status", Some(API_KEY))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["exists"], true);
    assert_eq!(body["state"], "EXECUTING");
    assert_eq!(body["executionRunning"], true);

    let (status, body) = send(
        &app,
        post_json("/executions/stop", Some(API_KEY), json!({"userId": "u1"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "scheduled");
    assert!(body["scheduledTerminationAt"].is_string());

    let (_, body) = send(&app, get("/executions/u1/status", Some(API_KEY))).await;
    assert_eq!(body["state"], "IDLE");
    assert_eq!(body["executionRunning"], false);
}

#[tokio::test]
async fn test_stop_without_instance_is_not_an_error() {
    let app = app().await;
    let (status, body) = send(
        &app,
        post_json("/executions/stop", Some(API_KEY), json!({"userId": "nobody"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "not_found");
}

#[tokio::test]
async fn test_unknown_instance_config_is_404() {
    let app = app().await;
    let (status, _) = send(&app, get("/provisioning/config/missing", Some(ADMIN_KEY))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_phone_home_is_ignored() {
    let app = app().await;
    let (status, body) = send(&app, phone_home("missing")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "ignored");
}

#[tokio::test]
async fn test_cloud_failure_maps_to_bad_gateway() {
    let app = app().await;
    app.cloud
        .fail_next_create(CloudError::Status {
            status: 500,
            body: "provider down".to_string(),
        })
        .await;

    let (status, body) = send(
        &app,
        post_json("/executions/start", Some(API_KEY), json!({"userId": "u1"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body["error"].as_str().unwrap().contains("provider down"));
}
