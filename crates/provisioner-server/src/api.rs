// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP API.
//!
//! | Method | Path | Guard | Description |
//! |---|---|---|---|
//! | POST | `/executions/start` | API key | Start or restart the user's execution |
//! | POST | `/executions/stop` | API key | Stop and schedule termination |
//! | GET | `/executions/{user_id}/status` | API key | Latest instance status |
//! | POST | `/provisioning/phone-home/{instance_id}/done` | none | Boot-complete callback |
//! | GET | `/provisioning/config/{instance_id}` | admin key | Execution config for an instance |
//! | GET | `/health` | none | Liveness and database check |

use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use provisioner_core::Error as CoreError;
use provisioner_core::lifecycle::{InstanceManager, StartRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Header carrying the caller's key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    manager: InstanceManager,
    api_key: Arc<str>,
    admin_api_key: Arc<str>,
}

impl ApiState {
    /// Create handler state. `api_key` guards the user-facing routes and
    /// `admin_api_key` the instance config route.
    pub fn new(manager: InstanceManager, api_key: &str, admin_api_key: &str) -> Self {
        Self {
            manager,
            api_key: Arc::from(api_key),
            admin_api_key: Arc::from(admin_api_key),
        }
    }
}

/// Build the API router.
pub fn build_router(state: ApiState) -> Router {
    let user_routes = Router::new()
        .route("/executions/start", post(start_execution))
        .route("/executions/stop", post(stop_execution))
        .route("/executions/{user_id}/status", get(execution_status))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    let instance_routes = Router::new()
        .route("/provisioning/config/{instance_id}", get(instance_config))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin_key));

    Router::new()
        .merge(user_routes)
        .merge(instance_routes)
        .route("/provisioning/phone-home/{instance_id}/done", post(phone_home_done))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Guards ─────────────────────────────────────────────────────

async fn require_api_key(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    check_key(&state.api_key, request, next).await
}

async fn require_admin_key(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    check_key(&state.admin_api_key, request, next).await
}

async fn check_key(expected: &str, request: Request, next: Next) -> Response {
    let authorized = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|key| !expected.is_empty() && key == expected);

    if !authorized {
        debug!(path = %request.uri().path(), "Rejected request without a valid API key");
        return ApiError::Unauthorized.into_response();
    }
    next.run(request).await
}

// ── Errors ─────────────────────────────────────────────────────

/// Errors returned by handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request is malformed.
    #[error("{0}")]
    BadRequest(String),
    /// Missing or wrong API key.
    #[error("unauthorized")]
    Unauthorized,
    /// Nothing found for the given id.
    #[error("{0}")]
    NotFound(String),
    /// Lifecycle operation failed.
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl ApiError {
    /// HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Core(CoreError::ActiveInstanceExists { .. }) => StatusCode::CONFLICT,
            Self::Core(e) if e.is_upstream() => StatusCode::BAD_GATEWAY,
            Self::Core(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "Request failed");
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

// ── Executions ─────────────────────────────────────────────────

/// Start request body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartExecutionRequest {
    /// Requesting user.
    #[serde(default)]
    pub user_id: String,
    /// Opaque execution configuration.
    #[serde(default)]
    pub execution: Option<Value>,
    /// Region override.
    #[serde(default)]
    pub region: Option<String>,
    /// Plan override.
    #[serde(default)]
    pub plan: Option<String>,
    /// Snapshot override.
    #[serde(default)]
    pub snapshot_id: Option<String>,
}

/// Stop request body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopExecutionRequest {
    /// Requesting user.
    #[serde(default)]
    pub user_id: String,
}

fn require_user_id(user_id: &str) -> Result<String, ApiError> {
    let user_id = user_id.trim();
    if user_id.is_empty() {
        return Err(ApiError::BadRequest("userId is required".to_string()));
    }
    Ok(user_id.to_string())
}

/// POST /executions/start
async fn start_execution(
    State(state): State<ApiState>,
    Json(body): Json<StartExecutionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = require_user_id(&body.user_id)?;
    info!(user_id = %user_id, "Start requested");

    let outcome = state
        .manager
        .start(StartRequest {
            user_id,
            execution_config: body.execution,
            region: body.region,
            plan: body.plan,
            snapshot_id: body.snapshot_id,
        })
        .await?;

    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

/// POST /executions/stop
async fn stop_execution(
    State(state): State<ApiState>,
    Json(body): Json<StopExecutionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = require_user_id(&body.user_id)?;
    info!(user_id = %user_id, "Stop requested");

    let outcome = state.manager.stop(&user_id).await?;
    Ok(Json(outcome))
}

/// GET /executions/{user_id}/status
async fn execution_status(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = require_user_id(&user_id)?;
    Ok(Json(state.manager.status(&user_id).await?))
}

// ── Provisioning ───────────────────────────────────────────────

/// POST /provisioning/phone-home/{instance_id}/done
///
/// Called by cloud-init with the provider's instance id. The form body
/// (instance id, hostname) carries nothing the path does not.
async fn phone_home_done(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    info!(cloud_instance_id = %instance_id, "Phone-home received");
    let outcome = state.manager.phone_home_done(&instance_id).await?;
    Ok(Json(outcome))
}

/// GET /provisioning/config/{instance_id}
async fn instance_config(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state
        .manager
        .get_execution_config_by_instance(&instance_id)
        .await?
    {
        Some(config) => Ok(Json(config)),
        None => Err(ApiError::NotFound(format!(
            "no execution config for instance '{}'",
            instance_id
        ))),
    }
}

// ── Health ─────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthBody {
    healthy: bool,
    version: &'static str,
}

/// GET /health
async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    match state.manager.store().health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthBody {
                healthy: true,
                version: env!("CARGO_PKG_VERSION"),
            }),
        ),
        Err(e) => {
            warn!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthBody {
                    healthy: false,
                    version: env!("CARGO_PKG_VERSION"),
                }),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use provisioner_core::cloud::CloudError;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            ApiError::BadRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::Core(CoreError::ActiveInstanceExists {
                user_id: "u".into()
            })
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::Core(CoreError::Cloud(CloudError::Http("down".into()))).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::Core(CoreError::Contention("i-1".into())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_require_user_id() {
        assert!(matches!(require_user_id("  "), Err(ApiError::BadRequest(_))));
        assert_eq!(require_user_id(" user-1 ").unwrap(), "user-1");
    }
}
