// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transport to the admin process running on each instance.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Path of the readiness check.
pub const HEALTH_PATH: &str = "/api/infra/health/status";
/// Path that starts the execution.
pub const START_EXECUTION_PATH: &str = "/api/infra/execution/start";
/// Path that stops the execution.
pub const STOP_EXECUTION_PATH: &str = "/api/infra/execution/stop";
/// Credential header understood by the admin process.
pub const API_KEY_HEADER: &str = "X-API-Key";

/// The request could not be delivered or no response arrived.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Where and how to reach one admin process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminTarget {
    /// Base URL, e.g. `http://203.0.113.7:4310`.
    pub base_url: String,
    /// Value sent in the `X-API-Key` header.
    pub api_key: String,
}

/// Calls understood by the admin process.
#[derive(Debug, Clone, PartialEq)]
pub enum AdminRequest {
    /// Readiness check.
    Health,
    /// Start the execution with the given configuration.
    StartExecution(Value),
    /// Stop the running execution.
    StopExecution,
}

impl AdminRequest {
    /// Request path on the admin process.
    pub fn path(&self) -> &'static str {
        match self {
            AdminRequest::Health => HEALTH_PATH,
            AdminRequest::StartExecution(_) => START_EXECUTION_PATH,
            AdminRequest::StopExecution => STOP_EXECUTION_PATH,
        }
    }
}

/// Raw response from the admin process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body (may be empty).
    pub body: String,
}

impl AdminResponse {
    /// Build a response.
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends requests to admin processes.
#[async_trait]
pub trait AdminTransport: Send + Sync {
    /// Deliver `request` to `target`. Any HTTP status is a successful delivery.
    async fn send(
        &self,
        target: &AdminTarget,
        request: AdminRequest,
    ) -> Result<AdminResponse, TransportError>;
}

/// reqwest-backed transport.
pub struct HttpAdminTransport {
    client: reqwest::Client,
}

impl HttpAdminTransport {
    /// Create a transport whose requests time out after `request_timeout`.
    pub fn new(request_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransportError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AdminTransport for HttpAdminTransport {
    async fn send(
        &self,
        target: &AdminTarget,
        request: AdminRequest,
    ) -> Result<AdminResponse, TransportError> {
        let url = format!("{}{}", target.base_url.trim_end_matches('/'), request.path());

        let builder = match request {
            AdminRequest::Health => self.client.get(&url),
            AdminRequest::StartExecution(config) => self.client.post(&url).json(&config),
            AdminRequest::StopExecution => self.client.post(&url),
        };

        let response = builder
            .header(API_KEY_HEADER, &target.api_key)
            .send()
            .await
            .map_err(|e| TransportError(format!("{} request failed: {}", url, e)))?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        Ok(AdminResponse { status, body })
    }
}
