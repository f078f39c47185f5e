// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Admin readiness and execution client.
//!
//! Every instance runs an admin process that starts and stops the user's
//! execution. A freshly booted instance may take a while before that process
//! answers, so starting an execution first waits for readiness and then
//! retries with capped exponential backoff.

pub mod mock;
pub mod transport;

pub use mock::{AdminCall, CallGate, MockAdminTransport};
pub use transport::{
    AdminRequest, AdminResponse, AdminTarget, AdminTransport, HttpAdminTransport, TransportError,
};

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::model::Instance;

/// Errors from admin process calls.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AdminError {
    /// The health check never succeeded within the timeout.
    #[error("Admin API not ready within {waited:?} (last: {last})")]
    NotReady {
        /// How long readiness was polled.
        waited: Duration,
        /// Last observed status or transport failure.
        last: String,
    },

    /// The admin process answered with a non-success status.
    #[error("Admin API returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The admin process rejected the credential.
    #[error("Admin API unauthorized ({status})")]
    Unauthorized {
        /// 401 or 403.
        status: u16,
    },

    /// Every start attempt failed.
    #[error("Execution start failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// Error of the final attempt.
        last: String,
    },

    /// The request did not reach the admin process.
    #[error("Admin API unreachable: {0}")]
    Transport(#[from] TransportError),

    /// The instance has no known address yet.
    #[error("Instance '{0}' has no admin address")]
    NoAddress(String),
}

/// Outcome of polling the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Health check returned success.
    Ready,
    /// Health check returned 401/403/404/405; polling stopped early.
    Rejected(u16),
}

/// Execution state reported by the admin process after a start call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionState {
    /// The execution was started by this call.
    Started,
    /// The execution was already running.
    AlreadyRunning,
}

#[derive(Deserialize)]
struct StartResponseBody {
    state: Option<String>,
}

/// Admin client configuration.
#[derive(Debug, Clone)]
pub struct AdminClientConfig {
    /// Port the admin process listens on.
    pub api_port: u16,
    /// Credential used when the instance record has none.
    pub api_key: String,
    /// Default readiness timeout.
    pub ready_timeout: Duration,
    /// Delay between health checks.
    pub poll_interval: Duration,
    /// Start attempts after readiness.
    pub max_attempts: u32,
    /// Backoff before the second attempt.
    pub backoff_base: Duration,
    /// Backoff cap (before jitter).
    pub backoff_max: Duration,
    /// Upper bound (exclusive) of the random jitter added to each backoff.
    pub jitter_max: Duration,
}

impl Default for AdminClientConfig {
    fn default() -> Self {
        Self {
            api_port: 4310,
            api_key: String::new(),
            ready_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(1200),
            max_attempts: 6,
            backoff_base: Duration::from_millis(1500),
            backoff_max: Duration::from_secs(8),
            jitter_max: Duration::from_millis(250),
        }
    }
}

/// Client for the per-instance admin process.
#[derive(Clone)]
pub struct AdminClient {
    transport: Arc<dyn AdminTransport>,
    config: AdminClientConfig,
}

impl AdminClient {
    /// Create a client over the given transport.
    pub fn new(transport: Arc<dyn AdminTransport>, config: AdminClientConfig) -> Self {
        Self { transport, config }
    }

    /// Client configuration.
    pub fn config(&self) -> &AdminClientConfig {
        &self.config
    }

    /// Admin base URL for an instance address.
    pub fn base_url_for(&self, ipv4: &str) -> String {
        format!("http://{}:{}", ipv4, self.config.api_port)
    }

    /// Resolve where to reach the admin process of `instance`.
    pub fn target_for(&self, instance: &Instance) -> Result<AdminTarget, AdminError> {
        let base_url = match (&instance.admin_api_url, &instance.ipv4) {
            (Some(url), _) => url.clone(),
            (None, Some(ip)) => self.base_url_for(ip),
            (None, None) => return Err(AdminError::NoAddress(instance.id.clone())),
        };
        let api_key = instance
            .admin_api_key
            .clone()
            .unwrap_or_else(|| self.config.api_key.clone());

        Ok(AdminTarget { base_url, api_key })
    }

    /// Poll the health endpoint until it answers or `timeout` elapses.
    ///
    /// 401/403/404/405 stop polling immediately with [`Readiness::Rejected`];
    /// any other status or a transport failure keeps polling.
    pub async fn wait_for_ready(
        &self,
        target: &AdminTarget,
        timeout: Option<Duration>,
    ) -> Result<Readiness, AdminError> {
        let timeout = timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(self.config.ready_timeout);
        let deadline = Instant::now() + timeout;
        loop {
            let last = match self.transport.send(target, AdminRequest::Health).await {
                Ok(response) if response.is_success() => {
                    debug!(admin_url = %target.base_url, "Admin API ready");
                    return Ok(Readiness::Ready);
                }
                Ok(response) if matches!(response.status, 401 | 403 | 404 | 405) => {
                    debug!(admin_url = %target.base_url, status = response.status, "Admin health check rejected");
                    return Ok(Readiness::Rejected(response.status));
                }
                Ok(response) => format!("{} {}", response.status, response.body),
                Err(e) => e.to_string(),
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(AdminError::NotReady {
                    waited: timeout,
                    last,
                });
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    /// Issue a single start-execution call.
    pub async fn start_execution_once(
        &self,
        target: &AdminTarget,
        execution_config: &Value,
    ) -> Result<ExecutionState, AdminError> {
        let response = self
            .transport
            .send(target, AdminRequest::StartExecution(execution_config.clone()))
            .await?;

        if matches!(response.status, 401 | 403) {
            return Err(AdminError::Unauthorized {
                status: response.status,
            });
        }
        if !response.is_success() {
            return Err(AdminError::Status {
                status: response.status,
                body: response.body,
            });
        }

        let state = serde_json::from_str::<StartResponseBody>(&response.body)
            .ok()
            .and_then(|body| body.state);
        Ok(match state.as_deref() {
            Some("already-running") => ExecutionState::AlreadyRunning,
            _ => ExecutionState::Started,
        })
    }

    /// Wait for readiness, then start the execution with retries.
    ///
    /// Unauthorized responses abort immediately; other failures are retried
    /// up to `max_attempts` times with [`AdminClient::backoff`] between them.
    pub async fn start_execution_with_retry(
        &self,
        target: &AdminTarget,
        execution_config: &Value,
    ) -> Result<ExecutionState, AdminError> {
        if let Readiness::Rejected(status) = self.wait_for_ready(target, None).await? {
            debug!(admin_url = %target.base_url, status, "Proceeding to start despite rejected health check");
        }

        let attempts = self.config.max_attempts.max(1);
        let mut last = String::new();

        for attempt in 0..attempts {
            match self.start_execution_once(target, execution_config).await {
                Ok(state) => {
                    info!(admin_url = %target.base_url, attempt = attempt + 1, state = ?state, "Execution started");
                    return Ok(state);
                }
                Err(e @ AdminError::Unauthorized { .. }) => return Err(e),
                Err(e) => {
                    warn!(
                        admin_url = %target.base_url,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        error = %e,
                        "Execution start attempt failed"
                    );
                    last = e.to_string();
                }
            }

            if attempt + 1 < attempts {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }

        Err(AdminError::RetriesExhausted { attempts, last })
    }

    /// Issue a single stop-execution call.
    pub async fn stop_execution(&self, target: &AdminTarget) -> Result<(), AdminError> {
        let response = self
            .transport
            .send(target, AdminRequest::StopExecution)
            .await?;

        if matches!(response.status, 401 | 403) {
            return Err(AdminError::Unauthorized {
                status: response.status,
            });
        }
        if !response.is_success() {
            return Err(AdminError::Status {
                status: response.status,
                body: response.body,
            });
        }
        Ok(())
    }

    /// `min(base * 2^attempt, max)` plus random jitter below `jitter_max`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponential = 2u32
            .checked_pow(attempt)
            .and_then(|factor| self.config.backoff_base.checked_mul(factor))
            .unwrap_or(self.config.backoff_max)
            .min(self.config.backoff_max);

        let jitter_ms = u64::try_from(self.config.jitter_max.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..jitter_ms)
        };

        exponential + Duration::from_millis(jitter)
    }
}
