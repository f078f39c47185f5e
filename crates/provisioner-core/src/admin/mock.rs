// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock admin transport for testing.
//!
//! Responses are scripted per request kind; when a script runs dry the
//! transport answers like a healthy admin process.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use super::transport::{AdminRequest, AdminResponse, AdminTarget, AdminTransport, TransportError};

/// Request kind used to key scripted responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdminCall {
    /// `GET /api/infra/health/status`.
    Health,
    /// `POST /api/infra/execution/start`.
    Start,
    /// `POST /api/infra/execution/stop`.
    Stop,
}

impl From<&AdminRequest> for AdminCall {
    fn from(request: &AdminRequest) -> Self {
        match request {
            AdminRequest::Health => AdminCall::Health,
            AdminRequest::StartExecution(_) => AdminCall::Start,
            AdminRequest::StopExecution => AdminCall::Stop,
        }
    }
}

type Scripted = Result<AdminResponse, TransportError>;

/// Pauses a gated call until released.
#[derive(Clone, Default)]
pub struct CallGate {
    /// Notified when a gated call arrives.
    pub entered: Arc<Notify>,
    /// Notify once to let the gated call proceed.
    pub release: Arc<Notify>,
}

/// Scripted in-memory admin transport.
#[derive(Default)]
pub struct MockAdminTransport {
    scripts: Mutex<HashMap<AdminCall, VecDeque<Scripted>>>,
    calls: Mutex<Vec<(AdminTarget, AdminRequest)>>,
    gates: Mutex<HashMap<AdminCall, CallGate>>,
}

impl MockAdminTransport {
    /// Create a transport that behaves like a healthy admin process.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next call of `call`.
    pub async fn push_response(&self, call: AdminCall, status: u16, body: &str) {
        self.scripts
            .lock()
            .await
            .entry(call)
            .or_default()
            .push_back(Ok(AdminResponse::new(status, body)));
    }

    /// Queue a transport failure for the next call of `call`.
    pub async fn push_transport_error(&self, call: AdminCall, message: &str) {
        self.scripts
            .lock()
            .await
            .entry(call)
            .or_default()
            .push_back(Err(TransportError(message.to_string())));
    }

    /// Hold the next call of `call` until `gate.release` is notified.
    pub async fn gate(&self, call: AdminCall) -> CallGate {
        let gate = CallGate::default();
        self.gates.lock().await.insert(call, gate.clone());
        gate
    }

    /// Hold the next start-execution call.
    pub async fn gate_start(&self) -> CallGate {
        self.gate(AdminCall::Start).await
    }

    /// Hold the next stop-execution call.
    pub async fn gate_stop(&self) -> CallGate {
        self.gate(AdminCall::Stop).await
    }

    /// All requests received so far.
    pub async fn calls(&self) -> Vec<(AdminTarget, AdminRequest)> {
        self.calls.lock().await.clone()
    }

    /// Number of requests of one kind received so far.
    pub async fn call_count(&self, call: AdminCall) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|(_, request)| AdminCall::from(request) == call)
            .count()
    }

    fn default_response(call: AdminCall) -> AdminResponse {
        match call {
            AdminCall::Health => AdminResponse::new(200, r#"{"status":"ok"}"#),
            AdminCall::Start => AdminResponse::new(200, r#"{"state":"started"}"#),
            AdminCall::Stop => AdminResponse::new(200, r#"{"state":"stopped"}"#),
        }
    }
}

#[async_trait]
impl AdminTransport for MockAdminTransport {
    async fn send(
        &self,
        target: &AdminTarget,
        request: AdminRequest,
    ) -> Result<AdminResponse, TransportError> {
        let call = AdminCall::from(&request);
        self.calls.lock().await.push((target.clone(), request));

        let gate = self.gates.lock().await.remove(&call);
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        let scripted = self
            .scripts
            .lock()
            .await
            .get_mut(&call)
            .and_then(|queue| queue.pop_front());

        scripted.unwrap_or_else(|| Ok(Self::default_response(call)))
    }
}
