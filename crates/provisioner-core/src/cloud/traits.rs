// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cloud provider trait definitions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from cloud provider operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CloudError {
    /// The cloud instance does not exist (HTTP 404).
    #[error("Cloud instance not found: {0}")]
    NotFound(String),

    /// The provider answered with a non-success status.
    #[error("Cloud API returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The request did not complete.
    #[error("Cloud API request failed: {0}")]
    Http(String),

    /// The response body could not be decoded.
    #[error("Cloud API response could not be decoded: {0}")]
    Decode(String),
}

impl CloudError {
    /// Whether the error means the resource is already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound(_))
    }
}

/// Result type for cloud operations.
pub type Result<T> = std::result::Result<T, CloudError>;

/// Parameters for creating a cloud instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateInstanceSpec {
    /// Region slug.
    pub region: String,
    /// Plan slug.
    pub plan: String,
    /// Request an IPv6 address as well.
    pub enable_ipv6: bool,
    /// Base64-encoded cloud-init document.
    pub user_data: String,
    /// Human-readable label.
    pub label: String,
    /// Snapshot to boot from.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub snapshot_id: Option<String>,
}

/// Instance metadata returned by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudInstance {
    /// Provider-assigned id.
    pub id: String,
    /// Primary IPv4 address; `0.0.0.0` or empty while still being assigned.
    #[serde(default)]
    pub main_ip: Option<String>,
    /// Creation timestamp as reported by the provider.
    #[serde(default, alias = "date_created")]
    pub created_at: Option<String>,
}

impl CloudInstance {
    /// Parsed creation time, if present and well-formed.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Primary address if it is usable.
    pub fn usable_main_ip(&self) -> Option<&str> {
        self.main_ip.as_deref().filter(|ip| is_usable_ipv4(ip))
    }
}

/// One IPv4 address attached to an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv4Address {
    /// Address.
    pub ip: String,
    /// Netmask.
    #[serde(default)]
    pub netmask: Option<String>,
    /// Address type (e.g. `main_ip`).
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl Ipv4Address {
    /// Address with no netmask or type.
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            netmask: None,
            kind: None,
        }
    }
}

/// An address that is assigned and routable.
pub fn is_usable_ipv4(ip: &str) -> bool {
    let ip = ip.trim();
    !ip.is_empty() && ip != "0.0.0.0"
}

/// Cloud provider API.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Create an instance.
    async fn create_instance(&self, spec: &CreateInstanceSpec) -> Result<CloudInstance>;

    /// Fetch instance metadata.
    async fn get_instance(&self, id: &str) -> Result<CloudInstance>;

    /// Delete an instance. A missing instance yields [`CloudError::NotFound`].
    async fn delete_instance(&self, id: &str) -> Result<()>;

    /// List IPv4 addresses attached to an instance.
    async fn list_ipv4(&self, id: &str) -> Result<Vec<Ipv4Address>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usable_ipv4() {
        assert!(is_usable_ipv4("203.0.113.7"));
        assert!(!is_usable_ipv4("0.0.0.0"));
        assert!(!is_usable_ipv4(""));
        assert!(!is_usable_ipv4("  "));
    }

    #[test]
    fn test_instance_created_at_is_lenient() {
        let instance: CloudInstance = serde_json::from_value(serde_json::json!({
            "id": "abc",
            "main_ip": "0.0.0.0",
            "date_created": "2025-03-01T12:00:00+00:00"
        }))
        .unwrap();
        assert!(instance.created_at().is_some());
        assert!(instance.usable_main_ip().is_none());

        let garbled = CloudInstance {
            id: "abc".to_string(),
            main_ip: None,
            created_at: Some("yesterday".to_string()),
        };
        assert!(garbled.created_at().is_none());
    }

    #[test]
    fn test_spec_omits_missing_snapshot() {
        let spec = CreateInstanceSpec {
            region: "us-east-1".to_string(),
            plan: "small-1cpu-1gb".to_string(),
            enable_ipv6: true,
            user_data: "Zm9v".to_string(),
            label: "user-42".to_string(),
            snapshot_id: None,
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert!(json.get("snapshot_id").is_none());
        assert_eq!(json["label"], "user-42");
    }
}
