// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for provisioner-core.

use thiserror::Error;

use crate::admin::AdminError;
use crate::cloud::CloudError;

/// Provisioner errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Cloud provider call failed.
    #[error("Cloud provider error: {0}")]
    Cloud(#[from] CloudError),

    /// Admin process call failed.
    #[error("Admin API error: {0}")]
    Admin(#[from] AdminError),

    /// The user already owns an active instance (storage-level uniqueness).
    #[error("User '{user_id}' already has an active instance")]
    ActiveInstanceExists {
        /// The user that owns the instance.
        user_id: String,
    },

    /// Instance was not found.
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    /// A compare-and-set write kept losing to concurrent writers.
    #[error("Instance '{0}' is being modified concurrently; giving up after repeated conflicts")]
    Contention(String),

    /// A stored record could not be decoded into the domain model.
    #[error("Invalid stored record: {0}")]
    InvalidRecord(String),
}

/// Result type using provisioner Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the error came from an unreachable or failing remote service.
    pub fn is_upstream(&self) -> bool {
        matches!(self, Error::Cloud(_) | Error::Admin(_))
    }
}
