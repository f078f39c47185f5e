// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for lifecycle integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use provisioner_core::admin::{AdminClient, AdminClientConfig, MockAdminTransport};
use provisioner_core::cloud::MockCloudProvider;
use provisioner_core::lifecycle::{InstanceManager, LifecycleConfig, StartRequest};
use provisioner_core::model::Instance;
use provisioner_core::persistence::{Persistence, SqlitePersistence};

pub const ADMIN_KEY: &str = "admin-key";

/// In-memory store, mock cloud, mock admin process and a manager over them.
pub struct Harness {
    pub store: Arc<SqlitePersistence>,
    pub cloud: Arc<MockCloudProvider>,
    pub admin: Arc<MockAdminTransport>,
    pub manager: InstanceManager,
}

impl Harness {
    pub async fn new() -> Self {
        let store = Arc::new(
            SqlitePersistence::in_memory()
                .await
                .expect("Failed to create in-memory store"),
        );
        Self::with_store(store.clone(), store).await
    }

    /// Build a harness whose manager goes through `manager_store`.
    pub async fn with_store(store: Arc<SqlitePersistence>, manager_store: Arc<dyn Persistence>) -> Self {
        let cloud = Arc::new(MockCloudProvider::new());
        let admin = Arc::new(MockAdminTransport::new());
        let manager = InstanceManager::new(
            manager_store,
            cloud.clone(),
            AdminClient::new(admin.clone(), fast_admin_config()),
            lifecycle_config(),
        );
        Self {
            store,
            cloud,
            admin,
            manager,
        }
    }

    /// Reload an instance by record id.
    pub async fn reload(&self, id: &str) -> Instance {
        self.store
            .get_instance(id)
            .await
            .expect("Failed to load instance")
            .expect("Instance missing")
    }

    /// Reload the instance created for a cloud id.
    pub async fn by_cloud_id(&self, cloud_instance_id: &str) -> Instance {
        self.store
            .find_by_cloud_instance_id(cloud_instance_id)
            .await
            .expect("Failed to load instance")
            .expect("Instance missing")
    }

    /// Overwrite the billing anchor of an instance.
    pub async fn set_anchor(&self, id: &str, anchor: DateTime<Utc>) {
        let mut instance = self.reload(id).await;
        instance.instance_created_at = Some(anchor);
        assert!(self.store.update_instance(&mut instance).await.unwrap());
    }
}

pub fn fast_admin_config() -> AdminClientConfig {
    AdminClientConfig {
        api_key: ADMIN_KEY.to_string(),
        ready_timeout: Duration::from_millis(200),
        poll_interval: Duration::from_millis(5),
        max_attempts: 3,
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(5),
        jitter_max: Duration::ZERO,
        ..Default::default()
    }
}

pub fn lifecycle_config() -> LifecycleConfig {
    LifecycleConfig {
        control_api_url: "https://control.test".to_string(),
        ..Default::default()
    }
}

pub fn start_request(user_id: &str) -> StartRequest {
    StartRequest {
        user_id: user_id.to_string(),
        execution_config: Some(serde_json::json!({"task": "sync", "shard": 1})),
        ..Default::default()
    }
}
