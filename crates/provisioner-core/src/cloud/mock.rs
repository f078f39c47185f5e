// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory cloud provider for testing.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::traits::*;

#[derive(Debug, Clone)]
struct MockCloudInstance {
    instance: CloudInstance,
    ipv4s: Vec<Ipv4Address>,
}

/// Mock cloud provider.
///
/// Created instances get ids `mock-1`, `mock-2`, ... and a usable main IP
/// unless overridden. Failures can be queued per operation.
#[derive(Default)]
pub struct MockCloudProvider {
    next_id: AtomicU64,
    instances: Mutex<HashMap<String, MockCloudInstance>>,
    created: Mutex<Vec<CreateInstanceSpec>>,
    deleted: Mutex<Vec<String>>,
    create_failures: Mutex<VecDeque<CloudError>>,
    delete_failures: Mutex<VecDeque<CloudError>>,
}

impl MockCloudProvider {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `create_instance` fail.
    pub async fn fail_next_create(&self, error: CloudError) {
        self.create_failures.lock().await.push_back(error);
    }

    /// Make the next `delete_instance` fail (before the existence check).
    pub async fn fail_next_delete(&self, error: CloudError) {
        self.delete_failures.lock().await.push_back(error);
    }

    /// Override the main IP reported for an instance.
    pub async fn set_main_ip(&self, id: &str, main_ip: Option<&str>) {
        if let Some(entry) = self.instances.lock().await.get_mut(id) {
            entry.instance.main_ip = main_ip.map(str::to_string);
        }
    }

    /// Override the IPv4 list reported for an instance.
    pub async fn set_ipv4s(&self, id: &str, ipv4s: Vec<Ipv4Address>) {
        if let Some(entry) = self.instances.lock().await.get_mut(id) {
            entry.ipv4s = ipv4s;
        }
    }

    /// Override the creation time reported for an instance.
    pub async fn set_created_at(&self, id: &str, created_at: DateTime<Utc>) {
        if let Some(entry) = self.instances.lock().await.get_mut(id) {
            entry.instance.created_at = Some(created_at.to_rfc3339());
        }
    }

    /// Remove an instance behind the caller's back (later deletes see 404).
    pub async fn forget(&self, id: &str) {
        self.instances.lock().await.remove(id);
    }

    /// Specs of every successful create, in order.
    pub async fn created(&self) -> Vec<CreateInstanceSpec> {
        self.created.lock().await.clone()
    }

    /// Ids passed to every successful delete, in order.
    pub async fn deleted(&self) -> Vec<String> {
        self.deleted.lock().await.clone()
    }

    /// Whether an instance currently exists.
    pub async fn exists(&self, id: &str) -> bool {
        self.instances.lock().await.contains_key(id)
    }
}

#[async_trait]
impl CloudProvider for MockCloudProvider {
    async fn create_instance(&self, spec: &CreateInstanceSpec) -> Result<CloudInstance> {
        if let Some(error) = self.create_failures.lock().await.pop_front() {
            return Err(error);
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("mock-{}", n);
        let ip = format!("198.51.100.{}", n % 250 + 1);
        let instance = CloudInstance {
            id: id.clone(),
            main_ip: Some(ip.clone()),
            created_at: Some(Utc::now().to_rfc3339()),
        };

        self.instances.lock().await.insert(
            id,
            MockCloudInstance {
                instance: instance.clone(),
                ipv4s: vec![Ipv4Address::new(ip)],
            },
        );
        self.created.lock().await.push(spec.clone());

        Ok(instance)
    }

    async fn get_instance(&self, id: &str) -> Result<CloudInstance> {
        self.instances
            .lock()
            .await
            .get(id)
            .map(|entry| entry.instance.clone())
            .ok_or_else(|| CloudError::NotFound(id.to_string()))
    }

    async fn delete_instance(&self, id: &str) -> Result<()> {
        if let Some(error) = self.delete_failures.lock().await.pop_front() {
            return Err(error);
        }
        if self.instances.lock().await.remove(id).is_none() {
            return Err(CloudError::NotFound(id.to_string()));
        }
        self.deleted.lock().await.push(id.to_string());
        Ok(())
    }

    async fn list_ipv4(&self, id: &str) -> Result<Vec<Ipv4Address>> {
        self.instances
            .lock()
            .await
            .get(id)
            .map(|entry| entry.ipv4s.clone())
            .ok_or_else(|| CloudError::NotFound(id.to_string()))
    }
}
