// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cloud teardown shared by stop, phone-home and the termination scheduler.
//!
//! An instance enters `TERMINATING` holding a termination lease. The final
//! write (`TERMINATED` or `ERROR`) only applies while that lease is still the
//! one on the record, so a holder whose lease expired and was reclaimed
//! cannot overwrite the new holder's result.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cloud::CloudProvider;
use crate::error::{Error, Result};
use crate::model::{Instance, InstanceState, TerminationLease, saturating_add};
use crate::persistence::{Persistence, update_instance_with};

/// Move `instance` into `TERMINATING` under a fresh lease (in memory only).
pub fn begin_termination(instance: &mut Instance, lease_ttl: Duration, now: DateTime<Utc>) {
    instance.state = InstanceState::Terminating;
    instance.execution_running = false;
    instance.scheduled_termination_at = None;
    instance.termination_lease = Some(TerminationLease {
        lease_id: Uuid::new_v4().to_string(),
        expires_at: saturating_add(now, lease_ttl),
        locked_at: now,
    });
}

/// Deletes cloud instances and records the result.
#[derive(Clone)]
pub struct Terminator {
    store: Arc<dyn Persistence>,
    cloud: Arc<dyn CloudProvider>,
}

impl Terminator {
    /// Create a terminator.
    pub fn new(store: Arc<dyn Persistence>, cloud: Arc<dyn CloudProvider>) -> Self {
        Self { store, cloud }
    }

    /// Delete the cloud resource of a `TERMINATING` instance.
    ///
    /// A 404 from the provider counts as success. Any other failure moves the
    /// instance to `ERROR` and is returned. If the lease was lost meanwhile the
    /// record is left untouched.
    pub async fn terminate(&self, instance: Instance) -> Result<Instance> {
        let lease_id = instance
            .termination_lease
            .as_ref()
            .map(|lease| lease.lease_id.clone())
            .ok_or_else(|| {
                Error::InvalidRecord(format!(
                    "instance '{}' is terminating without a lease",
                    instance.id
                ))
            })?;

        let deleted = match self.cloud.delete_instance(&instance.cloud_instance_id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                info!(
                    instance_id = %instance.id,
                    cloud_instance_id = %instance.cloud_instance_id,
                    "Cloud instance already gone"
                );
                Ok(())
            }
            Err(e) => Err(e),
        };

        let holds_lease = |i: &Instance| {
            i.state == InstanceState::Terminating
                && i.termination_lease.as_ref().map(|l| l.lease_id.as_str()) == Some(lease_id.as_str())
        };

        match deleted {
            Ok(()) => {
                let written = update_instance_with(self.store.as_ref(), instance.clone(), |i| {
                    if !holds_lease(i) {
                        return false;
                    }
                    i.mark_terminated();
                    true
                })
                .await?;

                match written {
                    Some(terminated) => {
                        info!(
                            instance_id = %terminated.id,
                            user_id = %terminated.user_id,
                            cloud_instance_id = %terminated.cloud_instance_id,
                            "Instance terminated"
                        );
                        Ok(terminated)
                    }
                    None => {
                        warn!(instance_id = %instance.id, "Termination lease lost; leaving record to the new holder");
                        Ok(instance)
                    }
                }
            }
            Err(cloud_error) => {
                error!(
                    instance_id = %instance.id,
                    cloud_instance_id = %instance.cloud_instance_id,
                    error = %cloud_error,
                    "Cloud delete failed"
                );
                let written = update_instance_with(self.store.as_ref(), instance.clone(), |i| {
                    if !holds_lease(i) {
                        return false;
                    }
                    i.state = InstanceState::Error;
                    i.execution_running = false;
                    i.termination_lease = None;
                    true
                })
                .await?;
                if written.is_none() {
                    warn!(instance_id = %instance.id, "Termination lease lost before recording failure");
                }
                Err(Error::Cloud(cloud_error))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{CloudError, CreateInstanceSpec, MockCloudProvider};
    use crate::model::fixtures::provisioning_instance;
    use crate::persistence::SqlitePersistence;

    struct Fixture {
        store: Arc<SqlitePersistence>,
        cloud: Arc<MockCloudProvider>,
        terminator: Terminator,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let cloud = Arc::new(MockCloudProvider::new());
        let terminator = Terminator::new(store.clone(), cloud.clone());
        Fixture {
            store,
            cloud,
            terminator,
        }
    }

    async fn terminating_instance(f: &Fixture) -> Instance {
        let created = f
            .cloud
            .create_instance(&CreateInstanceSpec {
                region: "r".to_string(),
                plan: "p".to_string(),
                enable_ipv6: true,
                user_data: String::new(),
                label: "user-1".to_string(),
                snapshot_id: None,
            })
            .await
            .unwrap();

        let mut instance = provisioning_instance("user-1", &created.id);
        begin_termination(&mut instance, Duration::from_secs(120), Utc::now());
        f.store.insert_instance(&instance).await.unwrap();
        instance
    }

    #[tokio::test]
    async fn test_terminate_success() {
        let f = fixture().await;
        let instance = terminating_instance(&f).await;

        let terminated = f.terminator.terminate(instance.clone()).await.unwrap();

        assert_eq!(terminated.state, InstanceState::Terminated);
        assert!(terminated.termination_lease.is_none());
        assert_eq!(f.cloud.deleted().await, vec![instance.cloud_instance_id.clone()]);

        let stored = f.store.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(stored.state, InstanceState::Terminated);
    }

    #[tokio::test]
    async fn test_missing_cloud_instance_counts_as_terminated() {
        let f = fixture().await;
        let instance = terminating_instance(&f).await;
        f.cloud.forget(&instance.cloud_instance_id).await;

        let terminated = f.terminator.terminate(instance).await.unwrap();
        assert_eq!(terminated.state, InstanceState::Terminated);
    }

    #[tokio::test]
    async fn test_cloud_failure_moves_to_error() {
        let f = fixture().await;
        let instance = terminating_instance(&f).await;
        f.cloud
            .fail_next_delete(CloudError::Status {
                status: 500,
                body: "boom".to_string(),
            })
            .await;

        let err = f.terminator.terminate(instance.clone()).await.unwrap_err();
        assert!(matches!(err, Error::Cloud(CloudError::Status { status: 500, .. })));

        let stored = f.store.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(stored.state, InstanceState::Error);
        assert!(stored.termination_lease.is_none());
    }

    #[tokio::test]
    async fn test_lost_lease_leaves_record_alone() {
        let f = fixture().await;
        let instance = terminating_instance(&f).await;

        // Another holder reclaimed the record with its own lease.
        let mut other = instance.clone();
        begin_termination(&mut other, Duration::from_secs(120), Utc::now());
        assert!(f.store.update_instance(&mut other).await.unwrap());

        f.terminator.terminate(instance.clone()).await.unwrap();

        let stored = f.store.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(stored.state, InstanceState::Terminating);
        assert_eq!(
            stored.termination_lease.unwrap().lease_id,
            other.termination_lease.unwrap().lease_id
        );
    }
}
