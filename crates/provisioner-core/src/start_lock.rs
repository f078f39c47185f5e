// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-user start lock.
//!
//! Guards the window between "no active instance found" and "instance record
//! inserted" so concurrent starts for one user create at most one cloud
//! instance. The lock is a lease: a crashed holder's lock becomes acquirable
//! again once its TTL elapses.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{StartLockRecord, saturating_add};
use crate::persistence::Persistence;

/// A successfully acquired start lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartLease {
    /// Locked user.
    pub user_id: String,
    /// Token identifying this acquisition.
    pub lease_id: String,
}

/// Acquires and releases per-user start locks.
#[derive(Clone)]
pub struct StartLockManager {
    store: Arc<dyn Persistence>,
}

impl StartLockManager {
    /// Create a manager over the given store.
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        Self { store }
    }

    /// Try to take the user's lock for `ttl`.
    ///
    /// Returns `None` immediately if a live lock is held; never waits.
    pub async fn acquire(&self, user_id: &str, ttl: Duration) -> Result<Option<StartLease>> {
        let now = Utc::now();
        let expires_at = saturating_add(now, ttl);
        let lease_id = Uuid::new_v4().to_string();

        let acquired = self
            .store
            .try_acquire_start_lock(user_id, &lease_id, now, expires_at)
            .await?;

        if !acquired {
            debug!(user_id = %user_id, "Start lock held by another request");
            return Ok(None);
        }

        info!(user_id = %user_id, lease_id = %lease_id, expires_at = %expires_at, "Start lock acquired");
        Ok(Some(StartLease {
            user_id: user_id.to_string(),
            lease_id,
        }))
    }

    /// Release the user's lock. Idempotent.
    pub async fn release(&self, user_id: &str) -> Result<()> {
        self.store.delete_start_lock(user_id).await?;
        debug!(user_id = %user_id, "Start lock released");
        Ok(())
    }

    /// Current lock holder, if any (expired locks included).
    pub async fn holder(&self, user_id: &str) -> Result<Option<StartLockRecord>> {
        self.store.get_start_lock(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqlitePersistence;

    async fn manager() -> StartLockManager {
        let store = SqlitePersistence::in_memory().await.unwrap();
        StartLockManager::new(Arc::new(store))
    }

    #[tokio::test]
    async fn test_second_acquire_fails_while_held() {
        let locks = manager().await;
        let ttl = Duration::from_secs(900);

        let lease = locks.acquire("user-1", ttl).await.unwrap().unwrap();
        assert_eq!(lease.user_id, "user-1");
        assert!(locks.acquire("user-1", ttl).await.unwrap().is_none());

        // Other users are independent.
        assert!(locks.acquire("user-2", ttl).await.unwrap().is_some());

        let holder = locks.holder("user-1").await.unwrap().unwrap();
        assert_eq!(holder.lease_id, lease.lease_id);
    }

    #[tokio::test]
    async fn test_release_then_reacquire() {
        let locks = manager().await;
        let ttl = Duration::from_secs(900);

        let first = locks.acquire("user-1", ttl).await.unwrap().unwrap();
        locks.release("user-1").await.unwrap();
        locks.release("user-1").await.unwrap();
        assert!(locks.holder("user-1").await.unwrap().is_none());

        let second = locks.acquire("user-1", ttl).await.unwrap().unwrap();
        assert_ne!(first.lease_id, second.lease_id);
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let locks = manager().await;

        let first = locks
            .acquire("user-1", Duration::from_millis(0))
            .await
            .unwrap()
            .unwrap();
        let second = locks
            .acquire("user-1", Duration::from_secs(900))
            .await
            .unwrap()
            .unwrap();

        assert_ne!(first.lease_id, second.lease_id);
        assert_eq!(
            locks.holder("user-1").await.unwrap().unwrap().lease_id,
            second.lease_id
        );
    }
}
