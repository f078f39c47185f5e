// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::Result;
use crate::migrations::SQLITE as MIGRATOR;
use crate::model::{Instance, StartLockRecord};

use super::{EncodedColumns, InstanceRow, Persistence, map_insert_error};

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a SQLite database at `path`.
    ///
    /// Parent directories and the database file are created if missing, and
    /// all migrations are applied.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        MIGRATOR.run(&pool).await.map_err(sqlx::Error::from)?;

        Ok(Self { pool })
    }

    /// Create a migrated in-memory database.
    ///
    /// A single connection that never expires, so the database lives as long
    /// as the pool.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        MIGRATOR.run(&pool).await.map_err(sqlx::Error::from)?;

        Ok(Self { pool })
    }

    /// Underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn insert_instance(&self, instance: &Instance) -> Result<()> {
        let encoded = EncodedColumns::encode(instance)?;

        sqlx::query(
            r#"
            INSERT INTO instances (
                id, user_id, cloud_instance_id, region, plan, snapshot_id, cloud_init_hash,
                state, execution_running, ipv4, admin_api_url, admin_api_key, execution_config,
                command_epoch, last_command, last_command_at,
                post_provision_action, post_provision_action_epoch,
                scheduled_termination_at,
                termination_lease_id, termination_lease_expires_at, termination_locked_at,
                instance_created_at, created_at, updated_at,
                phone_home_at, last_start_at, last_stop_at, last_start_error, version
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&instance.id)
        .bind(&instance.user_id)
        .bind(&instance.cloud_instance_id)
        .bind(&instance.region)
        .bind(&instance.plan)
        .bind(&instance.snapshot_id)
        .bind(&instance.cloud_init_hash)
        .bind(encoded.state)
        .bind(instance.execution_running)
        .bind(&instance.ipv4)
        .bind(&instance.admin_api_url)
        .bind(&instance.admin_api_key)
        .bind(&encoded.execution_config)
        .bind(instance.command_epoch)
        .bind(encoded.last_command)
        .bind(instance.last_command_at)
        .bind(encoded.post_provision_action)
        .bind(encoded.post_provision_action_epoch)
        .bind(instance.scheduled_termination_at)
        .bind(&encoded.lease_id)
        .bind(encoded.lease_expires_at)
        .bind(encoded.lease_locked_at)
        .bind(instance.instance_created_at)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .bind(instance.phone_home_at)
        .bind(instance.last_start_at)
        .bind(instance.last_stop_at)
        .bind(&instance.last_start_error)
        .bind(instance.version)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, &instance.user_id))?;

        Ok(())
    }

    async fn get_instance(&self, id: &str) -> Result<Option<Instance>> {
        let row = sqlx::query_as::<_, InstanceRow>("SELECT * FROM instances WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Instance::try_from).transpose()
    }

    async fn find_active_instance(&self, user_id: &str) -> Result<Option<Instance>> {
        let row = sqlx::query_as::<_, InstanceRow>(
            r#"
            SELECT * FROM instances
            WHERE user_id = ?
              AND state IN ('PROVISIONING', 'READY', 'EXECUTING', 'IDLE')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Instance::try_from).transpose()
    }

    async fn latest_instance_for_user(&self, user_id: &str) -> Result<Option<Instance>> {
        let row = sqlx::query_as::<_, InstanceRow>(
            "SELECT * FROM instances WHERE user_id = ? ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Instance::try_from).transpose()
    }

    async fn find_by_cloud_instance_id(&self, cloud_instance_id: &str) -> Result<Option<Instance>> {
        let row = sqlx::query_as::<_, InstanceRow>(
            "SELECT * FROM instances WHERE cloud_instance_id = ? ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )
        .bind(cloud_instance_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Instance::try_from).transpose()
    }

    async fn update_instance(&self, instance: &mut Instance) -> Result<bool> {
        let encoded = EncodedColumns::encode(instance)?;
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE instances
            SET state = ?,
                execution_running = ?,
                ipv4 = ?,
                admin_api_url = ?,
                admin_api_key = ?,
                execution_config = ?,
                command_epoch = ?,
                last_command = ?,
                last_command_at = ?,
                post_provision_action = ?,
                post_provision_action_epoch = ?,
                scheduled_termination_at = ?,
                termination_lease_id = ?,
                termination_lease_expires_at = ?,
                termination_locked_at = ?,
                instance_created_at = ?,
                phone_home_at = ?,
                last_start_at = ?,
                last_stop_at = ?,
                last_start_error = ?,
                updated_at = ?,
                version = version + 1
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(encoded.state)
        .bind(instance.execution_running)
        .bind(&instance.ipv4)
        .bind(&instance.admin_api_url)
        .bind(&instance.admin_api_key)
        .bind(&encoded.execution_config)
        .bind(instance.command_epoch)
        .bind(encoded.last_command)
        .bind(instance.last_command_at)
        .bind(encoded.post_provision_action)
        .bind(encoded.post_provision_action_epoch)
        .bind(instance.scheduled_termination_at)
        .bind(&encoded.lease_id)
        .bind(encoded.lease_expires_at)
        .bind(encoded.lease_locked_at)
        .bind(instance.instance_created_at)
        .bind(instance.phone_home_at)
        .bind(instance.last_start_at)
        .bind(instance.last_stop_at)
        .bind(&instance.last_start_error)
        .bind(now)
        .bind(&instance.id)
        .bind(instance.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        instance.version += 1;
        instance.updated_at = now;
        Ok(true)
    }

    async fn claim_due_termination(
        &self,
        now: DateTime<Utc>,
        lease_id: &str,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Option<Instance>> {
        // A single UPDATE holds SQLite's write lock, so selection and claim are atomic.
        let row = sqlx::query_as::<_, InstanceRow>(
            r#"
            UPDATE instances
            SET state = 'TERMINATING',
                termination_lease_id = ?1,
                termination_lease_expires_at = ?2,
                termination_locked_at = ?3,
                updated_at = ?3,
                version = version + 1
            WHERE id = (
                SELECT id FROM instances
                WHERE (
                        state = 'IDLE'
                        AND execution_running = 0
                        AND scheduled_termination_at IS NOT NULL
                        AND scheduled_termination_at <= ?3
                        AND (termination_lease_expires_at IS NULL OR termination_lease_expires_at <= ?3)
                      )
                   OR (
                        state = 'TERMINATING'
                        AND (termination_lease_expires_at IS NULL OR termination_lease_expires_at <= ?3)
                      )
                ORDER BY scheduled_termination_at ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(lease_id)
        .bind(lease_expires_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Instance::try_from).transpose()
    }

    async fn try_acquire_start_lock(
        &self,
        user_id: &str,
        lease_id: &str,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let acquired: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO start_locks (user_id, lease_id, lease_expires_at, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (user_id) DO UPDATE
            SET lease_id = excluded.lease_id,
                lease_expires_at = excluded.lease_expires_at,
                created_at = excluded.created_at
            WHERE start_locks.lease_expires_at <= excluded.created_at
            RETURNING lease_id
            "#,
        )
        .bind(user_id)
        .bind(lease_id)
        .bind(lease_expires_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(acquired.is_some())
    }

    async fn get_start_lock(&self, user_id: &str) -> Result<Option<StartLockRecord>> {
        let row: Option<(String, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT user_id, lease_id, lease_expires_at FROM start_locks WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(user_id, lease_id, lease_expires_at)| StartLockRecord {
            user_id,
            lease_id,
            lease_expires_at,
        }))
    }

    async fn delete_start_lock(&self, user_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM start_locks WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::model::InstanceState;
    use crate::model::fixtures::provisioning_instance;
    use chrono::TimeDelta;

    async fn store() -> SqlitePersistence {
        SqlitePersistence::in_memory()
            .await
            .expect("Failed to create in-memory SQLite store")
    }

    async fn insert_idle(
        store: &SqlitePersistence,
        user_id: &str,
        scheduled: DateTime<Utc>,
    ) -> Instance {
        let mut instance = provisioning_instance(user_id, &format!("cloud-{}", user_id));
        instance.state = InstanceState::Idle;
        instance.scheduled_termination_at = Some(scheduled);
        store.insert_instance(&instance).await.unwrap();
        instance
    }

    #[tokio::test]
    async fn test_insert_and_get_instance() {
        let store = store().await;
        let mut instance = provisioning_instance("user-1", "cloud-1");
        instance.execution_config = Some(serde_json::json!({"script": "run.sh", "args": [1, 2]}));

        store.insert_instance(&instance).await.unwrap();

        let loaded = store.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(loaded, instance);

        let active = store.find_active_instance("user-1").await.unwrap().unwrap();
        assert_eq!(active.id, instance.id);

        let by_cloud = store.find_by_cloud_instance_id("cloud-1").await.unwrap().unwrap();
        assert_eq!(by_cloud.id, instance.id);

        assert!(store.get_instance("missing").await.unwrap().is_none());
        assert!(store.find_active_instance("user-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_active_instance_is_rejected() {
        let store = store().await;
        store
            .insert_instance(&provisioning_instance("user-1", "cloud-1"))
            .await
            .unwrap();

        let err = store
            .insert_instance(&provisioning_instance("user-1", "cloud-2"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ActiveInstanceExists { ref user_id } if user_id == "user-1"));
    }

    #[tokio::test]
    async fn test_terminated_instance_frees_the_active_slot() {
        let store = store().await;
        let mut first = provisioning_instance("user-1", "cloud-1");
        store.insert_instance(&first).await.unwrap();

        first.mark_terminated();
        assert!(store.update_instance(&mut first).await.unwrap());

        let mut second = provisioning_instance("user-1", "cloud-2");
        second.created_at = first.created_at + TimeDelta::seconds(1);
        store.insert_instance(&second).await.unwrap();

        let latest = store.latest_instance_for_user("user-1").await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);
    }

    #[tokio::test]
    async fn test_update_is_compare_and_set() {
        let store = store().await;
        let instance = provisioning_instance("user-1", "cloud-1");
        store.insert_instance(&instance).await.unwrap();

        let mut a = instance.clone();
        let mut b = instance.clone();

        a.state = InstanceState::Ready;
        assert!(store.update_instance(&mut a).await.unwrap());
        assert_eq!(a.version, 1);

        b.state = InstanceState::Error;
        assert!(!store.update_instance(&mut b).await.unwrap());
        assert_eq!(b.version, 0);

        let loaded = store.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, InstanceState::Ready);
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn test_claim_due_termination_once() {
        let store = store().await;
        let now = Utc::now();
        let due = insert_idle(&store, "user-1", now - TimeDelta::seconds(5)).await;
        insert_idle(&store, "user-2", now + TimeDelta::minutes(10)).await;

        let expires = now + TimeDelta::seconds(120);
        let claimed = store
            .claim_due_termination(now, "lease-a", expires)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, due.id);
        assert_eq!(claimed.state, InstanceState::Terminating);
        let lease = claimed.termination_lease.unwrap();
        assert_eq!(lease.lease_id, "lease-a");
        assert_eq!(lease.expires_at, expires);

        // Already claimed, and the other one is not due yet.
        assert!(
            store
                .claim_due_termination(now, "lease-b", expires)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_claim_skips_running_instances() {
        let store = store().await;
        let now = Utc::now();
        let mut instance = insert_idle(&store, "user-1", now - TimeDelta::seconds(5)).await;
        instance.execution_running = true;
        assert!(store.update_instance(&mut instance).await.unwrap());

        assert!(
            store
                .claim_due_termination(now, "lease-a", now + TimeDelta::seconds(120))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_claim_reclaims_expired_terminating_lease() {
        let store = store().await;
        let now = Utc::now();
        insert_idle(&store, "user-1", now - TimeDelta::minutes(10)).await;

        let first_expiry = now + TimeDelta::seconds(120);
        store
            .claim_due_termination(now, "lease-a", first_expiry)
            .await
            .unwrap()
            .unwrap();

        // Lease still live.
        let later = now + TimeDelta::seconds(60);
        assert!(
            store
                .claim_due_termination(later, "lease-b", later + TimeDelta::seconds(120))
                .await
                .unwrap()
                .is_none()
        );

        // Holder crashed; lease expired.
        let much_later = now + TimeDelta::seconds(180);
        let reclaimed = store
            .claim_due_termination(much_later, "lease-c", much_later + TimeDelta::seconds(120))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.termination_lease.unwrap().lease_id, "lease-c");
    }

    #[tokio::test]
    async fn test_start_lock_upsert() {
        let store = store().await;
        let now = Utc::now();
        let ttl = TimeDelta::minutes(15);

        assert!(
            store
                .try_acquire_start_lock("user-1", "lease-a", now, now + ttl)
                .await
                .unwrap()
        );
        assert!(
            !store
                .try_acquire_start_lock("user-1", "lease-b", now, now + ttl)
                .await
                .unwrap()
        );
        assert_eq!(
            store.get_start_lock("user-1").await.unwrap().unwrap().lease_id,
            "lease-a"
        );

        // Expired lock can be taken over.
        let later = now + ttl + TimeDelta::seconds(1);
        assert!(
            store
                .try_acquire_start_lock("user-1", "lease-c", later, later + ttl)
                .await
                .unwrap()
        );
        assert_eq!(
            store.get_start_lock("user-1").await.unwrap().unwrap().lease_id,
            "lease-c"
        );

        store.delete_start_lock("user-1").await.unwrap();
        store.delete_start_lock("user-1").await.unwrap();
        assert!(store.get_start_lock("user-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_from_path_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("provisioner.db");

        let store = SqlitePersistence::from_path(&path).await.unwrap();
        store.health_check().await.unwrap();
        assert!(path.exists());
    }
}
