// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence.
//!
//! The termination claim uses `FOR UPDATE SKIP LOCKED` so concurrent
//! schedulers never pick the same row.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::Result;
use crate::model::{Instance, StartLockRecord};

use super::{EncodedColumns, InstanceRow, Persistence, map_insert_error};

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Instance Operations
// ============================================================================

/// Insert a new instance record.
pub async fn insert_instance(pool: &PgPool, instance: &Instance) -> Result<()> {
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
        VALUES (
            $1, $2, $3, $4, $5, $6, $7,
            $8, $9, $10, $11, $12, $13,
            $14, $15, $16,
            $17, $18,
            $19,
            $20, $21, $22,
            $23, $24, $25,
            $26, $27, $28, $29, $30
        )
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
    .execute(pool)
    .await
    .map_err(|e| map_insert_error(e, &instance.user_id))?;

    Ok(())
}

/// Fetch an instance by record id.
pub async fn get_instance(pool: &PgPool, id: &str) -> Result<Option<Instance>> {
    let row = sqlx::query_as::<_, InstanceRow>("SELECT * FROM instances WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.map(Instance::try_from).transpose()
}

/// Fetch the user's active instance.
pub async fn find_active_instance(pool: &PgPool, user_id: &str) -> Result<Option<Instance>> {
    let row = sqlx::query_as::<_, InstanceRow>(
        r#"
        SELECT * FROM instances
        WHERE user_id = $1
          AND state IN ('PROVISIONING', 'READY', 'EXECUTING', 'IDLE')
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    row.map(Instance::try_from).transpose()
}

/// Fetch the user's most recently created instance.
pub async fn latest_instance_for_user(pool: &PgPool, user_id: &str) -> Result<Option<Instance>> {
    let row = sqlx::query_as::<_, InstanceRow>(
        "SELECT * FROM instances WHERE user_id = $1 ORDER BY created_at DESC LIMIT 1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    row.map(Instance::try_from).transpose()
}

/// Fetch the most recently created instance with the given cloud id.
pub async fn find_by_cloud_instance_id(
    pool: &PgPool,
    cloud_instance_id: &str,
) -> Result<Option<Instance>> {
    let row = sqlx::query_as::<_, InstanceRow>(
        "SELECT * FROM instances WHERE cloud_instance_id = $1 ORDER BY created_at DESC LIMIT 1",
    )
    .bind(cloud_instance_id)
    .fetch_optional(pool)
    .await?;

    row.map(Instance::try_from).transpose()
}

/// Compare-and-set write of every mutable column.
pub async fn update_instance(pool: &PgPool, instance: &mut Instance) -> Result<bool> {
    let encoded = EncodedColumns::encode(instance)?;
    let now = Utc::now();

    let result = sqlx::query(
        r#"
        UPDATE instances
        SET state = $1,
            execution_running = $2,
            ipv4 = $3,
            admin_api_url = $4,
            admin_api_key = $5,
            execution_config = $6,
            command_epoch = $7,
            last_command = $8,
            last_command_at = $9,
            post_provision_action = $10,
            post_provision_action_epoch = $11,
            scheduled_termination_at = $12,
            termination_lease_id = $13,
            termination_lease_expires_at = $14,
            termination_locked_at = $15,
            instance_created_at = $16,
            phone_home_at = $17,
            last_start_at = $18,
            last_stop_at = $19,
            last_start_error = $20,
            updated_at = $21,
            version = version + 1
        WHERE id = $22 AND version = $23
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
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(false);
    }

    instance.version += 1;
    instance.updated_at = now;
    Ok(true)
}

/// Claim one instance due for termination.
pub async fn claim_due_termination(
    pool: &PgPool,
    now: DateTime<Utc>,
    lease_id: &str,
    lease_expires_at: DateTime<Utc>,
) -> Result<Option<Instance>> {
    let row = sqlx::query_as::<_, InstanceRow>(
        r#"
        UPDATE instances
        SET state = 'TERMINATING',
            termination_lease_id = $1,
            termination_lease_expires_at = $2,
            termination_locked_at = $3,
            updated_at = $3,
            version = version + 1
        WHERE id = (
            SELECT id FROM instances
            WHERE (
                    state = 'IDLE'
                    AND execution_running = FALSE
                    AND scheduled_termination_at IS NOT NULL
                    AND scheduled_termination_at <= $3
                    AND (termination_lease_expires_at IS NULL OR termination_lease_expires_at <= $3)
                  )
               OR (
                    state = 'TERMINATING'
                    AND (termination_lease_expires_at IS NULL OR termination_lease_expires_at <= $3)
                  )
            ORDER BY scheduled_termination_at ASC NULLS FIRST
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING *
        "#,
    )
    .bind(lease_id)
    .bind(lease_expires_at)
    .bind(now)
    .fetch_optional(pool)
    .await?;

    row.map(Instance::try_from).transpose()
}

// ============================================================================
// Start Lock Operations
// ============================================================================

/// Insert the lock or take over an expired one.
pub async fn try_acquire_start_lock(
    pool: &PgPool,
    user_id: &str,
    lease_id: &str,
    now: DateTime<Utc>,
    lease_expires_at: DateTime<Utc>,
) -> Result<bool> {
    let acquired: Option<String> = sqlx::query_scalar(
        r#"
        INSERT INTO start_locks (user_id, lease_id, lease_expires_at, created_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (user_id) DO UPDATE
        SET lease_id = EXCLUDED.lease_id,
            lease_expires_at = EXCLUDED.lease_expires_at,
            created_at = EXCLUDED.created_at
        WHERE start_locks.lease_expires_at <= EXCLUDED.created_at
        RETURNING lease_id
        "#,
    )
    .bind(user_id)
    .bind(lease_id)
    .bind(lease_expires_at)
    .bind(now)
    .fetch_optional(pool)
    .await?;

    Ok(acquired.is_some())
}

/// Read a user's start lock.
pub async fn get_start_lock(pool: &PgPool, user_id: &str) -> Result<Option<StartLockRecord>> {
    let row: Option<(String, String, DateTime<Utc>)> = sqlx::query_as(
        "SELECT user_id, lease_id, lease_expires_at FROM start_locks WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(user_id, lease_id, lease_expires_at)| StartLockRecord {
        user_id,
        lease_id,
        lease_expires_at,
    }))
}

/// Delete a user's start lock.
pub async fn delete_start_lock(pool: &PgPool, user_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM start_locks WHERE user_id = $1")
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ============================================================================
// Persistence trait implementation
// ============================================================================

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    async fn insert_instance(&self, instance: &Instance) -> Result<()> {
        insert_instance(&self.pool, instance).await
    }

    async fn get_instance(&self, id: &str) -> Result<Option<Instance>> {
        get_instance(&self.pool, id).await
    }

    async fn find_active_instance(&self, user_id: &str) -> Result<Option<Instance>> {
        find_active_instance(&self.pool, user_id).await
    }

    async fn latest_instance_for_user(&self, user_id: &str) -> Result<Option<Instance>> {
        latest_instance_for_user(&self.pool, user_id).await
    }

    async fn find_by_cloud_instance_id(&self, cloud_instance_id: &str) -> Result<Option<Instance>> {
        find_by_cloud_instance_id(&self.pool, cloud_instance_id).await
    }

    async fn update_instance(&self, instance: &mut Instance) -> Result<bool> {
        update_instance(&self.pool, instance).await
    }

    async fn claim_due_termination(
        &self,
        now: DateTime<Utc>,
        lease_id: &str,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Option<Instance>> {
        claim_due_termination(&self.pool, now, lease_id, lease_expires_at).await
    }

    async fn try_acquire_start_lock(
        &self,
        user_id: &str,
        lease_id: &str,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        try_acquire_start_lock(&self.pool, user_id, lease_id, now, lease_expires_at).await
    }

    async fn get_start_lock(&self, user_id: &str) -> Result<Option<StartLockRecord>> {
        get_start_lock(&self.pool, user_id).await
    }

    async fn delete_start_lock(&self, user_id: &str) -> Result<()> {
        delete_start_lock(&self.pool, user_id).await
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
