// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for provisioner-core.
//!
//! Every instance mutation is a compare-and-set on `(id, version)`. The
//! start lock upsert and the termination claim are single atomic statements.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::{
    Command, Instance, InstanceState, PostProvisionAction, StartLockRecord, TerminationLease,
};

/// How many times a compare-and-set mutation is re-decided before giving up.
pub const MAX_CAS_ATTEMPTS: usize = 8;

/// Raw `instances` row.
#[allow(missing_docs)]
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InstanceRow {
    pub id: String,
    pub user_id: String,
    pub cloud_instance_id: String,
    pub region: String,
    pub plan: String,
    pub snapshot_id: Option<String>,
    pub cloud_init_hash: Option<String>,
    pub state: String,
    pub execution_running: bool,
    pub ipv4: Option<String>,
    pub admin_api_url: Option<String>,
    pub admin_api_key: Option<String>,
    /// JSON text.
    pub execution_config: Option<String>,
    pub command_epoch: i64,
    pub last_command: Option<String>,
    pub last_command_at: Option<DateTime<Utc>>,
    pub post_provision_action: Option<String>,
    pub post_provision_action_epoch: Option<i64>,
    pub scheduled_termination_at: Option<DateTime<Utc>>,
    pub termination_lease_id: Option<String>,
    pub termination_lease_expires_at: Option<DateTime<Utc>>,
    pub termination_locked_at: Option<DateTime<Utc>>,
    pub instance_created_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub phone_home_at: Option<DateTime<Utc>>,
    pub last_start_at: Option<DateTime<Utc>>,
    pub last_stop_at: Option<DateTime<Utc>>,
    pub last_start_error: Option<String>,
    pub version: i64,
}

impl TryFrom<InstanceRow> for Instance {
    type Error = Error;

    fn try_from(row: InstanceRow) -> Result<Self> {
        let state = row
            .state
            .parse::<InstanceState>()
            .map_err(Error::InvalidRecord)?;
        let last_command = row
            .last_command
            .as_deref()
            .map(str::parse::<Command>)
            .transpose()
            .map_err(Error::InvalidRecord)?;
        let post_provision_action = PostProvisionAction::from_columns(
            row.post_provision_action.as_deref(),
            row.post_provision_action_epoch,
        )
        .map_err(Error::InvalidRecord)?;
        let execution_config: Option<serde_json::Value> = row
            .execution_config
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        let termination_lease = match (
            row.termination_lease_id,
            row.termination_lease_expires_at,
            row.termination_locked_at,
        ) {
            (Some(lease_id), Some(expires_at), Some(locked_at)) => Some(TerminationLease {
                lease_id,
                expires_at,
                locked_at,
            }),
            (None, _, _) => None,
            (Some(_), _, _) => {
                return Err(Error::InvalidRecord(format!(
                    "instance '{}' has a partial termination lease",
                    row.id
                )));
            }
        };

        Ok(Instance {
            id: row.id,
            user_id: row.user_id,
            cloud_instance_id: row.cloud_instance_id,
            region: row.region,
            plan: row.plan,
            snapshot_id: row.snapshot_id,
            cloud_init_hash: row.cloud_init_hash,
            state,
            execution_running: row.execution_running,
            ipv4: row.ipv4,
            admin_api_url: row.admin_api_url,
            admin_api_key: row.admin_api_key,
            execution_config,
            command_epoch: row.command_epoch,
            last_command,
            last_command_at: row.last_command_at,
            post_provision_action,
            scheduled_termination_at: row.scheduled_termination_at,
            termination_lease,
            instance_created_at: row.instance_created_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            phone_home_at: row.phone_home_at,
            last_start_at: row.last_start_at,
            last_stop_at: row.last_stop_at,
            last_start_error: row.last_start_error,
            version: row.version,
        })
    }
}

/// Encoded forms of the instance columns that are not plain scalars.
pub(crate) struct EncodedColumns {
    pub state: &'static str,
    pub last_command: Option<&'static str>,
    pub post_provision_action: Option<&'static str>,
    pub post_provision_action_epoch: Option<i64>,
    pub execution_config: Option<String>,
    pub lease_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub lease_locked_at: Option<DateTime<Utc>>,
}

impl EncodedColumns {
    pub(crate) fn encode(instance: &Instance) -> Result<Self> {
        let execution_config = instance
            .execution_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let lease = instance.termination_lease.as_ref();

        Ok(Self {
            state: instance.state.as_str(),
            last_command: instance.last_command.map(|c| c.as_str()),
            post_provision_action: instance.post_provision_action.map(|a| a.as_str()),
            post_provision_action_epoch: instance.post_provision_action.and_then(|a| a.epoch()),
            execution_config,
            lease_id: lease.map(|l| l.lease_id.clone()),
            lease_expires_at: lease.map(|l| l.expires_at),
            lease_locked_at: lease.map(|l| l.locked_at),
        })
    }
}

/// Map a unique violation on insert to the one-active-instance error.
pub(crate) fn map_insert_error(err: sqlx::Error, user_id: &str) -> Error {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => Error::ActiveInstanceExists {
            user_id: user_id.to_string(),
        },
        _ => Error::Database(err),
    }
}

/// Storage used by the lifecycle manager, start lock and scheduler.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Insert a new instance record.
    ///
    /// Fails with [`Error::ActiveInstanceExists`] if the user already owns an
    /// active instance.
    async fn insert_instance(&self, instance: &Instance) -> Result<()>;

    async fn get_instance(&self, id: &str) -> Result<Option<Instance>>;

    /// The user's instance in `PROVISIONING|READY|EXECUTING|IDLE`, if any.
    async fn find_active_instance(&self, user_id: &str) -> Result<Option<Instance>>;

    /// Most recently created instance of the user, in any state.
    async fn latest_instance_for_user(&self, user_id: &str) -> Result<Option<Instance>>;

    /// Most recently created instance with the given cloud id.
    async fn find_by_cloud_instance_id(&self, cloud_instance_id: &str) -> Result<Option<Instance>>;

    /// Write all mutable fields if the stored version still equals
    /// `instance.version`.
    ///
    /// On success bumps `instance.version`, refreshes `updated_at` and returns
    /// `true`. Returns `false` when another writer got there first.
    async fn update_instance(&self, instance: &mut Instance) -> Result<bool>;

    /// Atomically claim one instance due for termination.
    ///
    /// Due means `IDLE`, not running, `scheduled_termination_at <= now` and no
    /// live lease; or `TERMINATING` with an expired lease. The claimed record is
    /// moved to `TERMINATING` under the given lease.
    async fn claim_due_termination(
        &self,
        now: DateTime<Utc>,
        lease_id: &str,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Option<Instance>>;

    /// Insert the user's start lock, or take over an expired one.
    ///
    /// Returns `false` if a live lock is held by someone else.
    async fn try_acquire_start_lock(
        &self,
        user_id: &str,
        lease_id: &str,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn get_start_lock(&self, user_id: &str) -> Result<Option<StartLockRecord>>;

    /// Delete the user's start lock. Idempotent.
    async fn delete_start_lock(&self, user_id: &str) -> Result<()>;

    async fn health_check(&self) -> Result<()>;
}

/// Apply `mutate` to `current` and write it with compare-and-set.
///
/// On a version conflict the record is reloaded and `mutate` runs again on the
/// fresh copy. Returns `Ok(None)` when `mutate` declines (returns `false`), or
/// the written instance.
pub async fn update_instance_with<F>(
    store: &dyn Persistence,
    current: Instance,
    mut mutate: F,
) -> Result<Option<Instance>>
where
    F: FnMut(&mut Instance) -> bool + Send,
{
    let mut current = current;
    for _ in 0..MAX_CAS_ATTEMPTS {
        let mut next = current.clone();
        if !mutate(&mut next) {
            return Ok(None);
        }
        if store.update_instance(&mut next).await? {
            return Ok(Some(next));
        }
        current = store
            .get_instance(&current.id)
            .await?
            .ok_or_else(|| Error::InstanceNotFound(current.id.clone()))?;
    }
    Err(Error::Contention(current.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::provisioning_instance;

    async fn store() -> SqlitePersistence {
        SqlitePersistence::in_memory()
            .await
            .expect("Failed to create in-memory store")
    }

    #[tokio::test]
    async fn test_update_with_retries_on_conflict() {
        let store = store().await;
        let instance = provisioning_instance("user-1", "cloud-1");
        store.insert_instance(&instance).await.unwrap();

        // Another writer bumps the version behind our back.
        let mut other = store.get_instance(&instance.id).await.unwrap().unwrap();
        other.ipv4 = Some("10.0.0.1".to_string());
        assert!(store.update_instance(&mut other).await.unwrap());

        let mut calls = 0;
        let written = update_instance_with(&store, instance.clone(), |i| {
            calls += 1;
            i.state = InstanceState::Ready;
            true
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(calls, 2);
        assert_eq!(written.state, InstanceState::Ready);
        // The concurrent write survived the reload.
        assert_eq!(written.ipv4.as_deref(), Some("10.0.0.1"));
        assert_eq!(written.version, 2);
    }

    #[tokio::test]
    async fn test_update_with_declined_mutation() {
        let store = store().await;
        let instance = provisioning_instance("user-1", "cloud-1");
        store.insert_instance(&instance).await.unwrap();

        let result = update_instance_with(&store, instance.clone(), |_| false)
            .await
            .unwrap();
        assert!(result.is_none());

        let stored = store.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 0);
    }

    #[test]
    fn test_row_with_partial_lease_is_rejected() {
        let now = Utc::now();
        let row = InstanceRow {
            id: "i".to_string(),
            user_id: "u".to_string(),
            cloud_instance_id: "c".to_string(),
            region: "r".to_string(),
            plan: "p".to_string(),
            snapshot_id: None,
            cloud_init_hash: None,
            state: "TERMINATING".to_string(),
            execution_running: false,
            ipv4: None,
            admin_api_url: None,
            admin_api_key: None,
            execution_config: Some(r#"{"job":"x"}"#.to_string()),
            command_epoch: 1,
            last_command: Some("stop".to_string()),
            last_command_at: Some(now),
            post_provision_action: None,
            post_provision_action_epoch: None,
            scheduled_termination_at: None,
            termination_lease_id: Some("lease".to_string()),
            termination_lease_expires_at: None,
            termination_locked_at: None,
            instance_created_at: None,
            created_at: now,
            updated_at: now,
            phone_home_at: None,
            last_start_at: None,
            last_stop_at: None,
            last_start_error: None,
            version: 3,
        };

        assert!(matches!(
            Instance::try_from(row.clone()),
            Err(Error::InvalidRecord(_))
        ));

        let mut row = row;
        row.termination_lease_id = None;
        let instance = Instance::try_from(row).unwrap();
        assert_eq!(instance.state, InstanceState::Terminating);
        assert_eq!(instance.last_command, Some(Command::Stop));
        assert_eq!(instance.execution_config, Some(serde_json::json!({"job": "x"})));
    }
}
