// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance lifecycle manager.
//!
//! Handles the user commands (start, stop, status), the phone-home callback
//! sent by a freshly booted instance, and the execution config lookup used by
//! the admin process.
//!
//! # Concurrency
//!
//! Every record write is a compare-and-set on the record version, re-decided
//! on the fresh record after a conflict. Decisions taken after a remote call
//! (admin start, admin stop) are additionally fenced on the command epoch seen
//! before the call: if a newer start or stop was accepted meanwhile, the stale
//! decision is dropped.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::admin::{AdminClient, ExecutionState};
use crate::billing::{BillingPolicy, TerminationTarget};
use crate::bootstrap::build_bootstrap;
use crate::cloud::{CloudInstance, CloudProvider, CreateInstanceSpec, is_usable_ipv4};
use crate::error::{Error, Result};
use crate::model::{Command, Instance, InstanceState, PostProvisionAction};
use crate::persistence::{MAX_CAS_ATTEMPTS, Persistence, update_instance_with};
use crate::start_lock::StartLockManager;
use crate::termination::{Terminator, begin_termination};

/// Lifecycle settings.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Region used when a start request names none.
    pub default_region: String,
    /// Plan used when a start request names none.
    pub default_plan: String,
    /// Snapshot used when a start request names none.
    pub default_snapshot_id: Option<String>,
    /// Public URL of this service, embedded in the bootstrap payload.
    pub control_api_url: String,
    /// Start lock TTL; bounds how long a crashed provisioning blocks the user.
    pub start_lock_ttl: Duration,
    /// Termination lease TTL for stop and phone-home terminations.
    pub termination_lease_ttl: Duration,
    /// Billing period and destroy buffer.
    pub billing: BillingPolicy,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            default_region: "us-east-1".to_string(),
            default_plan: "small-1cpu-1gb".to_string(),
            default_snapshot_id: None,
            control_api_url: "http://localhost:3000".to_string(),
            start_lock_ttl: Duration::from_secs(15 * 60),
            termination_lease_ttl: Duration::from_secs(120),
            billing: BillingPolicy::default(),
        }
    }
}

/// A start command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartRequest {
    /// Requesting user.
    pub user_id: String,
    /// Opaque configuration forwarded to the admin process.
    pub execution_config: Option<Value>,
    /// Region override.
    pub region: Option<String>,
    /// Plan override.
    pub plan: Option<String>,
    /// Snapshot override.
    pub snapshot_id: Option<String>,
}

/// Result of a start command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum StartOutcome {
    /// The user's active instance was reused.
    Reused {
        /// Record id.
        instance_id: String,
        /// State after the command.
        state: InstanceState,
    },
    /// A new cloud instance is being provisioned.
    Provisioning {
        /// Record id.
        instance_id: String,
        /// Provider instance id.
        cloud_instance_id: String,
    },
    /// Another start for this user holds the start lock.
    AlreadyStarting,
}

/// Result of the phone-home callback.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum PhoneHomeOutcome {
    /// No provisioning instance with that cloud id; nothing to do.
    Ignored,
    /// The provider reported no usable IPv4; the instance is in `ERROR`.
    NoIpv4 {
        /// Record id.
        instance_id: String,
    },
    /// A queued stop scheduled termination at the next billing boundary.
    Scheduled {
        /// Record id.
        instance_id: String,
        /// When the scheduler will terminate the instance.
        scheduled_termination_at: DateTime<Utc>,
        /// Billing boundary the termination precedes.
        billing_boundary: DateTime<Utc>,
    },
    /// A queued stop terminated the instance right away.
    Terminated {
        /// Record id.
        instance_id: String,
    },
    /// The instance is ready but no execution is running.
    Ready {
        /// Record id.
        instance_id: String,
        /// Instance address.
        ipv4: String,
        /// Why the execution could not be started, if it was attempted.
        error: Option<String>,
    },
    /// The execution was started.
    Executing {
        /// Record id.
        instance_id: String,
        /// Instance address.
        ipv4: String,
        /// What the admin process reported.
        execution: ExecutionState,
    },
}

/// Result of a stop command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum StopOutcome {
    /// The instance is still provisioning; termination is queued for phone-home.
    QueuedAfterProvision {
        /// Record id.
        instance_id: String,
        /// Epoch of this stop.
        epoch: i64,
    },
    /// The user has no active instance.
    NotFound,
    /// Termination scheduled at the next billing boundary.
    Scheduled {
        /// Record id.
        instance_id: String,
        /// When the scheduler will terminate the instance.
        scheduled_termination_at: DateTime<Utc>,
        /// Billing boundary the termination precedes.
        billing_boundary: DateTime<Utc>,
        /// Epoch of this stop.
        epoch: i64,
    },
    /// The instance was terminated right away.
    Terminated {
        /// Record id.
        instance_id: String,
        /// Epoch of this stop.
        epoch: i64,
    },
    /// A newer command was accepted while this stop was in flight.
    Superseded {
        /// Record id.
        instance_id: String,
    },
}

/// Status of a user's most recent instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    /// Whether the user ever had an instance.
    pub exists: bool,
    /// Record id.
    pub instance_id: Option<String>,
    /// Lifecycle state.
    pub state: Option<InstanceState>,
    /// Whether an execution is running.
    pub execution_running: bool,
    /// Instance address.
    pub ipv4: Option<String>,
    /// Pending termination time.
    pub scheduled_termination_at: Option<DateTime<Utc>>,
}

impl StatusView {
    fn missing() -> Self {
        Self {
            exists: false,
            instance_id: None,
            state: None,
            execution_running: false,
            ipv4: None,
            scheduled_termination_at: None,
        }
    }
}

impl From<&Instance> for StatusView {
    fn from(instance: &Instance) -> Self {
        Self {
            exists: true,
            instance_id: Some(instance.id.clone()),
            state: Some(instance.state),
            execution_running: instance.execution_running,
            ipv4: instance.ipv4.clone(),
            scheduled_termination_at: instance.scheduled_termination_at,
        }
    }
}

/// What phone-home decided for the instance.
enum BootDecision {
    NoIpv4,
    Schedule(TerminationTarget),
    Terminate,
    Ready,
}

/// Orchestrates instance lifecycle commands.
#[derive(Clone)]
pub struct InstanceManager {
    store: Arc<dyn Persistence>,
    cloud: Arc<dyn CloudProvider>,
    admin: AdminClient,
    locks: StartLockManager,
    terminator: Terminator,
    config: LifecycleConfig,
}

impl InstanceManager {
    /// Create a manager.
    pub fn new(
        store: Arc<dyn Persistence>,
        cloud: Arc<dyn CloudProvider>,
        admin: AdminClient,
        config: LifecycleConfig,
    ) -> Self {
        let locks = StartLockManager::new(store.clone());
        let terminator = Terminator::new(store.clone(), cloud.clone());
        Self {
            store,
            cloud,
            admin,
            locks,
            terminator,
            config,
        }
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<dyn Persistence> {
        &self.store
    }

    /// Start lock manager.
    pub fn locks(&self) -> &StartLockManager {
        &self.locks
    }

    /// Shared terminator.
    pub fn terminator(&self) -> &Terminator {
        &self.terminator
    }

    /// Lifecycle settings.
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    // ========================================================================
    // start
    // ========================================================================

    /// Start (or restart) the user's execution.
    ///
    /// Reuses the user's active instance when there is one; otherwise takes the
    /// start lock and provisions a new cloud instance.
    pub async fn start(&self, request: StartRequest) -> Result<StartOutcome> {
        let user_id = request.user_id.as_str();

        for _ in 0..MAX_CAS_ATTEMPTS {
            if let Some(active) = self.store.find_active_instance(user_id).await? {
                match self.reuse(active, &request).await? {
                    Some(outcome) => return Ok(outcome),
                    // Left the active set under us; look again.
                    None => continue,
                }
            }

            let Some(_lease) = self.locks.acquire(user_id, self.config.start_lock_ttl).await? else {
                info!(user_id = %user_id, "Start already in progress");
                return Ok(StartOutcome::AlreadyStarting);
            };

            // A previous holder may have created the instance and released the lock
            // between our lookup and acquisition.
            if self.store.find_active_instance(user_id).await?.is_some() {
                self.release_lock(user_id).await;
                continue;
            }

            return match self.provision(&request).await {
                Ok(instance) => Ok(StartOutcome::Provisioning {
                    instance_id: instance.id,
                    cloud_instance_id: instance.cloud_instance_id,
                }),
                Err(e) => {
                    self.release_lock(user_id).await;
                    Err(e)
                }
            };
        }

        Err(Error::Contention(format!("user {}", user_id)))
    }

    /// Apply a start to an active instance. `None` if it is no longer active.
    async fn reuse(&self, active: Instance, request: &StartRequest) -> Result<Option<StartOutcome>> {
        let now = Utc::now();
        let mut epoch = 0;

        let written = update_instance_with(self.store.as_ref(), active, |i| {
            if !i.state.is_active() {
                return false;
            }
            // READY/IDLE without a config starts nothing, so a pending
            // termination stays in force.
            let starts_nothing = request.execution_config.is_none()
                && matches!(i.state, InstanceState::Ready | InstanceState::Idle);
            if !starts_nothing {
                i.scheduled_termination_at = None;
            }
            i.execution_config = request.execution_config.clone();
            i.last_start_at = Some(now);
            epoch = i.accept_command(Command::Start, now);
            if i.state == InstanceState::Provisioning {
                i.post_provision_action = Some(PostProvisionAction::Restarted);
            }
            true
        })
        .await?;

        let Some(instance) = written else {
            return Ok(None);
        };

        info!(
            instance_id = %instance.id,
            user_id = %instance.user_id,
            state = %instance.state,
            epoch,
            "Start reusing active instance"
        );

        let state = match (instance.state, &instance.execution_config) {
            (InstanceState::Ready | InstanceState::Idle, Some(config)) => {
                self.start_on_reused(&instance, config, epoch).await?
            }
            (state, _) => state,
        };

        Ok(Some(StartOutcome::Reused {
            instance_id: instance.id,
            state,
        }))
    }

    /// Single admin start for a reused READY/IDLE instance.
    async fn start_on_reused(&self, instance: &Instance, config: &Value, epoch: i64) -> Result<InstanceState> {
        let target = match self.admin.target_for(instance) {
            Ok(target) => target,
            Err(e) => {
                warn!(instance_id = %instance.id, error = %e, "Cannot reach admin process");
                return Ok(instance.state);
            }
        };

        match self.admin.start_execution_once(&target, config).await {
            Ok(execution) => {
                let written = update_instance_with(self.store.as_ref(), instance.clone(), |i| {
                    if i.command_epoch != epoch
                        || !matches!(i.state, InstanceState::Ready | InstanceState::Idle)
                    {
                        return false;
                    }
                    i.state = InstanceState::Executing;
                    i.execution_running = true;
                    i.last_start_error = None;
                    true
                })
                .await?;

                match written {
                    Some(updated) => {
                        info!(instance_id = %updated.id, execution = ?execution, "Execution started on reused instance");
                        Ok(updated.state)
                    }
                    None => {
                        info!(instance_id = %instance.id, epoch, "Start superseded by a newer command");
                        Ok(instance.state)
                    }
                }
            }
            Err(e) => {
                warn!(instance_id = %instance.id, error = %e, "Execution start on reused instance failed");
                let message = e.to_string();
                update_instance_with(self.store.as_ref(), instance.clone(), |i| {
                    if i.command_epoch != epoch {
                        return false;
                    }
                    i.last_start_error = Some(message.clone());
                    true
                })
                .await?;
                Ok(instance.state)
            }
        }
    }

    /// Create the cloud instance and its `PROVISIONING` record.
    async fn provision(&self, request: &StartRequest) -> Result<Instance> {
        let region = non_empty(&request.region).unwrap_or_else(|| self.config.default_region.clone());
        let plan = non_empty(&request.plan).unwrap_or_else(|| self.config.default_plan.clone());
        let snapshot_id = non_empty(&request.snapshot_id).or_else(|| self.config.default_snapshot_id.clone());

        let admin_api_key = self.admin.config().api_key.clone();
        let bootstrap = build_bootstrap(&admin_api_key, &self.config.control_api_url);

        let spec = CreateInstanceSpec {
            region: region.clone(),
            plan: plan.clone(),
            enable_ipv6: true,
            user_data: bootstrap.user_data,
            label: format!("user-{}", request.user_id),
            snapshot_id: snapshot_id.clone(),
        };
        let created = self.cloud.create_instance(&spec).await?;

        let now = Utc::now();
        let instance = Instance {
            id: Uuid::new_v4().to_string(),
            user_id: request.user_id.clone(),
            cloud_instance_id: created.id.clone(),
            region,
            plan,
            snapshot_id,
            cloud_init_hash: Some(bootstrap.hash),
            state: InstanceState::Provisioning,
            execution_running: false,
            ipv4: None,
            admin_api_url: None,
            admin_api_key: Some(admin_api_key),
            execution_config: request.execution_config.clone(),
            command_epoch: 1,
            last_command: Some(Command::Start),
            last_command_at: Some(now),
            post_provision_action: None,
            scheduled_termination_at: None,
            termination_lease: None,
            instance_created_at: created.created_at(),
            created_at: now,
            updated_at: now,
            phone_home_at: None,
            last_start_at: Some(now),
            last_stop_at: None,
            last_start_error: None,
            version: 0,
        };

        if let Err(e) = self.store.insert_instance(&instance).await {
            warn!(
                user_id = %instance.user_id,
                cloud_instance_id = %created.id,
                error = %e,
                "Failed to record new instance; deleting cloud instance"
            );
            if let Err(delete_error) = self.cloud.delete_instance(&created.id).await
                && !delete_error.is_not_found()
            {
                warn!(cloud_instance_id = %created.id, error = %delete_error, "Orphaned cloud instance");
            }
            return Err(e);
        }

        info!(
            instance_id = %instance.id,
            user_id = %instance.user_id,
            cloud_instance_id = %instance.cloud_instance_id,
            region = %instance.region,
            plan = %instance.plan,
            "Provisioning new instance"
        );
        Ok(instance)
    }

    // ========================================================================
    // phone-home
    // ========================================================================

    /// Handle the boot-complete callback of a provisioning instance.
    ///
    /// The user's start lock is released whatever happens once the instance
    /// has been located.
    pub async fn phone_home_done(&self, cloud_instance_id: &str) -> Result<PhoneHomeOutcome> {
        let found = self
            .store
            .find_by_cloud_instance_id(cloud_instance_id)
            .await?
            .filter(|i| i.state == InstanceState::Provisioning);

        let Some(instance) = found else {
            debug!(cloud_instance_id = %cloud_instance_id, "Phone-home for unknown or handled instance");
            return Ok(PhoneHomeOutcome::Ignored);
        };

        let user_id = instance.user_id.clone();
        let result = self.complete_provisioning(instance).await;
        self.release_lock(&user_id).await;
        result
    }

    async fn complete_provisioning(&self, instance: Instance) -> Result<PhoneHomeOutcome> {
        let cloud_instance_id = instance.cloud_instance_id.clone();
        let metadata = self.cloud.get_instance(&cloud_instance_id).await?;
        let ipv4 = self.resolve_ipv4(&metadata).await?;
        let admin_api_url = ipv4.as_deref().map(|ip| self.admin.base_url_for(ip));
        let reported_created_at = metadata.created_at();
        let now = Utc::now();
        let billing = self.config.billing;
        let lease_ttl = self.config.termination_lease_ttl;

        let mut decision = BootDecision::Ready;
        let written = update_instance_with(self.store.as_ref(), instance, |i| {
            if i.state != InstanceState::Provisioning {
                return false;
            }
            i.ipv4 = ipv4.clone();
            i.admin_api_url = admin_api_url.clone();
            i.phone_home_at = Some(now);
            if reported_created_at.is_some() {
                i.instance_created_at = reported_created_at;
            }

            if i.ipv4.is_none() {
                i.state = InstanceState::Error;
                i.last_start_error = Some("No IPv4 from cloud provider on phone-home".to_string());
                decision = BootDecision::NoIpv4;
                return true;
            }

            let terminate_queued = i.has_current_deferred_terminate();
            i.post_provision_action = None;

            if terminate_queued {
                let target = billing.compute_termination_target(i.billing_anchor(), now);
                if target.immediate {
                    begin_termination(i, lease_ttl, now);
                    decision = BootDecision::Terminate;
                } else {
                    i.state = InstanceState::Idle;
                    i.execution_running = false;
                    i.scheduled_termination_at = Some(target.termination_at);
                    decision = BootDecision::Schedule(target);
                }
            } else {
                i.state = InstanceState::Ready;
                decision = BootDecision::Ready;
            }
            true
        })
        .await?;

        let Some(instance) = written else {
            return Ok(PhoneHomeOutcome::Ignored);
        };

        match decision {
            BootDecision::NoIpv4 => {
                warn!(instance_id = %instance.id, cloud_instance_id = %cloud_instance_id, "No IPv4 on phone-home");
                Ok(PhoneHomeOutcome::NoIpv4 {
                    instance_id: instance.id,
                })
            }
            BootDecision::Schedule(target) => {
                info!(
                    instance_id = %instance.id,
                    scheduled_termination_at = %target.termination_at,
                    "Queued stop scheduled termination after provisioning"
                );
                Ok(PhoneHomeOutcome::Scheduled {
                    instance_id: instance.id,
                    scheduled_termination_at: target.termination_at,
                    billing_boundary: target.boundary,
                })
            }
            BootDecision::Terminate => {
                info!(instance_id = %instance.id, "Queued stop terminating instance after provisioning");
                let terminated = self.terminator.terminate(instance).await?;
                Ok(PhoneHomeOutcome::Terminated {
                    instance_id: terminated.id,
                })
            }
            BootDecision::Ready => self.start_after_boot(instance).await,
        }
    }

    /// Main IP if usable, otherwise the first usable listed address.
    async fn resolve_ipv4(&self, metadata: &CloudInstance) -> Result<Option<String>> {
        if let Some(ip) = metadata.usable_main_ip() {
            return Ok(Some(ip.to_string()));
        }
        let listed = self.cloud.list_ipv4(&metadata.id).await?;
        Ok(listed
            .into_iter()
            .map(|address| address.ip)
            .find(|ip| is_usable_ipv4(ip)))
    }

    async fn start_after_boot(&self, instance: Instance) -> Result<PhoneHomeOutcome> {
        let ipv4 = instance.ipv4.clone().unwrap_or_default();
        info!(instance_id = %instance.id, ipv4 = %ipv4, "Instance ready");

        let Some(config) = instance.execution_config.clone() else {
            return Ok(PhoneHomeOutcome::Ready {
                instance_id: instance.id,
                ipv4,
                error: None,
            });
        };

        let epoch = instance.command_epoch;
        let target = self.admin.target_for(&instance)?;

        match self.admin.start_execution_with_retry(&target, &config).await {
            Ok(execution) => {
                let now = Utc::now();
                let written = update_instance_with(self.store.as_ref(), instance.clone(), |i| {
                    if i.command_epoch != epoch || i.state != InstanceState::Ready {
                        return false;
                    }
                    i.state = InstanceState::Executing;
                    i.execution_running = true;
                    i.last_start_error = None;
                    i.last_start_at = Some(now);
                    true
                })
                .await?;

                if written.is_none() {
                    info!(instance_id = %instance.id, epoch, "Boot-time start superseded by a newer command");
                    return Ok(PhoneHomeOutcome::Ready {
                        instance_id: instance.id,
                        ipv4,
                        error: None,
                    });
                }
                info!(instance_id = %instance.id, execution = ?execution, "Execution started after boot");
                Ok(PhoneHomeOutcome::Executing {
                    instance_id: instance.id,
                    ipv4,
                    execution,
                })
            }
            Err(e) => {
                let message = e.to_string();
                warn!(instance_id = %instance.id, error = %message, "Execution start after boot failed");
                update_instance_with(self.store.as_ref(), instance.clone(), |i| {
                    if i.command_epoch != epoch || i.state != InstanceState::Ready {
                        return false;
                    }
                    i.execution_running = false;
                    i.last_start_error = Some(message.clone());
                    true
                })
                .await?;
                Ok(PhoneHomeOutcome::Ready {
                    instance_id: instance.id,
                    ipv4,
                    error: Some(message),
                })
            }
        }
    }

    // ========================================================================
    // stop
    // ========================================================================

    /// Stop the user's execution and schedule termination.
    ///
    /// A provisioning instance only gets the termination queued; otherwise the
    /// execution is stopped (best effort) and the instance is terminated at
    /// the last moment before its next billing boundary.
    pub async fn stop(&self, user_id: &str) -> Result<StopOutcome> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(active) = self.store.find_active_instance(user_id).await? else {
                debug!(user_id = %user_id, "Stop with no active instance");
                return Ok(StopOutcome::NotFound);
            };

            let outcome = if active.state == InstanceState::Provisioning {
                self.queue_stop(active).await?
            } else {
                self.stop_running(active).await?
            };

            if let Some(outcome) = outcome {
                return Ok(outcome);
            }
        }

        Err(Error::Contention(format!("user {}", user_id)))
    }

    async fn queue_stop(&self, instance: Instance) -> Result<Option<StopOutcome>> {
        let now = Utc::now();
        let mut epoch = 0;

        let written = update_instance_with(self.store.as_ref(), instance, |i| {
            if i.state != InstanceState::Provisioning {
                return false;
            }
            epoch = i.accept_command(Command::Stop, now);
            i.post_provision_action = Some(PostProvisionAction::Terminate { epoch });
            i.last_stop_at = Some(now);
            true
        })
        .await?;

        Ok(written.map(|instance| {
            info!(instance_id = %instance.id, epoch, "Stop queued until provisioning completes");
            StopOutcome::QueuedAfterProvision {
                instance_id: instance.id,
                epoch,
            }
        }))
    }

    async fn stop_running(&self, instance: Instance) -> Result<Option<StopOutcome>> {
        let now = Utc::now();
        let mut epoch = 0;

        let written = update_instance_with(self.store.as_ref(), instance, |i| {
            if !matches!(
                i.state,
                InstanceState::Ready | InstanceState::Executing | InstanceState::Idle
            ) {
                return false;
            }
            epoch = i.accept_command(Command::Stop, now);
            i.last_stop_at = Some(now);
            true
        })
        .await?;

        let Some(instance) = written else {
            return Ok(None);
        };

        let mut remote_stopped = false;
        if instance.execution_running && instance.ipv4.is_some() {
            match self.admin.target_for(&instance) {
                Ok(target) => match self.admin.stop_execution(&target).await {
                    Ok(()) => remote_stopped = true,
                    Err(e) => {
                        warn!(instance_id = %instance.id, error = %e, "Best-effort execution stop failed")
                    }
                },
                Err(e) => warn!(instance_id = %instance.id, error = %e, "Cannot reach admin process"),
            }
        }

        let decided_at = Utc::now();
        let billing = self.config.billing;
        let lease_ttl = self.config.termination_lease_ttl;
        let mut target = None;

        let written = update_instance_with(self.store.as_ref(), instance.clone(), |i| {
            if i.command_epoch != epoch
                || !matches!(
                    i.state,
                    InstanceState::Ready | InstanceState::Executing | InstanceState::Idle
                )
            {
                return false;
            }
            let t = billing.compute_termination_target(i.billing_anchor(), decided_at);
            i.execution_running = false;
            if t.immediate {
                begin_termination(i, lease_ttl, decided_at);
            } else {
                i.state = InstanceState::Idle;
                i.scheduled_termination_at = Some(t.termination_at);
            }
            target = Some(t);
            true
        })
        .await?;

        let (Some(stopped), Some(target)) = (written, target) else {
            info!(instance_id = %instance.id, epoch, "Stop superseded by a newer command");
            if remote_stopped {
                self.resume_after_superseded_stop(&instance.id).await?;
            }
            return Ok(Some(StopOutcome::Superseded {
                instance_id: instance.id,
            }));
        };

        if target.immediate {
            info!(instance_id = %stopped.id, epoch, "Stop terminating instance at billing boundary");
            let terminated = self.terminator.terminate(stopped).await?;
            return Ok(Some(StopOutcome::Terminated {
                instance_id: terminated.id,
                epoch,
            }));
        }

        info!(
            instance_id = %stopped.id,
            epoch,
            scheduled_termination_at = %target.termination_at,
            "Stop scheduled termination"
        );
        Ok(Some(StopOutcome::Scheduled {
            instance_id: stopped.id,
            scheduled_termination_at: target.termination_at,
            billing_boundary: target.boundary,
            epoch,
        }))
    }

    /// The execution was stopped remotely but a newer command superseded the
    /// stop. Record the stopped execution and, when that command was a
    /// start, run it again.
    async fn resume_after_superseded_stop(&self, instance_id: &str) -> Result<()> {
        let Some(current) = self.store.get_instance(instance_id).await? else {
            return Ok(());
        };

        let written = update_instance_with(self.store.as_ref(), current, |i| {
            if i.state != InstanceState::Executing || !i.execution_running {
                return false;
            }
            i.state = InstanceState::Ready;
            i.execution_running = false;
            true
        })
        .await?;

        let Some(instance) = written else {
            return Ok(());
        };
        warn!(
            instance_id = %instance.id,
            epoch = instance.command_epoch,
            "Execution stopped by a superseded stop"
        );

        if instance.last_command == Some(Command::Start)
            && let Some(config) = instance.execution_config.clone()
        {
            let state = self
                .start_on_reused(&instance, &config, instance.command_epoch)
                .await?;
            info!(instance_id = %instance.id, state = %state, "Execution resumed after superseded stop");
        }
        Ok(())
    }

    // ========================================================================
    // queries
    // ========================================================================

    /// Status of the user's most recently created instance.
    pub async fn status(&self, user_id: &str) -> Result<StatusView> {
        Ok(self
            .store
            .latest_instance_for_user(user_id)
            .await?
            .as_ref()
            .map(StatusView::from)
            .unwrap_or_else(StatusView::missing))
    }

    /// Execution config stored for a cloud instance.
    pub async fn get_execution_config_by_instance(&self, cloud_instance_id: &str) -> Result<Option<Value>> {
        Ok(self
            .store
            .find_by_cloud_instance_id(cloud_instance_id)
            .await?
            .and_then(|instance| instance.execution_config))
    }

    async fn release_lock(&self, user_id: &str) {
        if let Err(e) = self.locks.release(user_id).await {
            warn!(user_id = %user_id, error = %e, "Failed to release start lock; it will expire");
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_empty() {
        assert_eq!(non_empty(&None), None);
        assert_eq!(non_empty(&Some("  ".to_string())), None);
        assert_eq!(non_empty(&Some(" fra ".to_string())), Some("fra".to_string()));
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(StartOutcome::AlreadyStarting).unwrap();
        assert_eq!(json, serde_json::json!({"outcome": "already_starting"}));

        let json = serde_json::to_value(StopOutcome::QueuedAfterProvision {
            instance_id: "i-1".to_string(),
            epoch: 3,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"outcome": "queued_after_provision", "instanceId": "i-1", "epoch": 3})
        );

        let json = serde_json::to_value(PhoneHomeOutcome::Executing {
            instance_id: "i-1".to_string(),
            ipv4: "203.0.113.7".to_string(),
            execution: ExecutionState::AlreadyRunning,
        })
        .unwrap();
        assert_eq!(json["execution"], "already-running");
        assert_eq!(json["ipv4"], "203.0.113.7");
    }

    #[test]
    fn test_missing_status_view() {
        let json = serde_json::to_value(StatusView::missing()).unwrap();
        assert_eq!(json["exists"], false);
        assert_eq!(json["executionRunning"], false);
        assert!(json["state"].is_null());
    }
}
