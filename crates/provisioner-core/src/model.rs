// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance data model.
//!
//! # Instance State Machine
//!
//! ```text
//!                 ┌──────────────┐
//!                 │ PROVISIONING │───────────────┐
//!                 └──────┬───────┘               │ queued stop
//!             phone-home │                       │ (epoch still current)
//!                        ▼                       ▼
//!                  ┌──────────┐  stop      ┌──────────┐
//!                  │  READY   │──────────► │   IDLE   │
//!                  └────┬─────┘ ◄──────────└────┬─────┘
//!                 start │        start          │ billing boundary
//!                       ▼                       ▼
//!                  ┌───────────┐  stop    ┌─────────────┐
//!                  │ EXECUTING │────────► │ TERMINATING │
//!                  └───────────┘          └──────┬──────┘
//!                                         ┌──────┴──────┐
//!                                         ▼             ▼
//!                                   ┌────────────┐ ┌───────┐
//!                                   │ TERMINATED │ │ ERROR │
//!                                   └────────────┘ └───────┘
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a provisioned instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    /// Cloud instance created, waiting for phone-home.
    Provisioning,
    /// Booted and reachable, no execution running.
    Ready,
    /// Admin process reported the execution as started.
    Executing,
    /// Stopped and waiting for its scheduled termination.
    Idle,
    /// Cloud delete in progress.
    Terminating,
    /// Cloud instance is gone.
    Terminated,
    /// Unrecoverable failure; requires manual intervention.
    Error,
}

impl InstanceState {
    /// States that count as "the user's instance" for start/stop.
    pub const ACTIVE: [InstanceState; 4] = [
        InstanceState::Provisioning,
        InstanceState::Ready,
        InstanceState::Executing,
        InstanceState::Idle,
    ];

    /// Database/wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Provisioning => "PROVISIONING",
            InstanceState::Ready => "READY",
            InstanceState::Executing => "EXECUTING",
            InstanceState::Idle => "IDLE",
            InstanceState::Terminating => "TERMINATING",
            InstanceState::Terminated => "TERMINATED",
            InstanceState::Error => "ERROR",
        }
    }

    /// Whether the instance still belongs to the user's active slot.
    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    /// Whether no transition leaves this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Terminated | InstanceState::Error)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROVISIONING" => Ok(InstanceState::Provisioning),
            "READY" => Ok(InstanceState::Ready),
            "EXECUTING" => Ok(InstanceState::Executing),
            "IDLE" => Ok(InstanceState::Idle),
            "TERMINATING" => Ok(InstanceState::Terminating),
            "TERMINATED" => Ok(InstanceState::Terminated),
            "ERROR" => Ok(InstanceState::Error),
            other => Err(format!("unknown instance state '{}'", other)),
        }
    }
}

/// Last user command accepted for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    /// Start (or restart) execution.
    Start,
    /// Stop execution and schedule termination.
    Stop,
}

impl Command {
    /// Database/wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Stop => "stop",
        }
    }
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Command::Start),
            "stop" => Ok(Command::Stop),
            other => Err(format!("unknown command '{}'", other)),
        }
    }
}

/// Action recorded while provisioning, applied at phone-home.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostProvisionAction {
    /// Terminate once booted, unless a later command bumped the epoch past `epoch`.
    Terminate {
        /// Command epoch of the stop that queued the termination.
        epoch: i64,
    },
    /// A start arrived while provisioning; proceed with the normal flow.
    Restarted,
}

impl PostProvisionAction {
    /// Database representation of the action column.
    pub fn as_str(&self) -> &'static str {
        match self {
            PostProvisionAction::Terminate { .. } => "terminate",
            PostProvisionAction::Restarted => "restarted",
        }
    }

    /// Rebuild from the two stored columns.
    pub fn from_columns(action: Option<&str>, epoch: Option<i64>) -> Result<Option<Self>, String> {
        match (action, epoch) {
            (None, _) => Ok(None),
            (Some("terminate"), Some(epoch)) => Ok(Some(PostProvisionAction::Terminate { epoch })),
            (Some("terminate"), None) => Err("terminate action without epoch".to_string()),
            (Some("restarted"), _) => Ok(Some(PostProvisionAction::Restarted)),
            (Some(other), _) => Err(format!("unknown post-provision action '{}'", other)),
        }
    }

    /// Epoch column value.
    pub fn epoch(&self) -> Option<i64> {
        match self {
            PostProvisionAction::Terminate { epoch } => Some(*epoch),
            PostProvisionAction::Restarted => None,
        }
    }
}

/// Scheduler ownership of a pending termination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationLease {
    /// Opaque holder token.
    pub lease_id: String,
    /// After this instant the termination can be claimed again.
    pub expires_at: DateTime<Utc>,
    /// When the lease was taken.
    pub locked_at: DateTime<Utc>,
}

/// A provisioned instance, one per cloud resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    /// Record ID (UUID v4).
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// ID assigned by the cloud provider.
    pub cloud_instance_id: String,
    /// Cloud region.
    pub region: String,
    /// Cloud plan (instance size).
    pub plan: String,
    /// Snapshot the instance was created from.
    pub snapshot_id: Option<String>,
    /// SHA-1 of the bootstrap payload delivered at creation.
    pub cloud_init_hash: Option<String>,
    /// Current lifecycle state.
    pub state: InstanceState,
    /// Whether the admin process is running the execution.
    pub execution_running: bool,
    /// Public IPv4 reported by the provider.
    pub ipv4: Option<String>,
    /// Base URL of the admin process.
    pub admin_api_url: Option<String>,
    /// Credential handed to the admin process.
    pub admin_api_key: Option<String>,
    /// Opaque execution configuration forwarded to the admin process.
    pub execution_config: Option<serde_json::Value>,
    /// Incremented once per accepted start/stop command.
    pub command_epoch: i64,
    /// Last accepted command.
    pub last_command: Option<Command>,
    /// When the last command was accepted.
    pub last_command_at: Option<DateTime<Utc>>,
    /// Deferred action applied at phone-home.
    pub post_provision_action: Option<PostProvisionAction>,
    /// Target time for the termination scheduler.
    pub scheduled_termination_at: Option<DateTime<Utc>>,
    /// Held while a termination is in progress.
    pub termination_lease: Option<TerminationLease>,
    /// Creation time reported by the cloud provider (billing anchor).
    pub instance_created_at: Option<DateTime<Utc>>,
    /// Record creation time (fallback billing anchor).
    pub created_at: DateTime<Utc>,
    /// Last successful write.
    pub updated_at: DateTime<Utc>,
    /// When the instance reported boot completion.
    pub phone_home_at: Option<DateTime<Utc>>,
    /// Last accepted start.
    pub last_start_at: Option<DateTime<Utc>>,
    /// Last accepted stop.
    pub last_stop_at: Option<DateTime<Utc>>,
    /// Last failure while bringing the execution up.
    pub last_start_error: Option<String>,
    /// Optimistic concurrency token, bumped by every successful write.
    pub version: i64,
}

impl Instance {
    /// Timestamp billing periods are counted from.
    pub fn billing_anchor(&self) -> DateTime<Utc> {
        self.instance_created_at.unwrap_or(self.created_at)
    }

    /// A stop queued during provisioning that no later command has superseded.
    pub fn has_current_deferred_terminate(&self) -> bool {
        matches!(
            self.post_provision_action,
            Some(PostProvisionAction::Terminate { epoch }) if epoch == self.command_epoch
        ) && self.last_command == Some(Command::Stop)
    }

    /// Record an accepted command, bumping the epoch.
    pub fn accept_command(&mut self, command: Command, now: DateTime<Utc>) -> i64 {
        self.command_epoch += 1;
        self.last_command = Some(command);
        self.last_command_at = Some(now);
        self.command_epoch
    }

    /// Clear scheduling and lease bookkeeping once the cloud resource is gone.
    pub fn mark_terminated(&mut self) {
        self.state = InstanceState::Terminated;
        self.execution_running = false;
        self.scheduled_termination_at = None;
        self.termination_lease = None;
    }
}

/// `at + duration`, saturating at the far end of the representable range.
pub(crate) fn saturating_add(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Per-user lock protecting instance creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartLockRecord {
    /// Lock key.
    pub user_id: String,
    /// Current holder token.
    pub lease_id: String,
    /// Lock is free again after this instant.
    pub lease_expires_at: DateTime<Utc>,
}
