// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provisioner Core - Cloud Instance Lifecycle Engine
//!
//! This crate drives per-user cloud instances that run a single long-lived
//! execution: it provisions an instance on start, starts the execution once
//! the instance phones home, and on stop terminates the instance at the last
//! moment before its next billing boundary.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                    provisioner-server (HTTP API)                     │
//! └──────────────────────────────────────────────────────────────────────┘
//!                 │ start / stop / status / phone-home
//!                 ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                      provisioner-core (This Crate)                   │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  │
//! │  │  Instance   │  │ Start Lock  │  │ Termination │  │   Billing   │  │
//! │  │  Manager    │  │  Manager    │  │  Scheduler  │  │  Boundary   │  │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  └─────────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//!        │                    │                         │
//!        │ create/delete      │ CAS writes, leases      │ start/stop execution
//!        ▼                    ▼                         ▼
//! ┌──────────────┐   ┌───────────────────┐   ┌─────────────────────────┐
//! │ Cloud        │   │ PostgreSQL/SQLite │   │ Admin process           │
//! │ Provider API │   │ (instances, locks)│   │ (on each instance)      │
//! └──────────────┘   └───────────────────┘   └─────────────────────────┘
//! ```
//!
//! # Instance State Machine
//!
//! See [`model::InstanceState`]. At most one instance per user is in an
//! active state (`PROVISIONING`, `READY`, `EXECUTING`, `IDLE`); the
//! database enforces it with a partial unique index.
//!
//! # Modules
//!
//! - [`admin`]: Admin process readiness and execution client
//! - [`billing`]: Billing boundary calculator
//! - [`bootstrap`]: Cloud-init payload generation
//! - [`cloud`]: Cloud provider trait, HTTP client and mock
//! - [`error`]: Error types
//! - [`lifecycle`]: Start, stop, status and phone-home orchestration
//! - [`persistence`]: Instance and start lock storage (PostgreSQL, SQLite)
//! - [`scheduler`]: Background termination scheduler
//! - [`start_lock`]: Per-user start lock
//! - [`termination`]: Cloud teardown with lease fencing

#![deny(missing_docs)]

/// Admin process readiness and execution client.
pub mod admin;

/// Billing period boundary calculation.
pub mod billing;

/// Cloud-init bootstrap payload.
pub mod bootstrap;

/// Cloud provider abstraction.
pub mod cloud;

/// Error types.
pub mod error;

/// Instance lifecycle orchestration.
pub mod lifecycle;

/// Embedded database migrations.
///
/// ```ignore
/// let pool = PgPool::connect(&database_url).await?;
/// provisioner_core::migrations::run_postgres(&pool).await?;
/// ```
pub mod migrations;

/// Instance and start lock records.
pub mod model;

/// Persistence layer.
pub mod persistence;

/// Termination scheduler.
pub mod scheduler;

/// Per-user start lock.
pub mod start_lock;

/// Cloud instance teardown.
pub mod termination;

pub use admin::{AdminClient, AdminClientConfig, AdminError, ExecutionState};
pub use billing::{BillingPolicy, TerminationTarget};
pub use cloud::{CloudError, CloudProvider};
pub use error::{Error, Result};
pub use lifecycle::{
    InstanceManager, LifecycleConfig, PhoneHomeOutcome, StartOutcome, StartRequest, StatusView,
    StopOutcome,
};
pub use model::{Command, Instance, InstanceState};
pub use persistence::{Persistence, PostgresPersistence, SqlitePersistence};
pub use scheduler::{TerminationScheduler, TerminationSchedulerConfig};
pub use start_lock::{StartLease, StartLockManager};
pub use termination::Terminator;
