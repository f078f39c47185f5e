// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provisioner Server - HTTP control plane
//!
//! Exposes the lifecycle engine from `provisioner-core` over HTTP and runs
//! the termination scheduler next to it.
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `PROVISIONER_DATABASE_URL` | Yes | - | `postgres://…` or `sqlite:…` |
//! | `PROVISIONER_HTTP_PORT` | No | `3000` | HTTP port |
//! | `PROVISIONER_API_KEY` | Yes | - | Key for the `/executions` routes |
//! | `CLOUD_API_URL` | No | provider default | Cloud API base URL |
//! | `CLOUD_API_KEY` | Yes | - | Cloud API bearer token |
//! | `CLOUD_REGION` | No | `us-east-1` | Default region |
//! | `CLOUD_PLAN` | No | `small-1cpu-1gb` | Default plan |
//! | `SNAPSHOT_ID` | No | - | Default snapshot |
//! | `ADMIN_API_KEY` | Yes | - | Admin process credential |
//! | `ADMIN_API_PORT` | No | `4310` | Admin process port |
//! | `CONTROL_API_URL` | Yes | - | Public URL used by phone-home |
//! | `ADMIN_READY_TIMEOUT` | No | `120s` | Admin readiness timeout |
//! | `ADMIN_START_RETRIES` | No | `6` | Execution start attempts |
//! | `START_LOCK_TTL` | No | `15m` | Start lock TTL |
//! | `DESTROY_LEASE_TTL` | No | `120s` | Termination lease TTL |
//! | `DESTROY_CONCURRENCY` | No | `30` | Terminations in flight |
//! | `DESTROY_BUFFER` | No | `60s` | Delete this long before the boundary |
//! | `DESTROY_SCAN_INTERVAL` | No | `15s` | Scheduler poll interval |
//! | `BILLING_PERIOD` | No | `1h` | Billing period |
//!
//! Durations accept `<n>ms`, `<n>s`, `<n>m` or `<n>h`; a bare number is
//! milliseconds.

#![deny(missing_docs)]

/// HTTP routes, guards and error mapping.
pub mod api;

/// Server configuration loaded from environment variables.
pub mod config;

/// Embeddable runtime running the API and the termination scheduler.
pub mod runtime;
