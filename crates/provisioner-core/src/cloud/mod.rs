// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cloud provider abstraction.
//!
//! - [`HttpCloudProvider`]: REST client with bearer auth
//! - [`MockCloudProvider`]: in-memory provider for tests

pub mod http;
pub mod mock;
pub mod traits;

pub use http::{HttpCloudConfig, HttpCloudProvider};
pub use mock::MockCloudProvider;
pub use traits::{
    CloudError, CloudInstance, CloudProvider, CreateInstanceSpec, Ipv4Address, is_usable_ipv4,
};
