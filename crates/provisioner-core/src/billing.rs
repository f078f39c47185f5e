// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Billing boundary calculator.
//!
//! Instances are billed per started period counted from their creation time.
//! Terminating just before the next boundary uses the already-paid period in
//! full without starting a new one.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

/// Billing period and safety margin before a boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingPolicy {
    /// Length of one billing period.
    pub period: Duration,
    /// How long before the boundary the delete must be issued.
    pub destroy_buffer: Duration,
}

impl Default for BillingPolicy {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(3600),
            destroy_buffer: Duration::from_secs(60),
        }
    }
}

/// When an instance should be terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TerminationTarget {
    /// Next billing boundary strictly after `now`.
    pub boundary: DateTime<Utc>,
    /// `boundary - destroy_buffer`.
    pub termination_at: DateTime<Utc>,
    /// The termination time has already been reached.
    pub immediate: bool,
}

impl BillingPolicy {
    /// Compute the termination target for an instance billed from `anchor`.
    ///
    /// `boundary` is the smallest `anchor + k * period` (k >= 1) strictly
    /// after `now`. A zero period degenerates to a single boundary at
    /// `anchor + 0`, which is always immediate.
    pub fn compute_termination_target(
        &self,
        anchor: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> TerminationTarget {
        let period_ms = i64::try_from(self.period.as_millis()).unwrap_or(i64::MAX);
        let buffer_ms = i64::try_from(self.destroy_buffer.as_millis()).unwrap_or(i64::MAX);

        let elapsed_ms = (now - anchor).num_milliseconds();
        let periods = if period_ms == 0 || elapsed_ms < 0 {
            1
        } else {
            elapsed_ms / period_ms + 1
        };

        let boundary = anchor + TimeDelta::milliseconds(periods.saturating_mul(period_ms));
        let termination_at = boundary - TimeDelta::milliseconds(buffer_ms);

        TerminationTarget {
            boundary,
            termination_at,
            immediate: termination_at <= now,
        }
    }
}
