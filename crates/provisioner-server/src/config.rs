// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the provisioner server.
//!
//! Everything is read once at startup and split into the component configs
//! handed to the core constructors.

use std::net::SocketAddr;
use std::time::Duration;

use provisioner_core::admin::AdminClientConfig;
use provisioner_core::billing::BillingPolicy;
use provisioner_core::cloud::HttpCloudConfig;
use provisioner_core::lifecycle::LifecycleConfig;
use provisioner_core::scheduler::TerminationSchedulerConfig;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// `postgres://…` or `sqlite:…`
    pub database_url: String,
    /// HTTP listen address
    pub http_addr: SocketAddr,
    /// Key expected in `X-API-Key` on the user-facing routes
    pub api_key: String,
    /// Cloud provider client settings
    pub cloud: HttpCloudConfig,
    /// Admin process client settings (its key also guards the config route)
    pub admin: AdminClientConfig,
    /// Lifecycle defaults, TTLs and billing policy
    pub lifecycle: LifecycleConfig,
    /// Termination scheduler settings
    pub scheduler: TerminationSchedulerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &'static str| var(key).ok_or(ConfigError::MissingEnvVar(key));
        let duration = |key: &'static str, default: Duration| match var(key) {
            Some(value) => {
                parse_duration(&value).ok_or(ConfigError::InvalidDuration { var: key, value })
            }
            None => Ok(default),
        };

        let database_url = required("PROVISIONER_DATABASE_URL")?;
        let api_key = required("PROVISIONER_API_KEY")?;

        let port: u16 = parse_number(var("PROVISIONER_HTTP_PORT"), "PROVISIONER_HTTP_PORT", 3000)?;
        let http_addr = SocketAddr::from(([0, 0, 0, 0], port));

        let cloud_defaults = HttpCloudConfig::default();
        let cloud = HttpCloudConfig {
            base_url: var("CLOUD_API_URL").unwrap_or(cloud_defaults.base_url),
            api_key: required("CLOUD_API_KEY")?,
            timeout: cloud_defaults.timeout,
        };

        let admin_defaults = AdminClientConfig::default();
        let admin = AdminClientConfig {
            api_key: required("ADMIN_API_KEY")?,
            api_port: parse_number(var("ADMIN_API_PORT"), "ADMIN_API_PORT", admin_defaults.api_port)?,
            ready_timeout: duration("ADMIN_READY_TIMEOUT", admin_defaults.ready_timeout)?,
            max_attempts: parse_number(
                var("ADMIN_START_RETRIES"),
                "ADMIN_START_RETRIES",
                admin_defaults.max_attempts,
            )?,
            ..admin_defaults
        };

        let lifecycle_defaults = LifecycleConfig::default();
        let billing_defaults = BillingPolicy::default();
        let termination_lease_ttl = duration("DESTROY_LEASE_TTL", lifecycle_defaults.termination_lease_ttl)?;
        let lifecycle = LifecycleConfig {
            default_region: var("CLOUD_REGION").unwrap_or(lifecycle_defaults.default_region),
            default_plan: var("CLOUD_PLAN").unwrap_or(lifecycle_defaults.default_plan),
            default_snapshot_id: var("SNAPSHOT_ID"),
            control_api_url: required("CONTROL_API_URL")?,
            start_lock_ttl: duration("START_LOCK_TTL", lifecycle_defaults.start_lock_ttl)?,
            termination_lease_ttl,
            billing: BillingPolicy {
                period: duration("BILLING_PERIOD", billing_defaults.period)?,
                destroy_buffer: duration("DESTROY_BUFFER", billing_defaults.destroy_buffer)?,
            },
        };

        let scheduler_defaults = TerminationSchedulerConfig::default();
        let scheduler = TerminationSchedulerConfig {
            poll_interval: duration("DESTROY_SCAN_INTERVAL", scheduler_defaults.poll_interval)?,
            concurrency: parse_number(
                var("DESTROY_CONCURRENCY"),
                "DESTROY_CONCURRENCY",
                scheduler_defaults.concurrency,
            )?,
            lease_ttl: termination_lease_ttl,
            ..scheduler_defaults
        };

        Ok(Self {
            database_url,
            http_addr,
            api_key,
            cloud,
            admin,
            lifecycle,
            scheduler,
        })
    }
}

fn parse_number<T: std::str::FromStr>(
    value: Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { var, value }),
        None => Ok(default),
    }
}

/// Parse `<n>ms`, `<n>s`, `<n>m` or `<n>h`. A bare number is milliseconds.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim().to_ascii_lowercase();
    let (digits, unit_ms) = if let Some(n) = value.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = value.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = value.strip_suffix('m') {
        (n, 60_000)
    } else if let Some(n) = value.strip_suffix('h') {
        (n, 3_600_000)
    } else {
        (value.as_str(), 1)
    };

    let amount: u64 = digits.trim().parse().ok()?;
    amount.checked_mul(unit_ms).map(Duration::from_millis)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A duration variable could not be parsed.
    #[error("Invalid duration in {var}: '{value}' (expected <n>ms|s|m|h)")]
    InvalidDuration {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
    /// A numeric variable could not be parsed.
    #[error("Invalid number in {var}: '{value}'")]
    InvalidNumber {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
}
