// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provisioner - Cloud Instance Control Plane
//!
//! An HTTP server responsible for:
//! - Provisioning one cloud instance per user on start
//! - Starting the user's execution once the instance phones home
//! - Terminating stopped instances just before their next billing boundary

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use provisioner_core::admin::HttpAdminTransport;
use provisioner_core::cloud::HttpCloudProvider;
use provisioner_core::migrations;
use provisioner_core::persistence::{Persistence, PostgresPersistence, SqlitePersistence};
use provisioner_server::config::Config;
use provisioner_server::runtime::ProvisionerRuntime;
use tracing::{info, warn};

const ADMIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "provisioner=info,provisioner_server=info,provisioner_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        http_addr = %config.http_addr,
        control_api_url = %config.lifecycle.control_api_url,
        default_region = %config.lifecycle.default_region,
        "Starting Provisioner"
    );

    let persistence = connect(&config.database_url).await?;
    info!("Database ready");

    let cloud = Arc::new(HttpCloudProvider::new(config.cloud.clone())?);
    let admin_transport = Arc::new(HttpAdminTransport::new(ADMIN_REQUEST_TIMEOUT)?);

    let runtime = ProvisionerRuntime::builder()
        .config(&config)
        .persistence(persistence)
        .cloud(cloud)
        .admin_transport(admin_transport)
        .build()?
        .start()
        .await?;

    info!(addr = %runtime.local_addr(), "Provisioner ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Provisioner shut down");

    Ok(())
}

/// Open the backend named by the URL scheme and apply its migrations.
async fn connect(database_url: &str) -> anyhow::Result<Arc<dyn Persistence>> {
    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;
        migrations::run_postgres(&pool).await?;
        return Ok(Arc::new(PostgresPersistence::new(pool)));
    }

    if let Some(path) = database_url.strip_prefix("sqlite:") {
        let path = path.trim_start_matches("//");
        if path == ":memory:" {
            warn!("Using in-memory SQLite; state is lost on exit");
            return Ok(Arc::new(SqlitePersistence::in_memory().await?));
        }
        return Ok(Arc::new(SqlitePersistence::from_path(path).await?));
    }

    anyhow::bail!("Unsupported database URL scheme (expected postgres:// or sqlite:)")
}
