// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for the provisioner.
//!
//! [`ProvisionerRuntime`] runs the HTTP API and the termination scheduler
//! inside an existing tokio application.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use provisioner_core::admin::HttpAdminTransport;
//! use provisioner_core::cloud::HttpCloudProvider;
//! use provisioner_core::persistence::SqlitePersistence;
//! use provisioner_server::runtime::ProvisionerRuntime;
//!
//! let config = provisioner_server::config::Config::from_env()?;
//! let store = Arc::new(SqlitePersistence::from_path("provisioner.db").await?);
//!
//! let runtime = ProvisionerRuntime::builder()
//!     .config(&config)
//!     .persistence(store)
//!     .cloud(Arc::new(HttpCloudProvider::new(config.cloud.clone())?))
//!     .admin_transport(Arc::new(HttpAdminTransport::new(config.admin.ready_timeout)?))
//!     .build()?
//!     .start()
//!     .await?;
//!
//! runtime.shutdown().await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use provisioner_core::admin::{AdminClient, AdminClientConfig, AdminTransport};
use provisioner_core::cloud::CloudProvider;
use provisioner_core::lifecycle::{InstanceManager, LifecycleConfig};
use provisioner_core::persistence::Persistence;
use provisioner_core::scheduler::{TerminationScheduler, TerminationSchedulerConfig};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::api::{ApiState, build_router};
use crate::config::Config;

/// Builder for creating a [`ProvisionerRuntime`].
pub struct ProvisionerRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    cloud: Option<Arc<dyn CloudProvider>>,
    admin_transport: Option<Arc<dyn AdminTransport>>,
    bind_addr: SocketAddr,
    api_key: String,
    admin: AdminClientConfig,
    lifecycle: LifecycleConfig,
    scheduler: TerminationSchedulerConfig,
}

impl Default for ProvisionerRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            cloud: None,
            admin_transport: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            api_key: String::new(),
            admin: AdminClientConfig::default(),
            lifecycle: LifecycleConfig::default(),
            scheduler: TerminationSchedulerConfig::default(),
        }
    }
}

impl ProvisionerRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take listen address, keys and component settings from a loaded [`Config`].
    pub fn config(mut self, config: &Config) -> Self {
        self.bind_addr = config.http_addr;
        self.api_key = config.api_key.clone();
        self.admin = config.admin.clone();
        self.lifecycle = config.lifecycle.clone();
        self.scheduler = config.scheduler.clone();
        self
    }

    /// Set the persistence backend (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the cloud provider (required).
    pub fn cloud(mut self, cloud: Arc<dyn CloudProvider>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    /// Set the admin process transport (required).
    pub fn admin_transport(mut self, transport: Arc<dyn AdminTransport>) -> Self {
        self.admin_transport = Some(transport);
        self
    }

    /// Set the HTTP listen address.
    ///
    /// Default: `0.0.0.0:3000`
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the key guarding the user-facing routes.
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = key.into();
        self
    }

    /// Set the admin client configuration.
    pub fn admin(mut self, config: AdminClientConfig) -> Self {
        self.admin = config;
        self
    }

    /// Set the lifecycle configuration.
    pub fn lifecycle(mut self, config: LifecycleConfig) -> Self {
        self.lifecycle = config;
        self
    }

    /// Set the termination scheduler configuration.
    pub fn scheduler(mut self, config: TerminationSchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<ProvisionerRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let cloud = self
            .cloud
            .ok_or_else(|| anyhow::anyhow!("cloud provider is required"))?;
        let admin_transport = self
            .admin_transport
            .ok_or_else(|| anyhow::anyhow!("admin transport is required"))?;
        if self.api_key.is_empty() {
            anyhow::bail!("api key is required");
        }

        Ok(ProvisionerRuntimeConfig {
            persistence,
            cloud,
            admin_transport,
            bind_addr: self.bind_addr,
            api_key: self.api_key,
            admin: self.admin,
            lifecycle: self.lifecycle,
            scheduler: self.scheduler,
        })
    }
}

/// Configuration for a [`ProvisionerRuntime`].
pub struct ProvisionerRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    cloud: Arc<dyn CloudProvider>,
    admin_transport: Arc<dyn AdminTransport>,
    bind_addr: SocketAddr,
    api_key: String,
    admin: AdminClientConfig,
    lifecycle: LifecycleConfig,
    scheduler: TerminationSchedulerConfig,
}

impl ProvisionerRuntimeConfig {
    /// Start the runtime, spawning the HTTP server and the termination scheduler.
    pub async fn start(self) -> Result<ProvisionerRuntime> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        let admin_api_key = self.admin.api_key.clone();
        let admin = AdminClient::new(self.admin_transport, self.admin);
        let manager = InstanceManager::new(
            self.persistence.clone(),
            self.cloud,
            admin,
            self.lifecycle,
        );

        let scheduler = TerminationScheduler::new(
            self.persistence,
            manager.terminator().clone(),
            self.scheduler,
        );
        let scheduler_shutdown = scheduler.shutdown_handle();
        let scheduler_handle = tokio::spawn(scheduler.run());

        let router = build_router(ApiState::new(manager, &self.api_key, &admin_api_key));

        let (server_shutdown_tx, mut server_shutdown_rx) = watch::channel(false);
        let server_handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    while server_shutdown_rx.changed().await.is_ok() {
                        if *server_shutdown_rx.borrow() {
                            break;
                        }
                    }
                })
                .await?;
            Ok::<(), anyhow::Error>(())
        });

        info!(bind_addr = %local_addr, "ProvisionerRuntime started");

        Ok(ProvisionerRuntime {
            server_handle,
            scheduler_handle,
            server_shutdown_tx,
            scheduler_shutdown,
            local_addr,
        })
    }
}

/// A running provisioner: HTTP API plus termination scheduler.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ProvisionerRuntime {
    server_handle: JoinHandle<Result<()>>,
    scheduler_handle: JoinHandle<()>,
    server_shutdown_tx: watch::Sender<bool>,
    scheduler_shutdown: Arc<Notify>,
    local_addr: SocketAddr,
}

impl ProvisionerRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ProvisionerRuntimeBuilder {
        ProvisionerRuntimeBuilder::new()
    }

    /// Address the HTTP server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished() && !self.scheduler_handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops accepting requests, lets the scheduler drain in-flight
    /// terminations within its grace period, then waits for both tasks.
    pub async fn shutdown(self) -> Result<()> {
        info!("ProvisionerRuntime shutting down...");

        let _ = self.server_shutdown_tx.send(true);
        self.scheduler_shutdown.notify_one();

        if let Err(e) = self.scheduler_handle.await {
            error!("Termination scheduler task panicked: {}", e);
        }

        match self.server_handle.await {
            Ok(Ok(())) => {
                info!("ProvisionerRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("ProvisionerRuntime server error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("ProvisionerRuntime server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        }
    }
}
