// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Termination scheduler.
//!
//! Periodically claims instances whose scheduled termination time has passed
//! (and `TERMINATING` instances whose lease expired) and tears them down in
//! the background.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{Instance, saturating_add};
use crate::persistence::Persistence;
use crate::termination::Terminator;

/// Termination scheduler configuration.
#[derive(Debug, Clone)]
pub struct TerminationSchedulerConfig {
    /// How often to scan for due terminations
    pub poll_interval: Duration,
    /// Maximum terminations in flight
    pub concurrency: usize,
    /// Lease taken on each claimed instance
    pub lease_ttl: Duration,
    /// How long shutdown waits for in-flight terminations
    pub shutdown_grace: Duration,
}

impl Default for TerminationSchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            concurrency: 30,
            lease_ttl: Duration::from_secs(120),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

type JobResult = (String, Result<Instance>);

/// Termination scheduler that runs as a background task.
pub struct TerminationScheduler {
    store: Arc<dyn Persistence>,
    terminator: Terminator,
    config: TerminationSchedulerConfig,
    jobs: JoinSet<JobResult>,
    shutdown: Arc<Notify>,
}

impl TerminationScheduler {
    /// Create a new scheduler.
    pub fn new(
        store: Arc<dyn Persistence>,
        terminator: Terminator,
        config: TerminationSchedulerConfig,
    ) -> Self {
        Self {
            store,
            terminator,
            config,
            jobs: JoinSet::new(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Number of terminations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.jobs.len()
    }

    /// Run the scheduler loop until shutdown is signalled.
    pub async fn run(mut self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            concurrency = self.config.concurrency,
            "Termination scheduler started"
        );

        let shutdown = self.shutdown.clone();
        let period = self.config.poll_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("Termination scheduler shutting down");
                    break;
                }
                Some(finished) = self.jobs.join_next(), if !self.jobs.is_empty() => {
                    log_job(finished);
                    continue;
                }
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.tick().await {
                error!(error = %e, "Failed to scan for due terminations");
            }
        }

        self.drain(self.config.shutdown_grace).await;
    }

    /// Claim due instances up to the free concurrency and dispatch them.
    ///
    /// Returns how many terminations were dispatched.
    pub async fn tick(&mut self) -> Result<usize> {
        while let Some(finished) = self.jobs.try_join_next() {
            log_job(finished);
        }

        let available = self.config.concurrency.saturating_sub(self.jobs.len());
        let mut dispatched = 0;

        while dispatched < available {
            let now = Utc::now();
            let lease_id = Uuid::new_v4().to_string();
            let expires_at = saturating_add(now, self.config.lease_ttl);

            let Some(instance) = self
                .store
                .claim_due_termination(now, &lease_id, expires_at)
                .await?
            else {
                break;
            };

            info!(
                instance_id = %instance.id,
                user_id = %instance.user_id,
                cloud_instance_id = %instance.cloud_instance_id,
                "Claimed instance for termination"
            );

            let terminator = self.terminator.clone();
            let instance_id = instance.id.clone();
            self.jobs
                .spawn(async move { (instance_id, terminator.terminate(instance).await) });
            dispatched += 1;
        }

        if dispatched == 0 {
            debug!(in_flight = self.jobs.len(), "No terminations due");
        }
        Ok(dispatched)
    }

    /// Wait up to `grace` for in-flight terminations, then abort the rest.
    ///
    /// Aborted terminations keep their lease until it expires, after which
    /// they are claimed again.
    pub async fn drain(&mut self, grace: Duration) {
        let jobs = &mut self.jobs;
        let waited = tokio::time::timeout(grace, async {
            while let Some(finished) = jobs.join_next().await {
                log_job(finished);
            }
        })
        .await;

        if waited.is_err() {
            warn!(
                remaining = self.jobs.len(),
                "Aborting in-flight terminations after shutdown grace"
            );
            self.jobs.abort_all();
            while self.jobs.join_next().await.is_some() {}
        }
    }
}

fn log_job(finished: std::result::Result<JobResult, JoinError>) {
    match finished {
        Ok((instance_id, Ok(instance))) => {
            debug!(instance_id = %instance_id, state = %instance.state, "Termination job finished");
        }
        Ok((instance_id, Err(e))) => {
            error!(instance_id = %instance_id, error = %e, "Termination job failed");
        }
        Err(e) if e.is_cancelled() => {}
        Err(e) => {
            error!(error = %e, "Termination job panicked");
        }
    }
}
