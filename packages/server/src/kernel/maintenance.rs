//! Periodic maintenance sweeps and gauge refresh.
//!
//! One service covers the frontier's recovery and retention sweeps plus the
//! depth gauges (frontier counts, outbox backlog, DLQ depth). Recovery also
//! runs once at startup so rows claimed by a crashed process come back
//! before the first poll.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use crawler::FrontierStore;
use tokio_util::sync::CancellationToken;

use crate::dlq::DlqStore;
use crate::kernel::metrics::Metrics;
use crate::kernel::service_host::Service;
use crate::outbox::OutboxStore;

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Gauge refresh and recovery cadence.
    pub sweep_interval: Duration,
    /// Age at which a frontier `fetching` claim is abandoned.
    pub stale_claim_age: Duration,
    /// Retention for terminal frontier rows.
    pub frontier_retention: Duration,
    /// Retention sweep cadence.
    pub cleanup_interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            stale_claim_age: Duration::from_secs(600),
            frontier_retention: Duration::from_secs(30 * 24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
        }
    }
}

pub struct Maintenance {
    frontier: Arc<dyn FrontierStore>,
    outbox: Arc<dyn OutboxStore>,
    dlq: Arc<dyn DlqStore>,
    metrics: Arc<Metrics>,
    config: MaintenanceConfig,
}

impl Maintenance {
    pub fn new(
        frontier: Arc<dyn FrontierStore>,
        outbox: Arc<dyn OutboxStore>,
        dlq: Arc<dyn DlqStore>,
        metrics: Arc<Metrics>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            frontier,
            outbox,
            dlq,
            metrics,
            config,
        }
    }

    async fn recover_frontier(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.stale_claim_age)
                .unwrap_or_else(|_| chrono::Duration::minutes(10));
        match self.frontier.recover_stale(cutoff).await {
            Ok(0) => {}
            Ok(recovered) => {
                tracing::warn!(recovered, "recovered stale frontier claims")
            }
            Err(e) => tracing::error!(error = %e, "frontier recovery failed"),
        }
    }

    async fn refresh_gauges(&self) {
        match self.frontier.stats().await {
            Ok(stats) => {
                self.metrics.frontier_pending.set(stats.pending);
                self.metrics.frontier_fetching.set(stats.fetching);
                self.metrics.frontier_dead.set(stats.dead);
            }
            Err(e) => tracing::warn!(error = %e, "frontier stats failed"),
        }
        match self.outbox.backlog().await {
            Ok(backlog) => self.metrics.outbox_backlog.set(backlog.total()),
            Err(e) => tracing::warn!(error = %e, "outbox backlog failed"),
        }
        match self.dlq.stats().await {
            Ok(stats) => self.metrics.dlq_depth.set(stats.pending),
            Err(e) => tracing::warn!(error = %e, "DLQ stats failed"),
        }
    }

    async fn cleanup_frontier(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.frontier_retention)
                .unwrap_or_else(|_| chrono::Duration::days(30));
        match self.frontier.cleanup_terminal(cutoff).await {
            Ok(0) => {}
            Ok(deleted) => tracing::info!(deleted, "cleaned up terminal frontier rows"),
            Err(e) => tracing::error!(error = %e, "frontier cleanup failed"),
        }
    }
}

#[async_trait::async_trait]
impl Service for Maintenance {
    fn name(&self) -> &'static str {
        "maintenance"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        tracing::info!("maintenance starting");

        // Startup recovery: reclaim rows left over from a previous run.
        self.recover_frontier().await;
        self.refresh_gauges().await;

        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        let mut cleanup = tokio::time::interval(self.config.cleanup_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sweep.tick() => {
                    self.recover_frontier().await;
                    self.refresh_gauges().await;
                }
                _ = cleanup.tick() => {
                    self.cleanup_frontier().await;
                }
            }
        }
        tracing::info!("maintenance stopped");
        Ok(())
    }
}
