// Main entry point for the ingestion pipeline server.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crawler::poller::FeedPoller;
use crawler::{
    DiscovererConfig, FeedDiscoverer, FetchWorker, FetchWorkerConfig, PgFeedStateStore,
    PgFrontierStore, PgHostStore, PgSourceManager, ReqwestFeedFetcher, ReqwestPageFetcher,
};
use server_core::config::Config;
use server_core::dlq::{DlqStore, DlqWorker, DlqWorkerConfig, PgDlqStore, Reprocessor};
use server_core::kernel::classifier::BusClassifierHandoff;
use server_core::kernel::jobs::{PgJobStore, Scheduler, SchedulerConfig};
use server_core::kernel::maintenance::{Maintenance, MaintenanceConfig};
use server_core::kernel::services::{DiscoveryService, FetchService};
use server_core::kernel::{Metrics, NatsBusPublisher, ServiceHost};
use server_core::outbox::{OutboxPublisher, PgOutboxStore, PublisherConfig};
use server_core::server::app::HttpService;
use server_core::server::build_app;

/// Re-enqueue reprocessing is owned by the index layer; until it registers
/// a handler, dead letters stay parked for inspection.
struct ParkedReprocessor;

#[async_trait::async_trait]
impl Reprocessor for ParkedReprocessor {
    async fn reprocess(&self, entry: &server_core::dlq::DlqEntry) -> Result<()> {
        anyhow::bail!(
            "no reprocessor registered for {} ({})",
            entry.content_id,
            entry.error_code.as_str()
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,crawler=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting content ingestion pipeline");

    let config = Config::from_env().context("failed to load configuration")?;

    tracing::info!("connecting to database");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    tracing::info!("running database migrations");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    tracing::info!(nats_url = %config.nats_url, "connecting to bus");
    let bus = Arc::new(
        NatsBusPublisher::connect(&config.nats_url)
            .await
            .context("failed to connect to NATS")?,
    );

    let metrics = Arc::new(Metrics::new().context("failed to build metrics registry")?);

    // Stores
    let frontier = Arc::new(PgFrontierStore::new(pool.clone()));
    let hosts = Arc::new(PgHostStore::new(pool.clone()));
    let feed_states = Arc::new(PgFeedStateStore::new(pool.clone()));
    let sources = Arc::new(PgSourceManager::new(pool.clone()));
    let jobs = Arc::new(PgJobStore::new(pool.clone()));
    let outbox: Arc<PgOutboxStore> = Arc::new(PgOutboxStore::new(pool.clone()));
    let dlq: Arc<dyn DlqStore> = Arc::new(PgDlqStore::new(pool.clone()));

    // Crawl domain
    let feed_fetcher = Arc::new(
        ReqwestFeedFetcher::new(&config.user_agent).context("failed to build feed fetcher")?,
    );
    let page_fetcher = Arc::new(
        ReqwestPageFetcher::new(&config.user_agent).context("failed to build page fetcher")?,
    );
    let poller = Arc::new(FeedPoller::new(
        frontier.clone(),
        feed_states.clone(),
        sources.clone(),
        feed_fetcher.clone(),
    ));
    let discoverer = Arc::new(FeedDiscoverer::new(
        sources.clone(),
        feed_fetcher,
        DiscovererConfig::default(),
    ));
    let fetch_worker = Arc::new(FetchWorker::new(
        frontier.clone(),
        hosts,
        page_fetcher,
        Arc::new(BusClassifierHandoff::new(bus.clone())),
        FetchWorkerConfig {
            workers: config.fetch_workers,
            max_retries: config.fetch_max_retries,
            user_agent: config.user_agent.clone(),
            ..Default::default()
        },
    ));

    // Workers
    let scheduler = Scheduler::new(
        jobs,
        sources,
        poller,
        metrics.clone(),
        SchedulerConfig {
            interval: config.scheduler_interval,
            stale_lock_age: config.stale_lock_age,
            ..Default::default()
        },
    );
    let outbox_publisher = OutboxPublisher::new(
        outbox.clone(),
        bus,
        metrics.clone(),
        PublisherConfig {
            poll_interval: config.outbox_poll_interval,
            batch_size: config.outbox_batch_size,
            stale_publishing_age: config.outbox_stale_publishing_age,
            retention: config.outbox_retention,
            ..Default::default()
        },
    );
    let dlq_worker = DlqWorker::new(
        dlq.clone(),
        Arc::new(ParkedReprocessor),
        metrics.clone(),
        DlqWorkerConfig {
            poll_interval: config.dlq_poll_interval,
            ..Default::default()
        },
    );
    let maintenance = Maintenance::new(
        frontier,
        outbox,
        dlq,
        metrics.clone(),
        MaintenanceConfig {
            stale_claim_age: config.frontier_stale_claim_age,
            frontier_retention: config.frontier_retention,
            ..Default::default()
        },
    );

    let app = build_app(pool, metrics.clone());

    ServiceHost::new(config.worker_drain_timeout)
        .with_service(HttpService::new(app, config.port))
        .with_service(scheduler)
        .with_service(FetchService::new(fetch_worker, metrics.clone()))
        .with_service(DiscoveryService::new(discoverer))
        .with_service(outbox_publisher)
        .with_service(dlq_worker)
        .with_service(maintenance)
        .run_until_shutdown()
        .await
}
