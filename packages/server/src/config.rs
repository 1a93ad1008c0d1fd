use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub nats_url: String,
    pub port: u16,
    pub user_agent: String,

    /// Concurrent frontier fetch tasks.
    pub fetch_workers: usize,
    /// Frontier fetch attempts before a URL goes dead.
    pub fetch_max_retries: i32,

    /// Scheduler sweep interval.
    pub scheduler_interval: Duration,
    /// Age at which a job lock is considered abandoned.
    pub stale_lock_age: Duration,

    /// Outbox poll interval.
    pub outbox_poll_interval: Duration,
    /// Outbox batch size per tick.
    pub outbox_batch_size: i64,
    /// Age at which a `publishing` outbox row is reclaimed.
    pub outbox_stale_publishing_age: Duration,
    /// Retention for published outbox rows.
    pub outbox_retention: Duration,

    /// DLQ retry sweep interval.
    pub dlq_poll_interval: Duration,

    /// Retention for terminal frontier rows.
    pub frontier_retention: Duration,
    /// Age at which a `fetching` claim is considered abandoned.
    pub frontier_stale_claim_age: Duration,

    /// Grace period for in-flight work on shutdown.
    pub worker_drain_timeout: Duration,
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("{name} must be a number")),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables. A `.env` file is
    /// honored in development.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            nats_url: env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            user_agent: env::var("CRAWLER_USER_AGENT")
                .unwrap_or_else(|_| "contentpipeline/1.0".to_string()),
            fetch_workers: env_u64("FETCH_WORKERS", 4)? as usize,
            fetch_max_retries: env_u64("FETCH_MAX_RETRIES", 5)? as i32,
            scheduler_interval: Duration::from_secs(env_u64("SCHEDULER_INTERVAL_SECS", 30)?),
            stale_lock_age: Duration::from_secs(env_u64("STALE_LOCK_AGE_SECS", 600)?),
            outbox_poll_interval: Duration::from_secs(env_u64("OUTBOX_POLL_INTERVAL_SECS", 5)?),
            outbox_batch_size: env_u64("OUTBOX_BATCH_SIZE", 100)? as i64,
            outbox_stale_publishing_age: Duration::from_secs(env_u64(
                "OUTBOX_STALE_PUBLISHING_SECS",
                300,
            )?),
            outbox_retention: Duration::from_secs(env_u64(
                "OUTBOX_RETENTION_SECS",
                7 * 24 * 60 * 60,
            )?),
            dlq_poll_interval: Duration::from_secs(env_u64("DLQ_POLL_INTERVAL_SECS", 60)?),
            frontier_retention: Duration::from_secs(env_u64(
                "FRONTIER_RETENTION_SECS",
                30 * 24 * 60 * 60,
            )?),
            frontier_stale_claim_age: Duration::from_secs(env_u64(
                "FRONTIER_STALE_CLAIM_SECS",
                600,
            )?),
            worker_drain_timeout: Duration::from_secs(env_u64("WORKER_DRAIN_TIMEOUT_SECS", 30)?),
        })
    }
}
