//! Dead-letter queue for classification/indexing failures.
//!
//! Entries are keyed by `content_id`; re-enqueueing an existing entry
//! bumps its retry count and pushes its next attempt out exponentially
//! (capped at an hour). Once `retry_count` reaches `max_retries` the entry
//! is exhausted: it stays for inspection but is never claimed again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crawler::StoreError;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::kernel::metrics::Metrics;
use crate::kernel::service_host::Service;

pub const DEFAULT_MAX_RETRIES: i32 = 5;

/// Backoff base (seconds) and cap for re-enqueued entries.
const RETRY_BASE_SECS: i64 = 60;
const RETRY_CAP_SECS: i64 = 3600;

/// Soft-claim lease applied by `fetch_retryable`.
const CLAIM_LEASE_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DlqErrorCode {
    #[serde(rename = "ES_TIMEOUT")]
    EsTimeout,
    #[serde(rename = "ES_UNAVAILABLE")]
    EsUnavailable,
    #[serde(rename = "RULE_PANIC")]
    RulePanic,
    #[serde(rename = "QUALITY_ERROR")]
    QualityError,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl DlqErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DlqErrorCode::EsTimeout => "ES_TIMEOUT",
            DlqErrorCode::EsUnavailable => "ES_UNAVAILABLE",
            DlqErrorCode::RulePanic => "RULE_PANIC",
            DlqErrorCode::QualityError => "QUALITY_ERROR",
            DlqErrorCode::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "ES_TIMEOUT" => DlqErrorCode::EsTimeout,
            "ES_UNAVAILABLE" => DlqErrorCode::EsUnavailable,
            "RULE_PANIC" => DlqErrorCode::RulePanic,
            "QUALITY_ERROR" => DlqErrorCode::QualityError,
            _ => DlqErrorCode::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DlqEntry {
    pub id: Uuid,
    pub content_id: String,
    pub source_name: String,
    pub error_message: String,
    pub error_code: DlqErrorCode,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDlqEntry {
    pub content_id: String,
    pub source_name: String,
    pub error_message: String,
    pub error_code: DlqErrorCode,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DlqStats {
    pub pending: i64,
    pub exhausted: i64,
    pub ready: i64,
    pub avg_retries: f64,
    pub oldest_entry: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait DlqStore: Send + Sync {
    /// Insert or re-enqueue. On conflict: bump `retry_count`, stamp
    /// `last_attempt_at`, extend `next_retry_at` exponentially, but only
    /// while retries remain; exhausted rows are not perturbed.
    async fn enqueue(&self, entry: NewDlqEntry) -> Result<(), StoreError>;

    /// Claim up to `limit` entries whose backoff elapsed and retries
    /// remain, oldest schedule first.
    async fn fetch_retryable(&self, limit: i64) -> Result<Vec<DlqEntry>, StoreError>;

    /// Delete a successfully reprocessed entry.
    async fn remove(&self, content_id: &str) -> Result<(), StoreError>;

    /// Administrative give-up: saturate `retry_count`.
    async fn mark_exhausted(&self, content_id: &str) -> Result<(), StoreError>;

    async fn stats(&self) -> Result<DlqStats, StoreError>;

    /// Pending entries grouped by source, for alerting.
    async fn count_by_source(&self) -> Result<HashMap<String, i64>, StoreError>;
}

// ============================================================================
// POSTGRES
// ============================================================================

const DLQ_COLUMNS: &str = "id, content_id, source_name, error_message, error_code, retry_count, \
     max_retries, next_retry_at, created_at, last_attempt_at";

fn row_to_entry(r: &sqlx::postgres::PgRow) -> DlqEntry {
    let error_code: String = r.get("error_code");
    DlqEntry {
        id: r.get("id"),
        content_id: r.get("content_id"),
        source_name: r.get("source_name"),
        error_message: r.get("error_message"),
        error_code: DlqErrorCode::parse(&error_code),
        retry_count: r.get("retry_count"),
        max_retries: r.get("max_retries"),
        next_retry_at: r.get("next_retry_at"),
        created_at: r.get("created_at"),
        last_attempt_at: r.get("last_attempt_at"),
    }
}

pub struct PgDlqStore {
    pool: PgPool,
}

impl PgDlqStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DlqStore for PgDlqStore {
    async fn enqueue(&self, entry: NewDlqEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO dlq_entries (
                id, content_id, source_name, error_message, error_code,
                retry_count, max_retries, next_retry_at
            ) VALUES ($1, $2, $3, $4, $5, 0, $6, NOW())
            ON CONFLICT (content_id) DO UPDATE
            SET retry_count = dlq_entries.retry_count + 1,
                error_message = EXCLUDED.error_message,
                error_code = EXCLUDED.error_code,
                last_attempt_at = NOW(),
                next_retry_at = NOW() + make_interval(secs =>
                    LEAST($7 * (2 ^ (dlq_entries.retry_count + 1)), $8))
            WHERE dlq_entries.retry_count < dlq_entries.max_retries
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&entry.content_id)
        .bind(&entry.source_name)
        .bind(&entry.error_message)
        .bind(entry.error_code.as_str())
        .bind(DEFAULT_MAX_RETRIES)
        .bind(RETRY_BASE_SECS)
        .bind(RETRY_CAP_SECS as f64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_retryable(&self, limit: i64) -> Result<Vec<DlqEntry>, StoreError> {
        // The lease push on next_retry_at is the claim: concurrent sweeps
        // skip each other's rows, and a crashed sweep's rows come back when
        // the lease elapses.
        let rows = sqlx::query(&format!(
            r#"
            WITH picked AS (
                SELECT id
                FROM dlq_entries
                WHERE next_retry_at <= NOW() AND retry_count < max_retries
                ORDER BY next_retry_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE dlq_entries
            SET last_attempt_at = NOW(),
                next_retry_at = NOW() + make_interval(secs => $2)
            WHERE id IN (SELECT id FROM picked)
            RETURNING {DLQ_COLUMNS}
            "#
        ))
        .bind(limit)
        .bind(CLAIM_LEASE_SECS as f64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_entry).collect())
    }

    async fn remove(&self, content_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM dlq_entries WHERE content_id = $1")
            .bind(content_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_exhausted(&self, content_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE dlq_entries
            SET retry_count = max_retries, last_attempt_at = NOW()
            WHERE content_id = $1
            "#,
        )
        .bind(content_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(Uuid::nil()));
        }
        Ok(())
    }

    async fn stats(&self) -> Result<DlqStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE retry_count < max_retries) AS pending,
                COUNT(*) FILTER (WHERE retry_count >= max_retries) AS exhausted,
                COUNT(*) FILTER (WHERE retry_count < max_retries AND next_retry_at <= NOW())
                    AS ready,
                COALESCE(AVG(retry_count), 0)::float8 AS avg_retries,
                MIN(created_at) AS oldest_entry
            FROM dlq_entries
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(DlqStats {
            pending: row.get("pending"),
            exhausted: row.get("exhausted"),
            ready: row.get("ready"),
            avg_retries: row.get("avg_retries"),
            oldest_entry: row.get("oldest_entry"),
        })
    }

    async fn count_by_source(&self) -> Result<HashMap<String, i64>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT source_name, COUNT(*) AS count
            FROM dlq_entries
            WHERE retry_count < max_retries
            GROUP BY source_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get("source_name"), r.get("count")))
            .collect())
    }
}

// ============================================================================
// WORKER
// ============================================================================

/// Thin interface to whatever failed downstream (the index layer): retry
/// one dead-lettered document.
#[async_trait]
pub trait Reprocessor: Send + Sync {
    async fn reprocess(&self, entry: &DlqEntry) -> Result<()>;
}

pub struct DlqWorkerConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
}

impl Default for DlqWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            batch_size: 50,
        }
    }
}

pub struct DlqWorker {
    store: Arc<dyn DlqStore>,
    reprocessor: Arc<dyn Reprocessor>,
    metrics: Arc<Metrics>,
    config: DlqWorkerConfig,
}

impl DlqWorker {
    pub fn new(
        store: Arc<dyn DlqStore>,
        reprocessor: Arc<dyn Reprocessor>,
        metrics: Arc<Metrics>,
        config: DlqWorkerConfig,
    ) -> Self {
        Self {
            store,
            reprocessor,
            metrics,
            config,
        }
    }

    /// One retry sweep. Returns how many entries were reprocessed
    /// successfully.
    pub async fn sweep_once(&self) -> Result<usize> {
        let entries = self.store.fetch_retryable(self.config.batch_size).await?;
        if entries.is_empty() {
            return Ok(0);
        }

        let mut reprocessed = 0;
        for entry in entries {
            match self.reprocessor.reprocess(&entry).await {
                Ok(()) => {
                    self.store.remove(&entry.content_id).await?;
                    self.metrics.dlq_retried_total.inc();
                    reprocessed += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        content_id = %entry.content_id,
                        retry_count = entry.retry_count,
                        error = %e,
                        "DLQ reprocess failed"
                    );
                    let exhausting = entry.retry_count + 1 >= entry.max_retries;
                    self.store
                        .enqueue(NewDlqEntry {
                            content_id: entry.content_id.clone(),
                            source_name: entry.source_name.clone(),
                            error_message: e.to_string(),
                            error_code: entry.error_code,
                        })
                        .await?;
                    if exhausting {
                        self.metrics.dlq_dropped_total.inc();
                    }
                }
            }
        }
        Ok(reprocessed)
    }
}

#[async_trait]
impl Service for DlqWorker {
    fn name(&self) -> &'static str {
        "dlq-worker"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "DLQ worker starting"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
            if shutdown.is_cancelled() {
                break;
            }
            match self.sweep_once().await {
                Ok(0) => {}
                Ok(count) => tracing::info!(count, "reprocessed DLQ entries"),
                Err(e) => tracing::error!(error = %e, "DLQ sweep failed"),
            }
        }
        tracing::info!("DLQ worker stopped");
        Ok(())
    }
}

// ============================================================================
// IN-MEMORY (tests)
// ============================================================================

pub mod testing {
    use std::sync::Mutex;

    use chrono::Duration;

    use super::*;

    #[derive(Default)]
    pub struct MemoryDlqStore {
        entries: Mutex<HashMap<String, DlqEntry>>,
    }

    impl MemoryDlqStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn get(&self, content_id: &str) -> Option<DlqEntry> {
            self.entries.lock().unwrap().get(content_id).cloned()
        }

        /// Test hook: make an entry immediately retryable.
        pub fn make_ready(&self, content_id: &str) {
            let mut entries = self.entries.lock().unwrap();
            if let Some(entry) = entries.get_mut(content_id) {
                entry.next_retry_at = Utc::now() - Duration::seconds(1);
            }
        }
    }

    #[async_trait]
    impl DlqStore for MemoryDlqStore {
        async fn enqueue(&self, entry: NewDlqEntry) -> Result<(), StoreError> {
            let mut entries = self.entries.lock().unwrap();
            let now = Utc::now();
            match entries.get_mut(&entry.content_id) {
                Some(existing) => {
                    if existing.retry_count < existing.max_retries {
                        existing.retry_count += 1;
                        existing.error_message = entry.error_message;
                        existing.error_code = entry.error_code;
                        existing.last_attempt_at = now;
                        let backoff = (RETRY_BASE_SECS
                            * 2i64.pow(existing.retry_count.min(16) as u32))
                        .min(RETRY_CAP_SECS);
                        existing.next_retry_at = now + Duration::seconds(backoff);
                    }
                }
                None => {
                    entries.insert(
                        entry.content_id.clone(),
                        DlqEntry {
                            id: Uuid::new_v4(),
                            content_id: entry.content_id,
                            source_name: entry.source_name,
                            error_message: entry.error_message,
                            error_code: entry.error_code,
                            retry_count: 0,
                            max_retries: DEFAULT_MAX_RETRIES,
                            next_retry_at: now,
                            created_at: now,
                            last_attempt_at: now,
                        },
                    );
                }
            }
            Ok(())
        }

        async fn fetch_retryable(&self, limit: i64) -> Result<Vec<DlqEntry>, StoreError> {
            let now = Utc::now();
            let mut entries = self.entries.lock().unwrap();
            let mut picked: Vec<String> = {
                let mut ready: Vec<&DlqEntry> = entries
                    .values()
                    .filter(|e| e.next_retry_at <= now && e.retry_count < e.max_retries)
                    .collect();
                ready.sort_by_key(|e| e.next_retry_at);
                ready
                    .iter()
                    .take(limit as usize)
                    .map(|e| e.content_id.clone())
                    .collect()
            };
            let mut claimed = Vec::new();
            for content_id in picked.drain(..) {
                if let Some(entry) = entries.get_mut(&content_id) {
                    entry.last_attempt_at = now;
                    entry.next_retry_at = now + Duration::seconds(CLAIM_LEASE_SECS);
                    claimed.push(entry.clone());
                }
            }
            Ok(claimed)
        }

        async fn remove(&self, content_id: &str) -> Result<(), StoreError> {
            self.entries.lock().unwrap().remove(content_id);
            Ok(())
        }

        async fn mark_exhausted(&self, content_id: &str) -> Result<(), StoreError> {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries
                .get_mut(content_id)
                .ok_or(StoreError::NotFound(Uuid::nil()))?;
            entry.retry_count = entry.max_retries;
            entry.last_attempt_at = Utc::now();
            Ok(())
        }

        async fn stats(&self) -> Result<DlqStats, StoreError> {
            let now = Utc::now();
            let entries = self.entries.lock().unwrap();
            let mut stats = DlqStats::default();
            let mut total_retries = 0i64;
            for entry in entries.values() {
                if entry.retry_count >= entry.max_retries {
                    stats.exhausted += 1;
                } else {
                    stats.pending += 1;
                    if entry.next_retry_at <= now {
                        stats.ready += 1;
                    }
                }
                total_retries += entry.retry_count as i64;
                stats.oldest_entry = match stats.oldest_entry {
                    None => Some(entry.created_at),
                    Some(oldest) => Some(oldest.min(entry.created_at)),
                };
            }
            if !entries.is_empty() {
                stats.avg_retries = total_retries as f64 / entries.len() as f64;
            }
            Ok(stats)
        }

        async fn count_by_source(&self) -> Result<HashMap<String, i64>, StoreError> {
            let entries = self.entries.lock().unwrap();
            let mut counts = HashMap::new();
            for entry in entries.values() {
                if entry.retry_count < entry.max_retries {
                    *counts.entry(entry.source_name.clone()).or_insert(0) += 1;
                }
            }
            Ok(counts)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::testing::MemoryDlqStore;
    use super::*;

    fn entry(content_id: &str) -> NewDlqEntry {
        NewDlqEntry {
            content_id: content_id.to_string(),
            source_name: "example-news".to_string(),
            error_message: "index timed out".to_string(),
            error_code: DlqErrorCode::EsTimeout,
        }
    }

    #[tokio::test]
    async fn reenqueue_increments_and_backs_off() {
        let store = MemoryDlqStore::new();
        store.enqueue(entry("c1")).await.unwrap();
        assert_eq!(store.get("c1").unwrap().retry_count, 0);

        store.enqueue(entry("c1")).await.unwrap();
        let row = store.get("c1").unwrap();
        assert_eq!(row.retry_count, 1);
        assert!(row.next_retry_at > Utc::now());
    }

    #[tokio::test]
    async fn exhausted_entries_are_never_fetched_or_perturbed() {
        let store = MemoryDlqStore::new();
        store.enqueue(entry("c1")).await.unwrap();
        for _ in 0..DEFAULT_MAX_RETRIES {
            store.enqueue(entry("c1")).await.unwrap();
        }
        let row = store.get("c1").unwrap();
        assert_eq!(row.retry_count, DEFAULT_MAX_RETRIES);

        // Further enqueues do not move it.
        store.enqueue(entry("c1")).await.unwrap();
        assert_eq!(store.get("c1").unwrap().retry_count, DEFAULT_MAX_RETRIES);

        store.make_ready("c1");
        assert!(store.fetch_retryable(10).await.unwrap().is_empty());

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.exhausted, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn mark_exhausted_is_an_administrative_give_up() {
        let store = MemoryDlqStore::new();
        store.enqueue(entry("c1")).await.unwrap();
        store.mark_exhausted("c1").await.unwrap();
        assert!(store.fetch_retryable(10).await.unwrap().is_empty());
    }

    struct FlakyReprocessor {
        fail_times: Mutex<u32>,
    }

    #[async_trait]
    impl Reprocessor for FlakyReprocessor {
        async fn reprocess(&self, _entry: &DlqEntry) -> Result<()> {
            let mut remaining = self.fail_times.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                anyhow::bail!("still broken");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn worker_removes_on_success_and_reenqueues_on_failure() {
        let store = Arc::new(MemoryDlqStore::new());
        store.enqueue(entry("c1")).await.unwrap();

        let worker = DlqWorker::new(
            store.clone(),
            Arc::new(FlakyReprocessor {
                fail_times: Mutex::new(1),
            }),
            Arc::new(Metrics::new().unwrap()),
            DlqWorkerConfig::default(),
        );

        // First sweep fails: entry stays with a bumped retry count.
        assert_eq!(worker.sweep_once().await.unwrap(), 0);
        assert_eq!(store.get("c1").unwrap().retry_count, 1);

        // Backoff elapsed, second sweep succeeds: entry removed.
        store.make_ready("c1");
        assert_eq!(worker.sweep_once().await.unwrap(), 1);
        assert!(store.get("c1").is_none());
    }

    #[tokio::test]
    async fn stats_and_counts_group_correctly() {
        let store = MemoryDlqStore::new();
        store.enqueue(entry("c1")).await.unwrap();
        store.enqueue(entry("c2")).await.unwrap();
        store
            .enqueue(NewDlqEntry {
                source_name: "other-source".to_string(),
                ..entry("c3")
            })
            .await
            .unwrap();

        let counts = store.count_by_source().await.unwrap();
        assert_eq!(counts.get("example-news"), Some(&2));
        assert_eq!(counts.get("other-source"), Some(&1));

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.ready, 3);
        assert!(stats.oldest_entry.is_some());
    }
}
