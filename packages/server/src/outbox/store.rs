//! Classified-document outbox persistence.
//!
//! The classifier inserts a row in the same transaction as its index write;
//! the publisher worker claims batches with skip-locked reads and drives
//! the `pending -> publishing -> published | failed` state machine.
//! `publishing` is a soft claim: rows stuck there past a staleness deadline
//! are swept back to `pending`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crawler::StoreError;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Publishing,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Publishing => "publishing",
            OutboxStatus::Published => "published",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OutboxStatus::Pending),
            "publishing" => Some(OutboxStatus::Publishing),
            "published" => Some(OutboxStatus::Published),
            "failed" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub content_id: String,
    pub source_name: String,
    pub index_name: String,
    pub content_type: String,
    pub topics: Vec<String>,
    pub quality_score: f64,
    pub is_crime_related: bool,
    pub crime_subcategory: Option<String>,
    pub title: String,
    pub body: String,
    pub url: String,
    pub published_date: Option<DateTime<Utc>>,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

/// What the classifier hands over for publication.
#[derive(Debug, Clone)]
pub struct NewOutboxEntry {
    pub content_id: String,
    pub source_name: String,
    pub index_name: String,
    pub content_type: String,
    pub topics: Vec<String>,
    pub quality_score: f64,
    pub is_crime_related: bool,
    pub crime_subcategory: Option<String>,
    pub title: String,
    pub body: String,
    pub url: String,
    pub published_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct OutboxBacklog {
    pub pending: i64,
    pub publishing: i64,
    pub failed_retryable: i64,
}

impl OutboxBacklog {
    pub fn total(&self) -> i64 {
        self.pending + self.publishing + self.failed_retryable
    }
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Idempotent insert by `content_id`. A conflict bumps `updated_at`
    /// only; a non-pending row's status is never changed.
    async fn insert(&self, entry: NewOutboxEntry) -> Result<(), StoreError>;

    /// Claim up to `limit` pending rows, crime-related first, oldest first;
    /// claimed rows move to `publishing`.
    async fn fetch_pending(&self, limit: i64) -> Result<Vec<OutboxEntry>, StoreError>;

    /// Claim failed rows whose backoff has elapsed and retries remain.
    async fn fetch_retryable(&self, limit: i64) -> Result<Vec<OutboxEntry>, StoreError>;

    /// `publishing -> published`, terminal.
    async fn mark_published(&self, id: Uuid) -> Result<(), StoreError>;

    /// `publishing -> failed` with exponential backoff.
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError>;

    /// Return `publishing` rows older than the cutoff to `pending`; covers
    /// workers that crashed between claim and publish.
    async fn recover_stale(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Delete `published` rows older than the cutoff.
    async fn cleanup_published(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn backlog(&self) -> Result<OutboxBacklog, StoreError>;
}

// ============================================================================
// POSTGRES
// ============================================================================

const OUTBOX_COLUMNS: &str = "id, content_id, source_name, index_name, content_type, topics, \
     quality_score, is_crime_related, crime_subcategory, title, body, url, published_date, \
     status, retry_count, max_retries, next_retry_at, error_message, created_at, updated_at, \
     published_at";

fn row_to_entry(r: &sqlx::postgres::PgRow) -> OutboxEntry {
    let status: String = r.get("status");
    OutboxEntry {
        id: r.get("id"),
        content_id: r.get("content_id"),
        source_name: r.get("source_name"),
        index_name: r.get("index_name"),
        content_type: r.get("content_type"),
        topics: r.get("topics"),
        quality_score: r.get("quality_score"),
        is_crime_related: r.get("is_crime_related"),
        crime_subcategory: r.get("crime_subcategory"),
        title: r.get("title"),
        body: r.get("body"),
        url: r.get("url"),
        published_date: r.get("published_date"),
        status: OutboxStatus::parse(&status).unwrap_or(OutboxStatus::Pending),
        retry_count: r.get("retry_count"),
        max_retries: r.get("max_retries"),
        next_retry_at: r.get("next_retry_at"),
        error_message: r.get("error_message"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
        published_at: r.get("published_at"),
    }
}

pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert inside the caller's transaction: the classifier writes its
    /// index document and this row atomically.
    pub async fn insert_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        entry: &NewOutboxEntry,
    ) -> Result<(), StoreError> {
        sqlx::query(INSERT_SQL)
            .bind(Uuid::new_v4())
            .bind(&entry.content_id)
            .bind(&entry.source_name)
            .bind(&entry.index_name)
            .bind(&entry.content_type)
            .bind(&entry.topics)
            .bind(entry.quality_score)
            .bind(entry.is_crime_related)
            .bind(&entry.crime_subcategory)
            .bind(&entry.title)
            .bind(&entry.body)
            .bind(&entry.url)
            .bind(entry.published_date)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn claim(&self, predicate_sql: &str, limit: i64) -> Result<Vec<OutboxEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            WITH picked AS (
                SELECT id
                FROM outbox_entries
                WHERE {predicate_sql}
                ORDER BY is_crime_related DESC, created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox_entries
            SET status = 'publishing', updated_at = NOW()
            WHERE id IN (SELECT id FROM picked)
            RETURNING {OUTBOX_COLUMNS}
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_entry).collect())
    }
}

const INSERT_SQL: &str = r#"
    INSERT INTO outbox_entries (
        id, content_id, source_name, index_name, content_type, topics,
        quality_score, is_crime_related, crime_subcategory, title, body, url,
        published_date
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
    ON CONFLICT (content_id) DO UPDATE SET updated_at = NOW()
"#;

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn insert(&self, entry: NewOutboxEntry) -> Result<(), StoreError> {
        sqlx::query(INSERT_SQL)
            .bind(Uuid::new_v4())
            .bind(&entry.content_id)
            .bind(&entry.source_name)
            .bind(&entry.index_name)
            .bind(&entry.content_type)
            .bind(&entry.topics)
            .bind(entry.quality_score)
            .bind(entry.is_crime_related)
            .bind(&entry.crime_subcategory)
            .bind(&entry.title)
            .bind(&entry.body)
            .bind(&entry.url)
            .bind(entry.published_date)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fetch_pending(&self, limit: i64) -> Result<Vec<OutboxEntry>, StoreError> {
        self.claim("status = 'pending'", limit).await
    }

    async fn fetch_retryable(&self, limit: i64) -> Result<Vec<OutboxEntry>, StoreError> {
        self.claim(
            "status = 'failed' AND retry_count < max_retries AND next_retry_at <= NOW()",
            limit,
        )
        .await
    }

    async fn mark_published(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_entries
            SET status = 'published',
                published_at = NOW(),
                error_message = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'publishing'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_entries
            SET status = 'failed',
                retry_count = retry_count + 1,
                next_retry_at = NOW() + make_interval(mins => (2 ^ LEAST(retry_count, 16))::int),
                error_message = $2,
                updated_at = NOW()
            WHERE id = $1 AND status = 'publishing'
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn recover_stale(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_entries
            SET status = 'pending', updated_at = NOW()
            WHERE status = 'publishing' AND updated_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn cleanup_published(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM outbox_entries
            WHERE status = 'published' AND published_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn backlog(&self) -> Result<OutboxBacklog, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'publishing') AS publishing,
                COUNT(*) FILTER (WHERE status = 'failed' AND retry_count < max_retries)
                    AS failed_retryable
            FROM outbox_entries
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(OutboxBacklog {
            pending: row.get("pending"),
            publishing: row.get("publishing"),
            failed_retryable: row.get("failed_retryable"),
        })
    }
}

// ============================================================================
// IN-MEMORY (tests)
// ============================================================================

pub mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use chrono::Duration;

    use super::*;

    /// Mirrors the SQL semantics of [`PgOutboxStore`] for worker tests.
    #[derive(Default)]
    pub struct MemoryOutboxStore {
        entries: Mutex<HashMap<Uuid, OutboxEntry>>,
    }

    impl MemoryOutboxStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn get_by_content_id(&self, content_id: &str) -> Option<OutboxEntry> {
            self.entries
                .lock()
                .unwrap()
                .values()
                .find(|e| e.content_id == content_id)
                .cloned()
        }

        pub fn len(&self) -> usize {
            self.entries.lock().unwrap().len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        /// Test hook: force a row into `publishing` with a given claim age.
        pub fn force_publishing(&self, content_id: &str, updated_at: DateTime<Utc>) {
            let mut entries = self.entries.lock().unwrap();
            if let Some(entry) = entries.values_mut().find(|e| e.content_id == content_id) {
                entry.status = OutboxStatus::Publishing;
                entry.updated_at = updated_at;
            }
        }
    }

    #[async_trait]
    impl OutboxStore for MemoryOutboxStore {
        async fn insert(&self, entry: NewOutboxEntry) -> Result<(), StoreError> {
            let mut entries = self.entries.lock().unwrap();
            if let Some(existing) = entries
                .values_mut()
                .find(|e| e.content_id == entry.content_id)
            {
                existing.updated_at = Utc::now();
                return Ok(());
            }
            let now = Utc::now();
            let row = OutboxEntry {
                id: Uuid::new_v4(),
                content_id: entry.content_id,
                source_name: entry.source_name,
                index_name: entry.index_name,
                content_type: entry.content_type,
                topics: entry.topics,
                quality_score: entry.quality_score,
                is_crime_related: entry.is_crime_related,
                crime_subcategory: entry.crime_subcategory,
                title: entry.title,
                body: entry.body,
                url: entry.url,
                published_date: entry.published_date,
                status: OutboxStatus::Pending,
                retry_count: 0,
                max_retries: 5,
                next_retry_at: None,
                error_message: None,
                created_at: now,
                updated_at: now,
                published_at: None,
            };
            entries.insert(row.id, row);
            Ok(())
        }

        async fn fetch_pending(&self, limit: i64) -> Result<Vec<OutboxEntry>, StoreError> {
            let mut entries = self.entries.lock().unwrap();
            let mut claimable: Vec<Uuid> = {
                let mut rows: Vec<&OutboxEntry> = entries
                    .values()
                    .filter(|e| e.status == OutboxStatus::Pending)
                    .collect();
                rows.sort_by(|a, b| {
                    b.is_crime_related
                        .cmp(&a.is_crime_related)
                        .then(a.created_at.cmp(&b.created_at))
                });
                rows.iter().take(limit as usize).map(|e| e.id).collect()
            };
            let mut claimed = Vec::new();
            for id in claimable.drain(..) {
                if let Some(entry) = entries.get_mut(&id) {
                    entry.status = OutboxStatus::Publishing;
                    entry.updated_at = Utc::now();
                    claimed.push(entry.clone());
                }
            }
            Ok(claimed)
        }

        async fn fetch_retryable(&self, limit: i64) -> Result<Vec<OutboxEntry>, StoreError> {
            let now = Utc::now();
            let mut entries = self.entries.lock().unwrap();
            let mut claimable: Vec<Uuid> = {
                let mut rows: Vec<&OutboxEntry> = entries
                    .values()
                    .filter(|e| {
                        e.status == OutboxStatus::Failed
                            && e.retry_count < e.max_retries
                            && e.next_retry_at.map_or(false, |at| at <= now)
                    })
                    .collect();
                rows.sort_by(|a, b| {
                    b.is_crime_related
                        .cmp(&a.is_crime_related)
                        .then(a.created_at.cmp(&b.created_at))
                });
                rows.iter().take(limit as usize).map(|e| e.id).collect()
            };
            let mut claimed = Vec::new();
            for id in claimable.drain(..) {
                if let Some(entry) = entries.get_mut(&id) {
                    entry.status = OutboxStatus::Publishing;
                    entry.updated_at = now;
                    claimed.push(entry.clone());
                }
            }
            Ok(claimed)
        }

        async fn mark_published(&self, id: Uuid) -> Result<(), StoreError> {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries
                .get_mut(&id)
                .filter(|e| e.status == OutboxStatus::Publishing)
                .ok_or(StoreError::NotFound(id))?;
            entry.status = OutboxStatus::Published;
            entry.published_at = Some(Utc::now());
            entry.error_message = None;
            entry.updated_at = Utc::now();
            Ok(())
        }

        async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries
                .get_mut(&id)
                .filter(|e| e.status == OutboxStatus::Publishing)
                .ok_or(StoreError::NotFound(id))?;
            let old_retry_count = entry.retry_count;
            entry.status = OutboxStatus::Failed;
            entry.retry_count += 1;
            entry.next_retry_at =
                Some(Utc::now() + Duration::minutes(2i64.pow(old_retry_count.min(16) as u32)));
            entry.error_message = Some(error.to_string());
            entry.updated_at = Utc::now();
            Ok(())
        }

        async fn recover_stale(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
            let mut entries = self.entries.lock().unwrap();
            let mut recovered = 0;
            for entry in entries.values_mut() {
                if entry.status == OutboxStatus::Publishing && entry.updated_at < older_than {
                    entry.status = OutboxStatus::Pending;
                    entry.updated_at = Utc::now();
                    recovered += 1;
                }
            }
            Ok(recovered)
        }

        async fn cleanup_published(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
            let mut entries = self.entries.lock().unwrap();
            let before = entries.len();
            entries.retain(|_, e| {
                !(e.status == OutboxStatus::Published
                    && e.published_at.map_or(false, |at| at < older_than))
            });
            Ok((before - entries.len()) as u64)
        }

        async fn backlog(&self) -> Result<OutboxBacklog, StoreError> {
            let entries = self.entries.lock().unwrap();
            let mut backlog = OutboxBacklog::default();
            for entry in entries.values() {
                match entry.status {
                    OutboxStatus::Pending => backlog.pending += 1,
                    OutboxStatus::Publishing => backlog.publishing += 1,
                    OutboxStatus::Failed if entry.retry_count < entry.max_retries => {
                        backlog.failed_retryable += 1
                    }
                    _ => {}
                }
            }
            Ok(backlog)
        }
    }
}
