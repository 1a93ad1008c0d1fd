//! Postgres-backed storage for the crawl domain.
//!
//! The frontier claim and the conflict-merge submit are expressed in SQL so
//! that many worker processes can share one database without any other
//! coordination. Claims take a `FOR UPDATE SKIP LOCKED` row lock inside a
//! CTE; concurrent claimers are guaranteed disjoint rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::StoreError;
use crate::storage::{FeedStateStore, FrontierStore, HostStore};
use crate::types::{
    FeedState, FetchOutcome, FrontierFilter, FrontierStats, FrontierUrl, HostState, UrlOrigin,
    UrlStatus, UrlSubmission, DEFAULT_MIN_DELAY_MS, DEFAULT_ROBOTS_TTL_HOURS,
};

const FRONTIER_COLUMNS: &str = "id, url, url_hash, host, source_id, origin, parent_url, depth, \
     priority, status, next_fetch_at, last_fetched_at, fetch_count, content_hash, etag, \
     last_modified, retry_count, last_error, discovered_at, created_at, updated_at";

fn row_to_frontier_url(r: &sqlx::postgres::PgRow) -> FrontierUrl {
    let status: String = r.get("status");
    let origin: String = r.get("origin");
    FrontierUrl {
        id: r.get("id"),
        url: r.get("url"),
        url_hash: r.get("url_hash"),
        host: r.get("host"),
        source_id: r.get("source_id"),
        origin: UrlOrigin::parse(&origin).unwrap_or(UrlOrigin::Seed),
        parent_url: r.get("parent_url"),
        depth: r.get("depth"),
        priority: r.get("priority"),
        status: UrlStatus::parse(&status).unwrap_or(UrlStatus::Pending),
        next_fetch_at: r.get("next_fetch_at"),
        last_fetched_at: r.get("last_fetched_at"),
        fetch_count: r.get("fetch_count"),
        content_hash: r.get("content_hash"),
        etag: r.get("etag"),
        last_modified: r.get("last_modified"),
        retry_count: r.get("retry_count"),
        last_error: r.get("last_error"),
        discovered_at: r.get("discovered_at"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}

// ============================================================================
// FRONTIER
// ============================================================================

pub struct PgFrontierStore {
    pool: PgPool,
}

impl PgFrontierStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FrontierStore for PgFrontierStore {
    async fn submit(&self, s: UrlSubmission) -> Result<(), StoreError> {
        // Conflict merge only applies while the existing row is pending;
        // fetched/dead rows are left untouched.
        sqlx::query(
            r#"
            INSERT INTO frontier_urls (
                id, url, url_hash, host, source_id, origin, parent_url,
                depth, priority, status, next_fetch_at, discovered_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending', $10, NOW())
            ON CONFLICT (url_hash) DO UPDATE
            SET priority = GREATEST(frontier_urls.priority, EXCLUDED.priority),
                next_fetch_at = LEAST(frontier_urls.next_fetch_at, EXCLUDED.next_fetch_at),
                updated_at = NOW()
            WHERE frontier_urls.status = 'pending'
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&s.url)
        .bind(&s.url_hash)
        .bind(&s.host)
        .bind(s.source_id)
        .bind(s.origin.as_str())
        .bind(&s.parent_url)
        .bind(s.depth)
        .bind(s.priority)
        .bind(s.next_fetch_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim(&self) -> Result<Option<FrontierUrl>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            WITH candidate AS (
                SELECT f.id
                FROM frontier_urls f
                LEFT JOIN host_states h ON h.host = f.host
                WHERE f.status = 'pending'
                  AND f.next_fetch_at <= NOW()
                  AND (h.host IS NULL
                       OR h.last_fetch_at IS NULL
                       OR h.last_fetch_at + (h.min_delay_ms || ' milliseconds')::INTERVAL <= NOW())
                ORDER BY f.priority DESC, f.next_fetch_at ASC
                LIMIT 1
                FOR UPDATE OF f SKIP LOCKED
            )
            UPDATE frontier_urls
            SET status = 'fetching', updated_at = NOW()
            WHERE id IN (SELECT id FROM candidate)
            RETURNING {FRONTIER_COLUMNS}
            "#
        ))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_frontier_url))
    }

    async fn update_fetched(&self, id: Uuid, outcome: FetchOutcome) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE frontier_urls
            SET status = 'fetched',
                last_fetched_at = NOW(),
                fetch_count = fetch_count + 1,
                retry_count = 0,
                content_hash = COALESCE($2, content_hash),
                etag = COALESCE($3, etag),
                last_modified = COALESCE($4, last_modified),
                last_error = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'fetching'
            "#,
        )
        .bind(id)
        .bind(&outcome.content_hash)
        .bind(&outcome.etag)
        .bind(&outcome.last_modified)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn update_fetched_with_final_url(
        &self,
        id: Uuid,
        final_url: &str,
        final_url_hash: &str,
        final_host: &str,
        outcome: FetchOutcome,
    ) -> Result<(), StoreError> {
        // Two-phase write: try rewriting the canonical URL; if another row
        // already carries the target hash, keep the fetched metadata at the
        // old URL and let a later compaction pass merge the duplicates.
        let attempt = sqlx::query(
            r#"
            UPDATE frontier_urls
            SET url = $2,
                url_hash = $3,
                host = $4,
                status = 'fetched',
                last_fetched_at = NOW(),
                fetch_count = fetch_count + 1,
                retry_count = 0,
                content_hash = COALESCE($5, content_hash),
                etag = COALESCE($6, etag),
                last_modified = COALESCE($7, last_modified),
                last_error = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'fetching'
            "#,
        )
        .bind(id)
        .bind(final_url)
        .bind(final_url_hash)
        .bind(final_host)
        .bind(&outcome.content_hash)
        .bind(&outcome.etag)
        .bind(&outcome.last_modified)
        .execute(&self.pool)
        .await;

        match attempt {
            Ok(result) => {
                if result.rows_affected() == 0 {
                    return Err(StoreError::NotFound(id));
                }
                Ok(())
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                tracing::debug!(
                    id = %id,
                    final_url = %final_url,
                    "redirect target already in frontier, keeping original URL"
                );
                self.update_fetched(id, outcome).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_failed(
        &self,
        id: Uuid,
        error: &str,
        max_retries: i32,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE frontier_urls
            SET retry_count = retry_count + 1,
                status = CASE WHEN retry_count + 1 >= $3 THEN 'dead' ELSE 'pending' END,
                next_fetch_at = CASE
                    WHEN retry_count + 1 >= $3 THEN next_fetch_at
                    ELSE NOW() + make_interval(mins => (2 ^ LEAST(retry_count, 16))::int)
                END,
                last_error = $2,
                updated_at = NOW()
            WHERE id = $1 AND status = 'fetching'
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(max_retries)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn update_dead(&self, id: Uuid, reason: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE frontier_urls
            SET status = 'dead',
                last_error = $2,
                updated_at = NOW()
            WHERE id = $1 AND status <> 'dead'
            "#,
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn reset_for_retry(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE frontier_urls
            SET status = 'pending',
                retry_count = 0,
                next_fetch_at = NOW(),
                last_error = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'dead'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let status: Option<String> =
                sqlx::query_scalar("SELECT status FROM frontier_urls WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?;
            return match status {
                None => Err(StoreError::NotFound(id)),
                Some(actual) => Err(StoreError::WrongState {
                    id,
                    expected: "dead",
                    actual,
                }),
            };
        }
        Ok(())
    }

    async fn list(
        &self,
        filter: FrontierFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FrontierUrl>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {FRONTIER_COLUMNS}
            FROM frontier_urls
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR host = $2)
              AND ($3::uuid IS NULL OR source_id = $3)
            ORDER BY priority DESC, next_fetch_at ASC
            LIMIT $4 OFFSET $5
            "#
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(&filter.host)
        .bind(filter.source_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_frontier_url).collect())
    }

    async fn stats(&self) -> Result<FrontierStats, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM frontier_urls
            GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = FrontierStats::default();
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            match UrlStatus::parse(&status) {
                Some(UrlStatus::Pending) => stats.pending = count,
                Some(UrlStatus::Fetching) => stats.fetching = count,
                Some(UrlStatus::Fetched) => stats.fetched = count,
                Some(UrlStatus::Failed) => stats.failed = count,
                Some(UrlStatus::Dead) => stats.dead = count,
                None => {}
            }
        }
        Ok(stats)
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM frontier_urls WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn cleanup_terminal(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM frontier_urls
            WHERE status IN ('fetched', 'dead')
              AND updated_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn recover_stale(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE frontier_urls
            SET status = 'pending', updated_at = NOW()
            WHERE status = 'fetching'
              AND updated_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

// ============================================================================
// HOSTS
// ============================================================================

pub struct PgHostStore {
    pool: PgPool,
}

impl PgHostStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_host_state(r: &sqlx::postgres::PgRow) -> HostState {
    HostState {
        host: r.get("host"),
        last_fetch_at: r.get("last_fetch_at"),
        min_delay_ms: r.get("min_delay_ms"),
        robots_txt: r.get("robots_txt"),
        robots_fetched_at: r.get("robots_fetched_at"),
        robots_ttl_hours: r.get("robots_ttl_hours"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}

#[async_trait]
impl HostStore for PgHostStore {
    async fn get_or_create(&self, host: &str) -> Result<HostState, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO host_states (host, min_delay_ms, robots_ttl_hours)
            VALUES ($1, $2, $3)
            ON CONFLICT (host) DO UPDATE SET updated_at = host_states.updated_at
            RETURNING host, last_fetch_at, min_delay_ms, robots_txt, robots_fetched_at,
                      robots_ttl_hours, created_at, updated_at
            "#,
        )
        .bind(host)
        .bind(DEFAULT_MIN_DELAY_MS)
        .bind(DEFAULT_ROBOTS_TTL_HOURS)
        .fetch_one(&self.pool)
        .await?;

        Ok(row_to_host_state(&row))
    }

    async fn update_last_fetch(&self, host: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO host_states (host, last_fetch_at)
            VALUES ($1, NOW())
            ON CONFLICT (host) DO UPDATE
            SET last_fetch_at = NOW(), updated_at = NOW()
            "#,
        )
        .bind(host)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_robots_txt(
        &self,
        host: &str,
        robots_txt: &str,
        crawl_delay_ms: Option<i32>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE host_states
            SET robots_txt = $2,
                robots_fetched_at = NOW(),
                min_delay_ms = GREATEST(min_delay_ms, COALESCE($3, 0)),
                updated_at = NOW()
            WHERE host = $1
            "#,
        )
        .bind(host)
        .bind(robots_txt)
        .bind(crawl_delay_ms)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Host rows are created lazily; a robots write for an unseen
            // host inserts the row.
            sqlx::query(
                r#"
                INSERT INTO host_states (host, robots_txt, robots_fetched_at, min_delay_ms)
                VALUES ($1, $2, NOW(), GREATEST($4, COALESCE($3, 0)))
                ON CONFLICT (host) DO UPDATE
                SET robots_txt = EXCLUDED.robots_txt,
                    robots_fetched_at = NOW(),
                    min_delay_ms = GREATEST(host_states.min_delay_ms, COALESCE($3, 0)),
                    updated_at = NOW()
                "#,
            )
            .bind(host)
            .bind(robots_txt)
            .bind(crawl_delay_ms)
            .bind(DEFAULT_MIN_DELAY_MS)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn update_min_delay(&self, host: &str, min_delay_ms: i32) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE host_states
            SET min_delay_ms = $2, updated_at = NOW()
            WHERE host = $1
            "#,
        )
        .bind(host)
        .bind(min_delay_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ============================================================================
// FEED STATE
// ============================================================================

pub struct PgFeedStateStore {
    pool: PgPool,
}

impl PgFeedStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_feed_state(r: &sqlx::postgres::PgRow) -> FeedState {
    FeedState {
        source_id: r.get("source_id"),
        feed_url: r.get("feed_url"),
        last_polled_at: r.get("last_polled_at"),
        last_etag: r.get("last_etag"),
        last_modified: r.get("last_modified"),
        last_item_count: r.get("last_item_count"),
        consecutive_errors: r.get("consecutive_errors"),
        last_error: r.get("last_error"),
        last_error_type: r.get("last_error_type"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}

#[async_trait]
impl FeedStateStore for PgFeedStateStore {
    async fn get_or_create(
        &self,
        source_id: Uuid,
        feed_url: &str,
    ) -> Result<FeedState, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO feed_states (source_id, feed_url)
            VALUES ($1, $2)
            ON CONFLICT (source_id) DO UPDATE SET feed_url = EXCLUDED.feed_url
            RETURNING source_id, feed_url, last_polled_at, last_etag, last_modified,
                      last_item_count, consecutive_errors, last_error, last_error_type,
                      created_at, updated_at
            "#,
        )
        .bind(source_id)
        .bind(feed_url)
        .fetch_one(&self.pool)
        .await?;

        Ok(row_to_feed_state(&row))
    }

    async fn update_success(
        &self,
        source_id: Uuid,
        etag: Option<&str>,
        last_modified: Option<&str>,
        item_count: i32,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE feed_states
            SET last_polled_at = NOW(),
                last_etag = $2,
                last_modified = $3,
                last_item_count = $4,
                consecutive_errors = 0,
                last_error = NULL,
                last_error_type = NULL,
                updated_at = NOW()
            WHERE source_id = $1
            "#,
        )
        .bind(source_id)
        .bind(etag)
        .bind(last_modified)
        .bind(item_count)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(source_id));
        }
        Ok(())
    }

    async fn update_error(
        &self,
        source_id: Uuid,
        error_type: &str,
        message: &str,
    ) -> Result<i32, StoreError> {
        let count: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE feed_states
            SET last_polled_at = NOW(),
                consecutive_errors = consecutive_errors + 1,
                last_error = $3,
                last_error_type = $2,
                updated_at = NOW()
            WHERE source_id = $1
            RETURNING consecutive_errors
            "#,
        )
        .bind(source_id)
        .bind(error_type)
        .bind(message)
        .fetch_optional(&self.pool)
        .await?;

        count.ok_or(StoreError::NotFound(source_id))
    }
}
