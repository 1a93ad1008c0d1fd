//! Storage traits for the crawl domain.
//!
//! Workers and the poller depend on these traits, never on a concrete
//! backend. Production uses the Postgres implementations in [`postgres`];
//! tests use the in-memory implementations in [`memory`], which mirror the
//! SQL semantics (including claim disjointness and conflict-merge rules).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::types::{
    FeedState, FetchOutcome, FrontierFilter, FrontierStats, FrontierUrl, HostState, UrlSubmission,
};

pub mod memory;
pub mod postgres;

pub use postgres::{PgFeedStateStore, PgFrontierStore, PgHostStore};

/// Durable, deduplicated priority queue of URLs awaiting fetch.
#[async_trait]
pub trait FrontierStore: Send + Sync {
    /// Upsert by `url_hash`. On conflict with a pending row, merge: keep the
    /// higher priority and the earlier `next_fetch_at`. Conflicts with
    /// non-pending rows are a no-op; terminal rows are never revived.
    async fn submit(&self, submission: UrlSubmission) -> Result<(), StoreError>;

    /// Atomically select and reserve the highest-value fetchable URL, moving
    /// it to `fetching`. Respects per-host politeness. Concurrent callers
    /// receive disjoint rows.
    async fn claim(&self) -> Result<Option<FrontierUrl>, StoreError>;

    /// `fetching -> fetched`: stamp fetch metadata and reset retries.
    async fn update_fetched(&self, id: Uuid, outcome: FetchOutcome) -> Result<(), StoreError>;

    /// Like [`FrontierStore::update_fetched`], but a redirect landed on a
    /// different canonical URL: also rewrite `url`/`url_hash`/`host`. When
    /// the new hash collides with another row, fall back to the plain
    /// fetched update. This is the only path that mutates `url_hash`.
    async fn update_fetched_with_final_url(
        &self,
        id: Uuid,
        final_url: &str,
        final_url_hash: &str,
        final_host: &str,
        outcome: FetchOutcome,
    ) -> Result<(), StoreError>;

    /// Record a failed attempt: bump `retry_count`; the row goes `dead` at
    /// `max_retries`, otherwise back to `pending` with exponential backoff.
    async fn update_failed(
        &self,
        id: Uuid,
        error: &str,
        max_retries: i32,
    ) -> Result<(), StoreError>;

    /// Immediate terminal transition (robots-disallowed, permanent 4xx).
    async fn update_dead(&self, id: Uuid, reason: &str) -> Result<(), StoreError>;

    /// Administrative resurrection: `dead -> pending` with cleared counters.
    /// Fails with `WrongState` if the row is not dead.
    async fn reset_for_retry(&self, id: Uuid) -> Result<(), StoreError>;

    async fn list(
        &self,
        filter: FrontierFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FrontierUrl>, StoreError>;

    async fn stats(&self) -> Result<FrontierStats, StoreError>;

    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;

    /// Remove terminal rows (`fetched`, `dead`) older than the cutoff.
    /// Returns the number deleted.
    async fn cleanup_terminal(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Return `fetching` rows whose claim predates the cutoff to `pending`
    /// (the claim holder presumably crashed). Returns the number recovered.
    async fn recover_stale(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Per-host politeness registry.
#[async_trait]
pub trait HostStore: Send + Sync {
    /// Fetch the host row, inserting defaults on first sight.
    async fn get_or_create(&self, host: &str) -> Result<HostState, StoreError>;

    /// Stamp `last_fetch_at = now`. Called after every attempt against the
    /// host; this is what makes the claim query respect politeness.
    async fn update_last_fetch(&self, host: &str) -> Result<(), StoreError>;

    /// Cache a robots.txt document. When the server advertised a crawl
    /// delay, raise `min_delay_ms` to the greater of current and advertised.
    async fn update_robots_txt(
        &self,
        host: &str,
        robots_txt: &str,
        crawl_delay_ms: Option<i32>,
    ) -> Result<(), StoreError>;

    /// Set the politeness delay directly (fetcher adaptation after 429/503).
    async fn update_min_delay(&self, host: &str, min_delay_ms: i32) -> Result<(), StoreError>;
}

/// Per-source feed polling metadata.
#[async_trait]
pub trait FeedStateStore: Send + Sync {
    async fn get_or_create(&self, source_id: Uuid, feed_url: &str)
        -> Result<FeedState, StoreError>;

    /// Record a successful poll: new validators, item count, and a reset of
    /// `consecutive_errors`.
    async fn update_success(
        &self,
        source_id: Uuid,
        etag: Option<&str>,
        last_modified: Option<&str>,
        item_count: i32,
    ) -> Result<(), StoreError>;

    /// Record a failed poll. Returns the new consecutive-error count.
    async fn update_error(
        &self,
        source_id: Uuid,
        error_type: &str,
        message: &str,
    ) -> Result<i32, StoreError>;
}
