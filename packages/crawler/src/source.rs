//! Thin interface to the source catalog.
//!
//! Source CRUD lives elsewhere (admin import); the crawl domain only needs
//! the four capabilities below. The poller disables chronically broken
//! feeds and re-enables recovered ones; the discoverer fills in missing
//! feed URLs.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::StoreError;
use crate::types::Source;

#[async_trait]
pub trait SourceManager: Send + Sync {
    async fn get_source(&self, source_id: Uuid) -> Result<Source, StoreError>;

    /// Enabled sources that have no feed URL yet (discovery candidates).
    async fn list_undiscovered_sources(&self) -> Result<Vec<Source>, StoreError>;

    /// Persist a discovered feed URL.
    async fn update_feed_url(&self, source_id: Uuid, feed_url: &str) -> Result<(), StoreError>;

    /// Disable a source's feed, recording why.
    async fn disable_feed(&self, source_id: Uuid, reason: &str) -> Result<(), StoreError>;

    /// Re-enable a source's feed. No-op when already enabled.
    async fn enable_feed(&self, source_id: Uuid) -> Result<(), StoreError>;
}

pub struct PgSourceManager {
    pool: PgPool,
}

impl PgSourceManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_source(r: &sqlx::postgres::PgRow) -> Source {
        Source {
            source_id: r.get("source_id"),
            name: r.get("name"),
            base_url: r.get("base_url"),
            feed_url: r.get("feed_url"),
            enabled: r.get("enabled"),
            disabled_reason: r.get("disabled_reason"),
            interval_minutes: r.get("interval_minutes"),
            selectors: r.get("selectors"),
            created_at: r.get("created_at"),
            updated_at: r.get("updated_at"),
        }
    }
}

#[async_trait]
impl SourceManager for PgSourceManager {
    async fn get_source(&self, source_id: Uuid) -> Result<Source, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT source_id, name, base_url, feed_url, enabled, disabled_reason,
                   interval_minutes, selectors, created_at, updated_at
            FROM sources
            WHERE source_id = $1
            "#,
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound(source_id))?;

        Ok(Self::row_to_source(&row))
    }

    async fn list_undiscovered_sources(&self) -> Result<Vec<Source>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT source_id, name, base_url, feed_url, enabled, disabled_reason,
                   interval_minutes, selectors, created_at, updated_at
            FROM sources
            WHERE enabled = TRUE AND feed_url IS NULL
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(Self::row_to_source).collect())
    }

    async fn update_feed_url(&self, source_id: Uuid, feed_url: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sources
            SET feed_url = $2, updated_at = NOW()
            WHERE source_id = $1
            "#,
        )
        .bind(source_id)
        .bind(feed_url)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(source_id));
        }
        Ok(())
    }

    async fn disable_feed(&self, source_id: Uuid, reason: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sources
            SET enabled = FALSE, disabled_reason = $2, updated_at = NOW()
            WHERE source_id = $1
            "#,
        )
        .bind(source_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(source_id));
        }
        Ok(())
    }

    async fn enable_feed(&self, source_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sources
            SET enabled = TRUE, disabled_reason = NULL, updated_at = NOW()
            WHERE source_id = $1
            "#,
        )
        .bind(source_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(source_id));
        }
        Ok(())
    }
}

/// In-memory source manager for tests; records capability invocations.
pub mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct MemorySourceManager {
        sources: Mutex<HashMap<Uuid, Source>>,
        pub disable_calls: Mutex<Vec<(Uuid, String)>>,
        pub enable_calls: Mutex<Vec<Uuid>>,
        pub feed_url_updates: Mutex<Vec<(Uuid, String)>>,
    }

    impl MemorySourceManager {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, source: Source) {
            self.sources
                .lock()
                .unwrap()
                .insert(source.source_id, source);
        }

        pub fn get(&self, source_id: Uuid) -> Option<Source> {
            self.sources.lock().unwrap().get(&source_id).cloned()
        }
    }

    #[async_trait]
    impl SourceManager for MemorySourceManager {
        async fn get_source(&self, source_id: Uuid) -> Result<Source, StoreError> {
            self.get(source_id).ok_or(StoreError::NotFound(source_id))
        }

        async fn list_undiscovered_sources(&self) -> Result<Vec<Source>, StoreError> {
            Ok(self
                .sources
                .lock()
                .unwrap()
                .values()
                .filter(|s| s.enabled && s.feed_url.is_none())
                .cloned()
                .collect())
        }

        async fn update_feed_url(
            &self,
            source_id: Uuid,
            feed_url: &str,
        ) -> Result<(), StoreError> {
            let mut sources = self.sources.lock().unwrap();
            let source = sources
                .get_mut(&source_id)
                .ok_or(StoreError::NotFound(source_id))?;
            source.feed_url = Some(feed_url.to_string());
            self.feed_url_updates
                .lock()
                .unwrap()
                .push((source_id, feed_url.to_string()));
            Ok(())
        }

        async fn disable_feed(&self, source_id: Uuid, reason: &str) -> Result<(), StoreError> {
            let mut sources = self.sources.lock().unwrap();
            let source = sources
                .get_mut(&source_id)
                .ok_or(StoreError::NotFound(source_id))?;
            source.enabled = false;
            source.disabled_reason = Some(reason.to_string());
            self.disable_calls
                .lock()
                .unwrap()
                .push((source_id, reason.to_string()));
            Ok(())
        }

        async fn enable_feed(&self, source_id: Uuid) -> Result<(), StoreError> {
            let mut sources = self.sources.lock().unwrap();
            let source = sources
                .get_mut(&source_id)
                .ok_or(StoreError::NotFound(source_id))?;
            source.enabled = true;
            source.disabled_reason = None;
            self.enable_calls.lock().unwrap().push(source_id);
            Ok(())
        }
    }
}
