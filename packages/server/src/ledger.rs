//! Processed-event ledger: an append-only idempotency set.
//!
//! Event consumers (source imports, admin commands) record external event
//! IDs here; a second delivery of the same event is detected and dropped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crawler::StoreError;
use sqlx::{PgPool, Row};

#[derive(Debug, Clone)]
pub struct ProcessedEvent {
    pub event_id: String,
    pub processed_at: DateTime<Utc>,
}

#[async_trait]
pub trait ProcessedEventStore: Send + Sync {
    /// Record an event. Idempotent: recording twice leaves one row.
    async fn record_processed_event(&self, event_id: &str) -> Result<(), StoreError>;

    async fn is_event_processed(&self, event_id: &str) -> Result<bool, StoreError>;
}

pub struct PgProcessedEventStore {
    pool: PgPool,
}

impl PgProcessedEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProcessedEventStore for PgProcessedEventStore {
    async fn record_processed_event(&self, event_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO processed_events (event_id)
            VALUES ($1)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_event_processed(&self, event_id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 AS one FROM processed_events WHERE event_id = $1")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i32, _>("one")).is_some())
    }
}

pub mod testing {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct MemoryProcessedEventStore {
        events: Mutex<HashSet<String>>,
    }

    impl MemoryProcessedEventStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn len(&self) -> usize {
            self.events.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ProcessedEventStore for MemoryProcessedEventStore {
        async fn record_processed_event(&self, event_id: &str) -> Result<(), StoreError> {
            self.events.lock().unwrap().insert(event_id.to_string());
            Ok(())
        }

        async fn is_event_processed(&self, event_id: &str) -> Result<bool, StoreError> {
            Ok(self.events.lock().unwrap().contains(event_id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryProcessedEventStore;
    use super::*;

    #[tokio::test]
    async fn recording_twice_leaves_one_row() {
        let store = MemoryProcessedEventStore::new();
        assert!(!store.is_event_processed("evt-1").await.unwrap());

        store.record_processed_event("evt-1").await.unwrap();
        store.record_processed_event("evt-1").await.unwrap();

        assert!(store.is_event_processed("evt-1").await.unwrap());
        assert_eq!(store.len(), 1);
        assert!(!store.is_event_processed("evt-2").await.unwrap());
    }
}
