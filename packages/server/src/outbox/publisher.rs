//! Outbox publisher worker.
//!
//! Polls the outbox, routes each claimed entry to a bus channel, publishes
//! a JSON envelope with a bounded timeout, and drives the row to
//! `published` or `failed`. Two sidecar sweeps run alongside the poll
//! loop: recovery (stale `publishing` rows back to `pending`) and cleanup
//! (old `published` rows deleted).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::kernel::bus::BusPublisher;
use crate::kernel::metrics::Metrics;
use crate::kernel::service_host::Service;

use super::store::{OutboxEntry, OutboxStore};

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// How often to poll for publishable entries.
    pub poll_interval: Duration,
    /// Maximum entries claimed per poll (retry claims take half this).
    pub batch_size: i64,
    /// Per-publish timeout against the bus.
    pub publish_timeout: Duration,
    /// Age at which a `publishing` claim is considered abandoned.
    pub stale_publishing_age: Duration,
    /// How often the recovery sweep runs.
    pub recovery_interval: Duration,
    /// Retention for published rows.
    pub retention: Duration,
    /// How often the cleanup sweep runs.
    pub cleanup_interval: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 100,
            publish_timeout: Duration::from_secs(10),
            stale_publishing_age: Duration::from_secs(5 * 60),
            recovery_interval: Duration::from_secs(60),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Channel an entry is published on.
///
/// Crime-related content routes to the crime hierarchy; everything else by
/// content type.
pub fn routing_key(entry: &OutboxEntry) -> String {
    if entry.is_crime_related {
        return match entry.crime_subcategory.as_deref() {
            Some(subcategory) if !subcategory.is_empty() => {
                format!("articles:crime:{subcategory}")
            }
            _ => "articles:crime".to_string(),
        };
    }
    match entry.content_type.as_str() {
        "article" => "articles:news".to_string(),
        "video" => "content:video".to_string(),
        "image" => "content:image".to_string(),
        _ => "content:other".to_string(),
    }
}

/// The JSON envelope consumers receive. They de-duplicate by `id`.
pub fn envelope(
    entry: &OutboxEntry,
    channel: &str,
    published_at: DateTime<Utc>,
) -> serde_json::Value {
    serde_json::json!({
        "id": entry.content_id,
        "source": entry.source_name,
        "index": entry.index_name,
        "content_type": entry.content_type,
        "topics": entry.topics,
        "quality_score": entry.quality_score,
        "is_crime_related": entry.is_crime_related,
        "crime_subcategory": entry.crime_subcategory,
        "title": entry.title,
        "body": entry.body,
        "url": entry.url,
        "published_date": entry.published_date,
        "publisher": {
            "outbox_id": entry.id,
            "published_at": published_at,
            "channel": channel,
        },
    })
}

pub struct OutboxPublisher {
    store: Arc<dyn OutboxStore>,
    bus: Arc<dyn BusPublisher>,
    metrics: Arc<Metrics>,
    config: PublisherConfig,
}

impl OutboxPublisher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        bus: Arc<dyn BusPublisher>,
        metrics: Arc<Metrics>,
        config: PublisherConfig,
    ) -> Self {
        Self {
            store,
            bus,
            metrics,
            config,
        }
    }

    /// One poll tick: claim pending plus retryable entries and publish
    /// them. Returns how many were published.
    pub async fn tick_once(&self) -> Result<usize> {
        let mut batch = self.store.fetch_pending(self.config.batch_size).await?;
        let retryable = self
            .store
            .fetch_retryable((self.config.batch_size / 2).max(1))
            .await?;
        batch.extend(retryable);

        if batch.is_empty() {
            return Ok(0);
        }
        tracing::debug!(count = batch.len(), "claimed outbox entries");

        let mut published = 0;
        for entry in batch {
            if self.publish_entry(&entry).await {
                published += 1;
            }
        }
        Ok(published)
    }

    async fn publish_entry(&self, entry: &OutboxEntry) -> bool {
        let channel = routing_key(entry);
        let now = Utc::now();
        let payload = match serde_json::to_vec(&envelope(entry, &channel, now)) {
            Ok(payload) => payload,
            Err(e) => {
                // Serialization cannot be retried into success.
                tracing::error!(content_id = %entry.content_id, error = %e, "envelope serialization failed");
                self.record_failure(entry, &format!("serialization failed: {e}"))
                    .await;
                return false;
            }
        };

        let timer = self.metrics.publish_duration_seconds.start_timer();
        let result = tokio::time::timeout(
            self.config.publish_timeout,
            self.bus.publish(channel.clone(), Bytes::from(payload)),
        )
        .await;
        timer.observe_duration();

        match result {
            Ok(Ok(())) => {
                if let Err(e) = self.store.mark_published(entry.id).await {
                    tracing::error!(content_id = %entry.content_id, error = %e, "failed to mark published");
                    return false;
                }
                self.metrics.outbox_published_total.inc();
                tracing::debug!(content_id = %entry.content_id, channel = %channel, "published");
                true
            }
            Ok(Err(e)) => {
                self.record_failure(entry, &e.to_string()).await;
                false
            }
            Err(_) => {
                self.record_failure(entry, "publish timed out").await;
                false
            }
        }
    }

    async fn record_failure(&self, entry: &OutboxEntry, error: &str) {
        self.metrics.outbox_failed_total.inc();
        tracing::warn!(
            content_id = %entry.content_id,
            retry_count = entry.retry_count,
            error = %error,
            "outbox publish failed"
        );
        if let Err(e) = self.store.mark_failed(entry.id, error).await {
            tracing::error!(content_id = %entry.content_id, error = %e, "failed to mark failed");
        }
    }

    /// Recovery sweep: reclaim `publishing` rows left by crashed workers.
    pub async fn recover_once(&self) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.stale_publishing_age)
                .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let recovered = self.store.recover_stale(cutoff).await?;
        if recovered > 0 {
            self.metrics.outbox_recovered_total.inc_by(recovered);
            tracing::warn!(recovered, "recovered stale publishing entries");
        }
        Ok(recovered)
    }

    /// Cleanup sweep: drop published rows past retention.
    pub async fn cleanup_once(&self) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.retention)
                .unwrap_or_else(|_| chrono::Duration::days(7));
        let deleted = self.store.cleanup_published(cutoff).await?;
        if deleted > 0 {
            tracing::info!(deleted, "cleaned up published outbox entries");
        }
        Ok(deleted)
    }
}

#[async_trait::async_trait]
impl Service for OutboxPublisher {
    fn name(&self) -> &'static str {
        "outbox-publisher"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            "outbox publisher starting"
        );

        let mut poll = tokio::time::interval(self.config.poll_interval);
        let mut recovery = tokio::time::interval(self.config.recovery_interval);
        let mut cleanup = tokio::time::interval(self.config.cleanup_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        recovery.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = poll.tick() => {
                    if let Err(e) = self.tick_once().await {
                        tracing::error!(error = %e, "outbox poll tick failed");
                    }
                }
                _ = recovery.tick() => {
                    if let Err(e) = self.recover_once().await {
                        tracing::error!(error = %e, "outbox recovery sweep failed");
                    }
                }
                _ = cleanup.tick() => {
                    if let Err(e) = self.cleanup_once().await {
                        tracing::error!(error = %e, "outbox cleanup sweep failed");
                    }
                }
            }
        }
        tracing::info!("outbox publisher stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::kernel::bus::TestBus;
    use crate::outbox::store::testing::MemoryOutboxStore;
    use crate::outbox::store::{NewOutboxEntry, OutboxStatus};

    use super::*;

    fn entry(content_id: &str) -> NewOutboxEntry {
        NewOutboxEntry {
            content_id: content_id.to_string(),
            source_name: "example-news".to_string(),
            index_name: "example-news_classified_content".to_string(),
            content_type: "article".to_string(),
            topics: vec!["local".to_string()],
            quality_score: 82.5,
            is_crime_related: false,
            crime_subcategory: None,
            title: "A headline".to_string(),
            body: "Body text".to_string(),
            url: "https://example.com/story".to_string(),
            published_date: None,
        }
    }

    fn crime_entry(content_id: &str, subcategory: Option<&str>) -> NewOutboxEntry {
        NewOutboxEntry {
            is_crime_related: true,
            crime_subcategory: subcategory.map(str::to_string),
            ..entry(content_id)
        }
    }

    struct Fixture {
        store: Arc<MemoryOutboxStore>,
        bus: Arc<TestBus>,
        publisher: OutboxPublisher,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryOutboxStore::new());
        let bus = Arc::new(TestBus::new());
        let publisher = OutboxPublisher::new(
            store.clone(),
            bus.clone(),
            Arc::new(Metrics::new().unwrap()),
            PublisherConfig::default(),
        );
        Fixture {
            store,
            bus,
            publisher,
        }
    }

    #[tokio::test]
    async fn routing_grammar() {
        let realize = |content_type: String, crime: bool, sub: Option<String>| async move {
            let store = MemoryOutboxStore::new();
            let mut e = entry("x");
            e.content_type = content_type;
            e.is_crime_related = crime;
            e.crime_subcategory = sub;
            store.insert(e).await.unwrap();
            store.fetch_pending(1).await.unwrap().remove(0)
        };

        assert_eq!(
            routing_key(&realize("article".to_string(), true, Some("violent_crime".to_string())).await),
            "articles:crime:violent_crime"
        );
        assert_eq!(
            routing_key(&realize("article".to_string(), true, None).await),
            "articles:crime"
        );
        assert_eq!(
            routing_key(&realize("article".to_string(), false, None).await),
            "articles:news"
        );
        assert_eq!(
            routing_key(&realize("video".to_string(), false, None).await),
            "content:video"
        );
        assert_eq!(
            routing_key(&realize("image".to_string(), false, None).await),
            "content:image"
        );
        assert_eq!(
            routing_key(&realize("podcast".to_string(), false, None).await),
            "content:other"
        );
    }

    #[tokio::test]
    async fn publishes_crime_entry_end_to_end() {
        let f = fixture();
        f.store
            .insert(crime_entry("content-1", Some("violent_crime")))
            .await
            .unwrap();

        let published = f.publisher.tick_once().await.unwrap();
        assert_eq!(published, 1);

        let messages = f.bus.messages_for_subject("articles:crime:violent_crime");
        assert_eq!(messages.len(), 1);

        let envelope: serde_json::Value = serde_json::from_slice(&messages[0].payload).unwrap();
        assert_eq!(envelope["id"], "content-1");
        assert_eq!(envelope["source"], "example-news");
        assert_eq!(envelope["is_crime_related"], true);
        assert_eq!(envelope["crime_subcategory"], "violent_crime");
        assert_eq!(envelope["publisher"]["channel"], "articles:crime:violent_crime");
        assert!(envelope["publisher"]["outbox_id"].is_string());

        let row = f.store.get_by_content_id("content-1").unwrap();
        assert_eq!(row.status, OutboxStatus::Published);
        assert!(row.published_at.is_some());
    }

    #[tokio::test]
    async fn insert_is_idempotent_by_content_id() {
        let f = fixture();
        f.store.insert(entry("content-1")).await.unwrap();
        f.store.insert(entry("content-1")).await.unwrap();
        assert_eq!(f.store.len(), 1);
    }

    #[tokio::test]
    async fn crime_entries_are_claimed_first() {
        let f = fixture();
        f.store.insert(entry("ordinary")).await.unwrap();
        f.store.insert(crime_entry("urgent", None)).await.unwrap();

        let claimed = f.store.fetch_pending(1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].content_id, "urgent");
    }

    #[tokio::test]
    async fn failed_publish_backs_off_then_retries() {
        let f = fixture();
        f.store.insert(entry("content-1")).await.unwrap();

        f.bus.fail_publishes("bus down");
        let published = f.publisher.tick_once().await.unwrap();
        assert_eq!(published, 0);

        let row = f.store.get_by_content_id("content-1").unwrap();
        assert_eq!(row.status, OutboxStatus::Failed);
        assert_eq!(row.retry_count, 1);
        assert!(row.next_retry_at.unwrap() > Utc::now());
        assert!(row.error_message.as_deref().unwrap().contains("bus down"));

        // Backoff has not elapsed: nothing is retryable yet.
        f.bus.heal();
        assert_eq!(f.publisher.tick_once().await.unwrap(), 0);

        // Simulate the backoff having elapsed.
        f.store.force_publishing("content-1", Utc::now());
        f.store.mark_failed(row.id, "still down").await.unwrap();
        let retried = f.store.fetch_retryable(10).await.unwrap();
        assert!(retried.is_empty());
    }

    #[tokio::test]
    async fn crash_recovery_returns_stale_claims_to_pending() {
        let f = fixture();
        f.store.insert(entry("content-1")).await.unwrap();
        // A worker claimed it ten minutes ago and died.
        f.store
            .force_publishing("content-1", Utc::now() - chrono::Duration::minutes(10));

        let recovered = f.publisher.recover_once().await.unwrap();
        assert_eq!(recovered, 1);
        assert_eq!(
            f.store.get_by_content_id("content-1").unwrap().status,
            OutboxStatus::Pending
        );

        // The next poll publishes it.
        let published = f.publisher.tick_once().await.unwrap();
        assert_eq!(published, 1);
        assert_eq!(
            f.store.get_by_content_id("content-1").unwrap().status,
            OutboxStatus::Published
        );
    }

    #[tokio::test]
    async fn recovery_does_not_resurrect_published_rows() {
        let f = fixture();
        f.store.insert(entry("content-1")).await.unwrap();
        f.publisher.tick_once().await.unwrap();

        let recovered = f.publisher.recover_once().await.unwrap();
        assert_eq!(recovered, 0);
        assert_eq!(
            f.store.get_by_content_id("content-1").unwrap().status,
            OutboxStatus::Published
        );
    }

    #[tokio::test]
    async fn cleanup_drops_only_old_published_rows() {
        let f = fixture();
        f.store.insert(entry("old")).await.unwrap();
        f.store.insert(entry("pending")).await.unwrap();

        // Publish "old" only.
        let claimed = f.store.fetch_pending(10).await.unwrap();
        for row in claimed {
            if row.content_id == "old" {
                f.store.mark_published(row.id).await.unwrap();
            } else {
                // Return the other claim so it stays pending.
                f.store
                    .force_publishing(&row.content_id, Utc::now() - chrono::Duration::hours(1));
            }
        }
        f.publisher.recover_once().await.unwrap();

        // Nothing is old enough yet.
        assert_eq!(f.publisher.cleanup_once().await.unwrap(), 0);
        assert_eq!(f.store.len(), 2);
    }
}
