//! Handoff of fetched documents to the external classifier service.
//!
//! The classifier is a separate process; it consumes raw documents from the
//! bus, classifies them, and writes its index document plus the outbox row
//! in one transaction. This side only publishes the raw document envelope.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use crawler::{DocumentClassifier, FetchedDocument};
use std::sync::Arc;

use crate::kernel::bus::BusPublisher;

/// Subject prefix raw documents are published under; the source name is the
/// suffix, matching the `{source}_raw_content` index convention.
const RAW_CONTENT_SUBJECT: &str = "content:raw";

pub struct BusClassifierHandoff {
    bus: Arc<dyn BusPublisher>,
}

impl BusClassifierHandoff {
    pub fn new(bus: Arc<dyn BusPublisher>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl DocumentClassifier for BusClassifierHandoff {
    async fn classify(&self, document: FetchedDocument) -> Result<()> {
        let payload = serde_json::json!({
            "frontier_id": document.frontier_id,
            "source_id": document.source_id,
            "url": document.url,
            "final_url": document.final_url,
            "origin": document.origin,
            "content_hash": document.content_hash,
            "fetched_at": document.fetched_at,
            "body": String::from_utf8_lossy(&document.body),
        });
        let bytes = serde_json::to_vec(&payload).context("failed to serialize raw document")?;

        self.bus
            .publish(
                format!("{RAW_CONTENT_SUBJECT}:{}", document.source_id),
                Bytes::from(bytes),
            )
            .await
            .context("failed to hand document to classifier")
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use crawler::UrlOrigin;
    use uuid::Uuid;

    use crate::kernel::bus::TestBus;

    use super::*;

    #[tokio::test]
    async fn publishes_raw_document_for_the_source() {
        let bus = Arc::new(TestBus::new());
        let handoff = BusClassifierHandoff::new(bus.clone());
        let source_id = Uuid::new_v4();

        handoff
            .classify(FetchedDocument {
                frontier_id: Uuid::new_v4(),
                source_id,
                url: "https://example.com/story".to_string(),
                final_url: "https://example.com/story".to_string(),
                origin: UrlOrigin::Feed,
                content_hash: "abc".to_string(),
                body: b"<html>story</html>".to_vec(),
                fetched_at: Utc::now(),
            })
            .await
            .unwrap();

        let subject = format!("content:raw:{source_id}");
        let messages = bus.messages_for_subject(&subject);
        assert_eq!(messages.len(), 1);
        let value: serde_json::Value = serde_json::from_slice(&messages[0].payload).unwrap();
        assert_eq!(value["url"], "https://example.com/story");
        assert_eq!(value["content_hash"], "abc");
    }
}
