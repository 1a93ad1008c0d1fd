//! Pub/sub bus abstraction for production and testing.
//!
//! Provides a trait-based publisher that allows swapping between a real
//! NATS connection and a test mock that records published messages.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::RwLock;

/// A published message.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub subject: String,
    pub payload: Bytes,
}

/// Trait for bus publish operations.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    /// Publish a message to a subject.
    async fn publish(&self, subject: String, payload: Bytes) -> Result<()>;
}

/// Real NATS client publisher.
pub struct NatsBusPublisher {
    client: async_nats::Client,
}

impl NatsBusPublisher {
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url).await?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl BusPublisher for NatsBusPublisher {
    async fn publish(&self, subject: String, payload: Bytes) -> Result<()> {
        self.client.publish(subject, payload).await?;
        Ok(())
    }
}

/// Mock bus that tracks published messages for testing.
#[derive(Default)]
pub struct TestBus {
    published: RwLock<Vec<PublishedMessage>>,
    /// When set, every publish fails with this message.
    fail_with: RwLock<Option<String>>,
}

impl TestBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent publishes fail.
    pub fn fail_publishes(&self, message: &str) {
        *self.fail_with.write().unwrap_or_else(|e| e.into_inner()) = Some(message.to_string());
    }

    /// Restore normal publishing.
    pub fn heal(&self) {
        *self.fail_with.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Get all published messages.
    pub fn published_messages(&self) -> Vec<PublishedMessage> {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Get published messages for a specific subject.
    pub fn messages_for_subject(&self, subject: &str) -> Vec<PublishedMessage> {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|m| m.subject == subject)
            .cloned()
            .collect()
    }

    /// Check if any message was published to a subject.
    pub fn was_published_to(&self, subject: &str) -> bool {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|m| m.subject == subject)
    }
}

#[async_trait]
impl BusPublisher for TestBus {
    async fn publish(&self, subject: String, payload: Bytes) -> Result<()> {
        if let Some(message) = self
            .fail_with
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            anyhow::bail!("{message}");
        }
        self.published
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(PublishedMessage { subject, payload });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bus_records_and_filters() {
        let bus = TestBus::new();
        bus.publish("articles:news".to_string(), Bytes::from_static(b"a"))
            .await
            .unwrap();
        bus.publish("articles:crime".to_string(), Bytes::from_static(b"b"))
            .await
            .unwrap();

        assert_eq!(bus.published_messages().len(), 2);
        assert_eq!(bus.messages_for_subject("articles:news").len(), 1);
        assert!(bus.was_published_to("articles:crime"));
        assert!(!bus.was_published_to("content:video"));
    }

    #[tokio::test]
    async fn test_bus_failure_injection() {
        let bus = TestBus::new();
        bus.fail_publishes("bus down");
        assert!(bus
            .publish("articles:news".to_string(), Bytes::from_static(b"a"))
            .await
            .is_err());
        bus.heal();
        assert!(bus
            .publish("articles:news".to_string(), Bytes::from_static(b"a"))
            .await
            .is_ok());
    }
}
