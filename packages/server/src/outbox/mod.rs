pub mod publisher;
pub mod store;

pub use publisher::{envelope, routing_key, OutboxPublisher, PublisherConfig};
pub use store::{NewOutboxEntry, OutboxBacklog, OutboxEntry, OutboxStatus, OutboxStore, PgOutboxStore};
