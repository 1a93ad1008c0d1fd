//! Process composition for the content ingestion pipeline: configuration,
//! service supervision, the scheduler, the outbox publisher, the DLQ
//! worker, and the operational HTTP surface. The crawl domain itself lives
//! in the `crawler` crate.

pub mod config;
pub mod dlq;
pub mod kernel;
pub mod ledger;
pub mod outbox;
pub mod server;

pub use config::Config;
