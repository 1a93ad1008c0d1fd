//! Crawl domain: URL frontier, host politeness, feed polling and discovery,
//! sitemap ingestion, and the fetch worker that feeds the classifier.
//!
//! Everything coordinates through the relational database; the traits in
//! [`storage`] are the only seam between the domain logic and Postgres.

pub mod discovery;
pub mod error;
pub mod feed;
pub mod fetch;
pub mod normalize;
pub mod poller;
pub mod queue;
pub mod robots;
pub mod sitemap;
pub mod source;
pub mod storage;
pub mod types;

pub use discovery::{DiscovererConfig, FeedDiscoverer};
pub use error::{FetchError, PollError, StoreError};
pub use fetch::{
    DocumentClassifier, FetchWorker, FetchWorkerConfig, FetchedDocument, PageFetcher,
    ReqwestPageFetcher,
};
pub use normalize::{hash_content, hash_url, normalize_url, NormalizedUrl};
pub use poller::{FeedFetcher, FeedPoller, PollOutcome, ReqwestFeedFetcher};
pub use robots::RobotsRules;
pub use sitemap::SitemapIngestor;
pub use source::{PgSourceManager, SourceManager};
pub use storage::{
    FeedStateStore, FrontierStore, HostStore, PgFeedStateStore, PgFrontierStore, PgHostStore,
};
pub use types::*;
