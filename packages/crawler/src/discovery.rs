//! Feed URL discovery for sources that were imported without one.
//!
//! Discovery scans the source's landing page for `<link rel="alternate">`
//! feed hints, then falls back to probing a fixed set of well-known paths.
//! Every candidate is validated by fetching and parsing it; the first one
//! that yields at least one item wins and is persisted on the source.
//! Attempts are memoized in-process so a broken source is not hammered on
//! every sweep.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use scraper::{Html, Selector};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::poller::FeedFetcher;
use crate::source::SourceManager;
use crate::types::Source;

/// Well-known feed locations probed when the landing page advertises none.
const COMMON_FEED_PATHS: &[&str] = &[
    "/feed",
    "/rss",
    "/feed.xml",
    "/rss.xml",
    "/atom.xml",
    "/index.xml",
];

#[derive(Debug, Clone)]
pub struct DiscovererConfig {
    /// Minimum wait between discovery attempts for the same source.
    pub retry_after: Duration,
    /// Sweep interval for the supervisor loop.
    pub sweep_interval: Duration,
}

impl Default for DiscovererConfig {
    fn default() -> Self {
        Self {
            retry_after: Duration::from_secs(6 * 60 * 60),
            sweep_interval: Duration::from_secs(15 * 60),
        }
    }
}

pub struct FeedDiscoverer {
    sources: Arc<dyn SourceManager>,
    fetcher: Arc<dyn FeedFetcher>,
    config: DiscovererConfig,
    attempted: Mutex<HashMap<Uuid, std::time::Instant>>,
}

impl FeedDiscoverer {
    pub fn new(
        sources: Arc<dyn SourceManager>,
        fetcher: Arc<dyn FeedFetcher>,
        config: DiscovererConfig,
    ) -> Self {
        Self {
            sources,
            fetcher,
            config,
            attempted: Mutex::new(HashMap::new()),
        }
    }

    /// One discovery sweep over all undiscovered sources.
    pub async fn run_once(&self) -> Result<usize> {
        let sources = self
            .sources
            .list_undiscovered_sources()
            .await
            .context("failed to list undiscovered sources")?;

        let mut discovered = 0;
        for source in sources {
            match self.discover_source(&source).await {
                Ok(Some(feed_url)) => {
                    tracing::info!(
                        source_id = %source.source_id,
                        feed_url = %feed_url,
                        "discovered feed URL"
                    );
                    discovered += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        source_id = %source.source_id,
                        base_url = %source.base_url,
                        error = %e,
                        "feed discovery failed"
                    );
                }
            }
        }
        Ok(discovered)
    }

    /// Supervisor loop: sweep on a fixed interval until cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            sweep_interval_secs = self.config.sweep_interval.as_secs(),
            "feed discoverer starting"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.sweep_interval) => {}
            }
            if shutdown.is_cancelled() {
                break;
            }
            if let Err(e) = self.run_once().await {
                tracing::error!(error = %e, "discovery sweep failed");
            }
        }
        tracing::info!("feed discoverer stopped");
    }

    /// Try to find and persist a feed URL for one source. Returns the URL
    /// when found, `None` when skipped (recent attempt) or nothing valid.
    pub async fn discover_source(&self, source: &Source) -> Result<Option<String>> {
        if !self.mark_attempt(source.source_id) {
            return Ok(None);
        }

        let base = Url::parse(&source.base_url)
            .with_context(|| format!("invalid base URL {}", source.base_url))?;

        // 1. Landing-page <link rel="alternate"> hints.
        let mut candidates = Vec::new();
        match self.fetcher.fetch(base.as_str(), None, None).await {
            Ok(response) if response.status == 200 => {
                let html = String::from_utf8_lossy(&response.body);
                candidates = extract_feed_links(&html, &base);
            }
            Ok(response) => {
                tracing::debug!(
                    source_id = %source.source_id,
                    status = response.status,
                    "landing page not fetchable, falling back to common paths"
                );
            }
            Err(e) => {
                tracing::debug!(
                    source_id = %source.source_id,
                    error = %e,
                    "landing page fetch failed, falling back to common paths"
                );
            }
        }

        // 2. Well-known paths.
        for path in COMMON_FEED_PATHS {
            if let Ok(probe) = base.join(path) {
                candidates.push(probe.to_string());
            }
        }

        for candidate in candidates {
            if self.validate_candidate(&candidate).await {
                self.sources
                    .update_feed_url(source.source_id, &candidate)
                    .await
                    .context("failed to persist discovered feed URL")?;
                return Ok(Some(candidate));
            }
        }

        Ok(None)
    }

    /// Record an attempt timestamp. Returns false when the source was tried
    /// within the retry window. The timestamp is recorded regardless of the
    /// eventual outcome.
    fn mark_attempt(&self, source_id: Uuid) -> bool {
        let mut attempted = self.attempted.lock().unwrap();
        let now = std::time::Instant::now();
        if let Some(last) = attempted.get(&source_id) {
            if now.duration_since(*last) < self.config.retry_after {
                return false;
            }
        }
        attempted.insert(source_id, now);
        true
    }

    /// A candidate is valid when it fetches with 200 and parses as a feed
    /// with at least one item.
    async fn validate_candidate(&self, url: &str) -> bool {
        match self.fetcher.fetch(url, None, None).await {
            Ok(response) if response.status == 200 => {
                match crate::feed::parse_feed(&response.body) {
                    Ok(parsed) => !parsed.items.is_empty(),
                    Err(_) => false,
                }
            }
            _ => false,
        }
    }
}

/// Collect feed URLs advertised by a landing page, resolved against the
/// base URL. Pure function: the non-`Send` DOM never crosses an await.
fn extract_feed_links(html: &str, base: &Url) -> Vec<String> {
    let document = Html::parse_document(html);
    let selector =
        Selector::parse(r#"link[rel="alternate"]"#).expect("static selector is valid");

    let mut links = Vec::new();
    for element in document.select(&selector) {
        let link_type = element.value().attr("type").unwrap_or("");
        if !(link_type.contains("rss+xml") || link_type.contains("atom+xml")) {
            continue;
        }
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        match base.join(href) {
            Ok(resolved) => links.push(resolved.to_string()),
            Err(e) => {
                tracing::debug!(href = %href, error = %e, "unresolvable feed link");
            }
        }
    }
    links
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::error::FetchError;
    use crate::poller::FeedResponse;
    use crate::source::testing::MemorySourceManager;

    const LANDING: &str = r#"<html><head>
        <link rel="alternate" type="application/rss+xml" href="/news/feed.rss">
        <link rel="alternate" type="text/html" href="/mobile">
        <link rel="stylesheet" href="/style.css">
    </head><body></body></html>"#;

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>T</title>
    <item><link>https://example.com/a</link><title>A</title></item>
</channel></rss>"#;

    const EMPTY_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>T</title></channel></rss>"#;

    /// Fetcher that answers by URL.
    #[derive(Default)]
    struct MapFetcher {
        responses: StdMutex<HashMap<String, FeedResponse>>,
        pub fetched: StdMutex<Vec<String>>,
    }

    impl MapFetcher {
        fn insert(&self, url: &str, status: u16, body: &str) {
            self.responses.lock().unwrap().insert(
                url.to_string(),
                FeedResponse {
                    status,
                    etag: None,
                    last_modified: None,
                    body: body.as_bytes().to_vec(),
                },
            );
        }
    }

    #[async_trait]
    impl FeedFetcher for MapFetcher {
        async fn fetch(
            &self,
            url: &str,
            _etag: Option<&str>,
            _last_modified: Option<&str>,
        ) -> Result<FeedResponse, FetchError> {
            self.fetched.lock().unwrap().push(url.to_string());
            self.responses
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .ok_or(FetchError::HttpStatus(404))
        }
    }

    fn source(base_url: &str) -> Source {
        let now = Utc::now();
        Source {
            source_id: Uuid::new_v4(),
            name: "Example".to_string(),
            base_url: base_url.to_string(),
            feed_url: None,
            enabled: true,
            disabled_reason: None,
            interval_minutes: 60,
            selectors: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    fn discoverer(
        sources: Arc<MemorySourceManager>,
        fetcher: Arc<MapFetcher>,
    ) -> FeedDiscoverer {
        FeedDiscoverer::new(
            sources,
            fetcher,
            DiscovererConfig {
                retry_after: Duration::from_secs(3600),
                sweep_interval: Duration::from_secs(60),
            },
        )
    }

    #[test]
    fn extracts_only_feed_alternates() {
        let base = Url::parse("https://example.com").unwrap();
        let links = extract_feed_links(LANDING, &base);
        assert_eq!(links, vec!["https://example.com/news/feed.rss"]);
    }

    #[tokio::test]
    async fn discovers_via_landing_page_hint() {
        let sources = Arc::new(MemorySourceManager::new());
        let fetcher = Arc::new(MapFetcher::default());
        let src = source("https://example.com");
        sources.insert(src.clone());

        fetcher.insert("https://example.com/", 200, LANDING);
        fetcher.insert("https://example.com/news/feed.rss", 200, VALID_RSS);

        let discoverer = discoverer(sources.clone(), fetcher);
        let found = discoverer.discover_source(&src).await.unwrap();
        assert_eq!(found.as_deref(), Some("https://example.com/news/feed.rss"));
        assert_eq!(
            sources.get(src.source_id).unwrap().feed_url.as_deref(),
            Some("https://example.com/news/feed.rss")
        );
    }

    #[tokio::test]
    async fn falls_back_to_common_paths() {
        let sources = Arc::new(MemorySourceManager::new());
        let fetcher = Arc::new(MapFetcher::default());
        let src = source("https://example.com");
        sources.insert(src.clone());

        // No landing page, /feed is empty, /rss.xml is valid.
        fetcher.insert("https://example.com/feed", 200, EMPTY_RSS);
        fetcher.insert("https://example.com/rss.xml", 200, VALID_RSS);

        let discoverer = discoverer(sources.clone(), fetcher);
        let found = discoverer.discover_source(&src).await.unwrap();
        assert_eq!(found.as_deref(), Some("https://example.com/rss.xml"));
    }

    #[tokio::test]
    async fn candidates_with_no_items_are_rejected() {
        let sources = Arc::new(MemorySourceManager::new());
        let fetcher = Arc::new(MapFetcher::default());
        let src = source("https://example.com");
        sources.insert(src.clone());

        fetcher.insert("https://example.com/feed", 200, EMPTY_RSS);

        let discoverer = discoverer(sources.clone(), fetcher);
        let found = discoverer.discover_source(&src).await.unwrap();
        assert_eq!(found, None);
        assert!(sources.get(src.source_id).unwrap().feed_url.is_none());
    }

    #[tokio::test]
    async fn recent_attempts_are_skipped() {
        let sources = Arc::new(MemorySourceManager::new());
        let fetcher = Arc::new(MapFetcher::default());
        let src = source("https://example.com");
        sources.insert(src.clone());
        fetcher.insert("https://example.com/feed", 200, VALID_RSS);

        let discoverer = discoverer(sources.clone(), fetcher.clone());
        let first = discoverer.discover_source(&src).await.unwrap();
        assert!(first.is_some());

        let fetches_after_first = fetcher.fetched.lock().unwrap().len();
        let second = discoverer.discover_source(&src).await.unwrap();
        assert_eq!(second, None);
        assert_eq!(fetcher.fetched.lock().unwrap().len(), fetches_after_first);
    }
}
