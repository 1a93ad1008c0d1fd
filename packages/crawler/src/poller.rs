//! Feed polling: conditional GET, parse, classify, submit, auto-disable.
//!
//! One poll is one conditional HTTP GET against a source's feed URL. A 304
//! costs nothing and changes nothing. A 200 submits every usable item to
//! the frontier and rewrites the source's validators. Failures are
//! classified and counted; kinds with a configured threshold disable the
//! feed once the consecutive-error streak reaches it, and any successful
//! poll re-enables the source.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{FetchError, PollError};
use crate::feed::parse_feed;
use crate::normalize::normalize_url;
use crate::source::SourceManager;
use crate::storage::{FeedStateStore, FrontierStore};
use crate::types::{
    FeedErrorKind, UrlOrigin, UrlSubmission, DEFAULT_PRIORITY, FEED_PRIORITY_BONUS,
};

const FEED_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_FEED_SIZE: usize = 10 * 1024 * 1024;

/// Raw HTTP result of a feed fetch. Non-2xx statuses are data here, not
/// errors; the poller classifies them.
#[derive(Debug, Clone)]
pub struct FeedResponse {
    pub status: u16,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub body: Vec<u8>,
}

/// HTTP access for the poller, mockable in tests.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<FeedResponse, FetchError>;
}

/// `reqwest`-backed fetcher issuing conditional GETs.
pub struct ReqwestFeedFetcher {
    client: reqwest::Client,
}

impl ReqwestFeedFetcher {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(FEED_FETCH_TIMEOUT)
            .build()
            .context("failed to build feed HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FeedFetcher for ReqwestFeedFetcher {
    async fn fetch(
        &self,
        url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<FeedResponse, FetchError> {
        let mut request = self.client.get(url);
        if let Some(etag) = etag {
            request = request.header(reqwest::header::IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = last_modified {
            request = request.header(reqwest::header::IF_MODIFIED_SINCE, last_modified);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Network(e)
            }
        })?;

        let status = response.status().as_u16();
        let header = |name: reqwest::header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let etag = header(reqwest::header::ETAG);
        let last_modified = header(reqwest::header::LAST_MODIFIED);

        if let Some(len) = response.content_length() {
            if len as usize > MAX_FEED_SIZE {
                return Err(FetchError::ResponseTooLarge(MAX_FEED_SIZE));
            }
        }

        let body = response.bytes().await.map_err(FetchError::Network)?;
        if body.len() > MAX_FEED_SIZE {
            return Err(FetchError::ResponseTooLarge(MAX_FEED_SIZE));
        }

        Ok(FeedResponse {
            status,
            etag,
            last_modified,
            body: body.to_vec(),
        })
    }
}

/// Result of one poll. `Err` from [`FeedPoller::poll_feed`] means a storage
/// fault; upstream failures land here as `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    NotModified,
    Success { submitted: usize, skipped: usize },
    Failed { kind: FeedErrorKind },
}

pub struct FeedPoller {
    frontier: Arc<dyn FrontierStore>,
    feed_states: Arc<dyn FeedStateStore>,
    sources: Arc<dyn SourceManager>,
    fetcher: Arc<dyn FeedFetcher>,
}

impl FeedPoller {
    pub fn new(
        frontier: Arc<dyn FrontierStore>,
        feed_states: Arc<dyn FeedStateStore>,
        sources: Arc<dyn SourceManager>,
        fetcher: Arc<dyn FeedFetcher>,
    ) -> Self {
        Self {
            frontier,
            feed_states,
            sources,
            fetcher,
        }
    }

    pub async fn poll_feed(&self, source_id: Uuid, feed_url: &str) -> Result<PollOutcome> {
        let state = self
            .feed_states
            .get_or_create(source_id, feed_url)
            .await
            .context("failed to load feed state")?;

        let response = match self
            .fetcher
            .fetch(
                feed_url,
                state.last_etag.as_deref(),
                state.last_modified.as_deref(),
            )
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let error = PollError::new(FeedErrorKind::Network, e.to_string());
                return self.record_error(source_id, feed_url, error).await;
            }
        };

        match response.status {
            304 => {
                // Nothing changed upstream; the success streak is preserved
                // without touching any feed-state column.
                tracing::debug!(source_id = %source_id, feed_url = %feed_url, "feed not modified");
                self.sources
                    .enable_feed(source_id)
                    .await
                    .context("failed to re-enable source")?;
                Ok(PollOutcome::NotModified)
            }
            200 => {
                self.handle_feed_body(source_id, feed_url, response).await
            }
            status => {
                self.record_error(source_id, feed_url, PollError::from_status(status))
                    .await
            }
        }
    }

    async fn handle_feed_body(
        &self,
        source_id: Uuid,
        feed_url: &str,
        response: FeedResponse,
    ) -> Result<PollOutcome> {
        let parsed = match parse_feed(&response.body) {
            Ok(parsed) => parsed,
            Err(e) => {
                let error = PollError::new(FeedErrorKind::ParseError, e.to_string());
                return self.record_error(source_id, feed_url, error).await;
            }
        };

        let mut submitted = 0;
        let mut skipped = parsed.skipped;
        for item in &parsed.items {
            let normalized = match normalize_url(&item.link) {
                Ok(normalized) => normalized,
                Err(e) => {
                    tracing::warn!(
                        source_id = %source_id,
                        link = %item.link,
                        error = %e,
                        "skipping feed item with unusable link"
                    );
                    skipped += 1;
                    continue;
                }
            };

            self.frontier
                .submit(
                    UrlSubmission::new(
                        normalized.url,
                        normalized.url_hash,
                        normalized.host,
                        source_id,
                        UrlOrigin::Feed,
                    )
                    .with_priority(DEFAULT_PRIORITY + FEED_PRIORITY_BONUS),
                )
                .await
                .context("failed to submit feed item to frontier")?;
            submitted += 1;
        }

        self.feed_states
            .update_success(
                source_id,
                response.etag.as_deref(),
                response.last_modified.as_deref(),
                submitted as i32,
            )
            .await
            .context("failed to record poll success")?;

        self.sources
            .enable_feed(source_id)
            .await
            .context("failed to re-enable source")?;

        tracing::info!(
            source_id = %source_id,
            feed_url = %feed_url,
            submitted,
            skipped,
            "feed polled"
        );

        Ok(PollOutcome::Success { submitted, skipped })
    }

    async fn record_error(
        &self,
        source_id: Uuid,
        feed_url: &str,
        error: PollError,
    ) -> Result<PollOutcome> {
        let kind = error.kind;
        if kind == FeedErrorKind::Unexpected {
            tracing::error!(
                source_id = %source_id,
                feed_url = %feed_url,
                error = %error,
                "unexpected feed poll failure"
            );
        } else {
            tracing::warn!(
                source_id = %source_id,
                feed_url = %feed_url,
                error = %error,
                "feed poll failed"
            );
        }

        let consecutive = self
            .feed_states
            .update_error(source_id, kind.as_str(), &error.message)
            .await
            .context("failed to record poll error")?;

        if let Some(threshold) = kind.disable_threshold() {
            if consecutive as u32 >= threshold {
                tracing::warn!(
                    source_id = %source_id,
                    feed_url = %feed_url,
                    consecutive,
                    threshold,
                    kind = kind.as_str(),
                    "disabling chronically failing feed"
                );
                self.sources
                    .disable_feed(source_id, kind.as_str())
                    .await
                    .context("failed to disable source")?;
            }
        }

        Ok(PollOutcome::Failed { kind })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::Utc;

    use super::*;
    use crate::source::testing::MemorySourceManager;
    use crate::storage::memory::{MemoryFeedStateStore, MemoryFrontierStore};
    use crate::types::{FeedState, Source};

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Test</title>
    <item><link>https://example.com/story-1</link><title>One</title></item>
    <item><link>https://example.com/story-2</link><title>Two</title></item>
    <item><link>not a url</link><title>Broken</title></item>
</channel></rss>"#;

    /// Scripted fetcher: pops the next response per call.
    struct ScriptedFetcher {
        responses: Mutex<Vec<Result<FeedResponse, FetchError>>>,
        pub seen_etag: Mutex<Option<String>>,
    }

    impl ScriptedFetcher {
        fn new(mut responses: Vec<Result<FeedResponse, FetchError>>) -> Self {
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
                seen_etag: Mutex::new(None),
            }
        }

        fn status(status: u16) -> FeedResponse {
            FeedResponse {
                status,
                etag: None,
                last_modified: None,
                body: Vec::new(),
            }
        }

        fn ok(body: &str) -> FeedResponse {
            FeedResponse {
                status: 200,
                etag: Some("\"v1\"".to_string()),
                last_modified: Some("Mon, 02 Mar 2026 09:30:00 GMT".to_string()),
                body: body.as_bytes().to_vec(),
            }
        }
    }

    #[async_trait]
    impl FeedFetcher for ScriptedFetcher {
        async fn fetch(
            &self,
            _url: &str,
            etag: Option<&str>,
            _last_modified: Option<&str>,
        ) -> Result<FeedResponse, FetchError> {
            *self.seen_etag.lock().unwrap() = etag.map(str::to_string);
            self.responses
                .lock()
                .unwrap()
                .pop()
                .expect("fetcher script exhausted")
        }
    }

    struct Fixture {
        frontier: Arc<MemoryFrontierStore>,
        feed_states: Arc<MemoryFeedStateStore>,
        sources: Arc<MemorySourceManager>,
        poller: FeedPoller,
        source_id: Uuid,
    }

    fn fixture(responses: Vec<Result<FeedResponse, FetchError>>) -> Fixture {
        let frontier = Arc::new(MemoryFrontierStore::new());
        let feed_states = Arc::new(MemoryFeedStateStore::new());
        let sources = Arc::new(MemorySourceManager::new());
        let source_id = Uuid::new_v4();
        let now = Utc::now();
        sources.insert(Source {
            source_id,
            name: "Example".to_string(),
            base_url: "https://example.com".to_string(),
            feed_url: Some("https://example.com/feed".to_string()),
            enabled: true,
            disabled_reason: None,
            interval_minutes: 60,
            selectors: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        });
        let fetcher = Arc::new(ScriptedFetcher::new(responses));
        let poller = FeedPoller::new(
            frontier.clone(),
            feed_states.clone(),
            sources.clone(),
            fetcher,
        );
        Fixture {
            frontier,
            feed_states,
            sources,
            poller,
            source_id,
        }
    }

    #[tokio::test]
    async fn successful_poll_submits_items_and_records_validators() {
        let f = fixture(vec![Ok(ScriptedFetcher::ok(VALID_RSS))]);
        let outcome = f
            .poller
            .poll_feed(f.source_id, "https://example.com/feed")
            .await
            .unwrap();

        assert_eq!(
            outcome,
            PollOutcome::Success {
                submitted: 2,
                skipped: 1
            }
        );
        let stats = f.frontier.stats().await.unwrap();
        assert_eq!(stats.pending, 2);

        let state = f.feed_states.get(f.source_id).unwrap();
        assert_eq!(state.last_etag.as_deref(), Some("\"v1\""));
        assert_eq!(state.last_item_count, 2);
        assert_eq!(state.consecutive_errors, 0);
    }

    #[tokio::test]
    async fn feed_items_get_priority_bonus() {
        let f = fixture(vec![Ok(ScriptedFetcher::ok(VALID_RSS))]);
        f.poller
            .poll_feed(f.source_id, "https://example.com/feed")
            .await
            .unwrap();

        let rows = f
            .frontier
            .list(Default::default(), 10, 0)
            .await
            .unwrap();
        assert!(rows
            .iter()
            .all(|r| r.priority == DEFAULT_PRIORITY + FEED_PRIORITY_BONUS));
        assert!(rows.iter().all(|r| r.origin == UrlOrigin::Feed));
    }

    #[tokio::test]
    async fn not_modified_leaves_feed_state_untouched() {
        let f = fixture(vec![Ok(ScriptedFetcher::status(304))]);

        // Seed a state with validators and a success history.
        let now = Utc::now();
        f.feed_states.insert(FeedState {
            source_id: f.source_id,
            feed_url: "https://example.com/feed".to_string(),
            last_polled_at: Some(now),
            last_etag: Some("\"X\"".to_string()),
            last_modified: Some("Mon, 02 Mar 2026 09:30:00 GMT".to_string()),
            last_item_count: 12,
            consecutive_errors: 0,
            last_error: None,
            last_error_type: None,
            created_at: now,
            updated_at: now,
        });
        let before = f.feed_states.get(f.source_id).unwrap();

        let outcome = f
            .poller
            .poll_feed(f.source_id, "https://example.com/feed")
            .await
            .unwrap();
        assert_eq!(outcome, PollOutcome::NotModified);

        let after = f.feed_states.get(f.source_id).unwrap();
        assert_eq!(after.last_etag, before.last_etag);
        assert_eq!(after.last_modified, before.last_modified);
        assert_eq!(after.last_item_count, before.last_item_count);
        assert_eq!(after.consecutive_errors, before.consecutive_errors);
        assert_eq!(after.last_polled_at, before.last_polled_at);
        assert!(f.frontier.is_empty());
    }

    #[tokio::test]
    async fn conditional_headers_are_sent_from_state() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Ok(ScriptedFetcher::status(304))]));
        let frontier = Arc::new(MemoryFrontierStore::new());
        let feed_states = Arc::new(MemoryFeedStateStore::new());
        let sources = Arc::new(MemorySourceManager::new());
        let source_id = Uuid::new_v4();
        let now = Utc::now();
        sources.insert(Source {
            source_id,
            name: "Example".to_string(),
            base_url: "https://example.com".to_string(),
            feed_url: Some("https://example.com/feed".to_string()),
            enabled: true,
            disabled_reason: None,
            interval_minutes: 60,
            selectors: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        });
        feed_states.insert(FeedState {
            source_id,
            feed_url: "https://example.com/feed".to_string(),
            last_polled_at: None,
            last_etag: Some("\"X\"".to_string()),
            last_modified: None,
            last_item_count: 0,
            consecutive_errors: 0,
            last_error: None,
            last_error_type: None,
            created_at: now,
            updated_at: now,
        });

        let poller = FeedPoller::new(frontier, feed_states, sources, fetcher.clone());
        poller
            .poll_feed(source_id, "https://example.com/feed")
            .await
            .unwrap();

        assert_eq!(fetcher.seen_etag.lock().unwrap().as_deref(), Some("\"X\""));
    }

    #[tokio::test]
    async fn three_not_found_polls_disable_the_feed_once() {
        let f = fixture(vec![
            Ok(ScriptedFetcher::status(404)),
            Ok(ScriptedFetcher::status(404)),
            Ok(ScriptedFetcher::status(404)),
        ]);

        for _ in 0..3 {
            let outcome = f
                .poller
                .poll_feed(f.source_id, "https://example.com/feed")
                .await
                .unwrap();
            assert_eq!(
                outcome,
                PollOutcome::Failed {
                    kind: FeedErrorKind::NotFound
                }
            );
        }

        let state = f.feed_states.get(f.source_id).unwrap();
        assert_eq!(state.consecutive_errors, 3);

        let calls = f.sources.disable_calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], (f.source_id, "not_found".to_string()));
        assert!(!f.sources.get(f.source_id).unwrap().enabled);
    }

    #[tokio::test]
    async fn gone_disables_on_first_error() {
        let f = fixture(vec![Ok(ScriptedFetcher::status(410))]);
        f.poller
            .poll_feed(f.source_id, "https://example.com/feed")
            .await
            .unwrap();
        assert_eq!(f.sources.disable_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rate_limiting_never_disables() {
        let responses = (0..20)
            .map(|_| Ok(ScriptedFetcher::status(429)))
            .collect();
        let f = fixture(responses);
        for _ in 0..20 {
            f.poller
                .poll_feed(f.source_id, "https://example.com/feed")
                .await
                .unwrap();
        }
        assert_eq!(f.feed_states.get(f.source_id).unwrap().consecutive_errors, 20);
        assert!(f.sources.disable_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn success_resets_error_streak_and_reenables() {
        let f = fixture(vec![
            Ok(ScriptedFetcher::status(500)),
            Ok(ScriptedFetcher::ok(VALID_RSS)),
        ]);

        f.poller
            .poll_feed(f.source_id, "https://example.com/feed")
            .await
            .unwrap();
        assert_eq!(f.feed_states.get(f.source_id).unwrap().consecutive_errors, 1);

        f.poller
            .poll_feed(f.source_id, "https://example.com/feed")
            .await
            .unwrap();
        assert_eq!(f.feed_states.get(f.source_id).unwrap().consecutive_errors, 0);
        assert!(!f.sources.enable_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn parse_failure_is_classified() {
        let f = fixture(vec![Ok(FeedResponse {
            status: 200,
            etag: None,
            last_modified: None,
            body: b"<definitely not a feed".to_vec(),
        })]);
        let outcome = f
            .poller
            .poll_feed(f.source_id, "https://example.com/feed")
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Failed {
                kind: FeedErrorKind::ParseError
            }
        );
        let state = f.feed_states.get(f.source_id).unwrap();
        assert_eq!(state.last_error_type.as_deref(), Some("parse_error"));
    }

    #[tokio::test]
    async fn reqwest_fetcher_sends_conditional_headers() {
        use wiremock::matchers::{header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .and(header("If-None-Match", "\"v1\""))
            .and(header("If-Modified-Since", "Mon, 02 Mar 2026 09:30:00 GMT"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let fetcher = ReqwestFeedFetcher::new("contentpipeline/1.0").unwrap();
        let response = fetcher
            .fetch(
                &format!("{}/feed", server.uri()),
                Some("\"v1\""),
                Some("Mon, 02 Mar 2026 09:30:00 GMT"),
            )
            .await
            .unwrap();
        assert_eq!(response.status, 304);
    }

    #[tokio::test]
    async fn reqwest_fetcher_reads_validators() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .insert_header("ETag", "\"v2\"")
                    .insert_header("Last-Modified", "Tue, 03 Mar 2026 08:00:00 GMT"),
            )
            .mount(&server)
            .await;

        let fetcher = ReqwestFeedFetcher::new("contentpipeline/1.0").unwrap();
        let response = fetcher
            .fetch(&format!("{}/feed", server.uri()), None, None)
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.etag.as_deref(), Some("\"v2\""));
        assert_eq!(
            response.last_modified.as_deref(),
            Some("Tue, 03 Mar 2026 08:00:00 GMT")
        );
        assert!(!response.body.is_empty());
    }

    #[tokio::test]
    async fn network_failure_is_classified() {
        let f = fixture(vec![Err(FetchError::Timeout)]);
        let outcome = f
            .poller
            .poll_feed(f.source_id, "https://example.com/feed")
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Failed {
                kind: FeedErrorKind::Network
            }
        );
    }
}
