//! Frontier fetch worker.
//!
//! Claims URLs from the frontier (politeness is enforced by the claim
//! query), gates them on robots.txt, fetches with conditional-GET headers,
//! and hands successful documents to the external classifier. Every HTTP
//! attempt against a host stamps its `last_fetch_at`; 429/503 responses
//! double the host's politeness delay up to a hard cap.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::error::FetchError;
use crate::normalize::{hash_content, normalize_url};
use crate::queue::{work_queue, SubmitError, WorkQueue, WorkReceiver};
use crate::robots::RobotsRules;
use crate::storage::{FrontierStore, HostStore};
use crate::types::{FetchOutcome, FrontierUrl, UrlOrigin, MAX_MIN_DELAY_MS};

const PAGE_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_PAGE_SIZE: usize = 10 * 1024 * 1024;

/// A successfully fetched document, as handed to the classifier.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub frontier_id: Uuid,
    pub source_id: Uuid,
    pub url: String,
    pub final_url: String,
    pub origin: UrlOrigin,
    pub content_hash: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

/// External collaborator: classifies a fetched document and persists the
/// result (its own index write plus the outbox row, in one transaction).
#[async_trait]
pub trait DocumentClassifier: Send + Sync {
    async fn classify(&self, document: FetchedDocument) -> Result<()>;
}

/// HTTP result for a page fetch. Carries the final URL after redirects.
#[derive(Debug, Clone)]
pub struct PageResponse {
    pub status: u16,
    pub final_url: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub body: Vec<u8>,
}

/// Page-level HTTP access, mockable in tests.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<PageResponse, FetchError>;

    /// Plain GET used for robots.txt.
    async fn fetch_text(&self, url: &str) -> Result<PageResponse, FetchError>;
}

pub struct ReqwestPageFetcher {
    client: reqwest::Client,
}

impl ReqwestPageFetcher {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(PAGE_FETCH_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .context("failed to build page HTTP client")?;
        Ok(Self { client })
    }

    async fn get(
        &self,
        url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<PageResponse, FetchError> {
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
        let final_url = response.url().to_string();
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
            if len as usize > MAX_PAGE_SIZE {
                return Err(FetchError::ResponseTooLarge(MAX_PAGE_SIZE));
            }
        }
        let body = response.bytes().await.map_err(FetchError::Network)?;
        if body.len() > MAX_PAGE_SIZE {
            return Err(FetchError::ResponseTooLarge(MAX_PAGE_SIZE));
        }

        Ok(PageResponse {
            status,
            final_url,
            etag,
            last_modified,
            body: body.to_vec(),
        })
    }
}

#[async_trait]
impl PageFetcher for ReqwestPageFetcher {
    async fn fetch(
        &self,
        url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<PageResponse, FetchError> {
        self.get(url, etag, last_modified).await
    }

    async fn fetch_text(&self, url: &str) -> Result<PageResponse, FetchError> {
        self.get(url, None, None).await
    }
}

#[derive(Debug, Clone)]
pub struct FetchWorkerConfig {
    /// Concurrent fetch tasks.
    pub workers: usize,
    /// Claim channel capacity (throttle threshold sits at 80%).
    pub queue_capacity: usize,
    /// Sleep when the frontier has nothing claimable.
    pub idle_poll_interval: Duration,
    /// Attempts before a URL goes dead.
    pub max_retries: i32,
    /// User-agent token matched against robots.txt groups.
    pub user_agent: String,
}

impl Default for FetchWorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
            idle_poll_interval: Duration::from_secs(5),
            max_retries: 5,
            user_agent: "contentpipeline/1.0".to_string(),
        }
    }
}

/// What one processed URL amounted to. Returned for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDisposition {
    Fetched,
    NotModified,
    Failed,
    Dead,
}

pub struct FetchWorker {
    frontier: Arc<dyn FrontierStore>,
    hosts: Arc<dyn HostStore>,
    fetcher: Arc<dyn PageFetcher>,
    classifier: Arc<dyn DocumentClassifier>,
    config: FetchWorkerConfig,
    active_workers: Arc<AtomicUsize>,
    queue: WorkQueue<FrontierUrl>,
    receiver: std::sync::Mutex<Option<WorkReceiver<FrontierUrl>>>,
}

impl FetchWorker {
    pub fn new(
        frontier: Arc<dyn FrontierStore>,
        hosts: Arc<dyn HostStore>,
        fetcher: Arc<dyn PageFetcher>,
        classifier: Arc<dyn DocumentClassifier>,
        config: FetchWorkerConfig,
    ) -> Self {
        let (queue, receiver) = work_queue::<FrontierUrl>(config.queue_capacity);
        Self {
            frontier,
            hosts,
            fetcher,
            classifier,
            config,
            active_workers: Arc::new(AtomicUsize::new(0)),
            queue,
            receiver: std::sync::Mutex::new(Some(receiver)),
        }
    }

    /// Currently busy fetch tasks, for gauge export.
    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    /// Claim-channel depth, for gauge export.
    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    /// Run the claim loop plus the worker pool until cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(
            workers = self.config.workers,
            queue_capacity = self.config.queue_capacity,
            "fetch worker starting"
        );

        let Some(mut receiver) = self.receiver.lock().unwrap().take() else {
            tracing::error!("fetch worker already running");
            return;
        };
        let queue = self.queue.clone();

        // Dispatcher: one consumer task feeding a pool of processors.
        let pool = {
            let worker = self.clone();
            let pool_shutdown = shutdown.clone();
            tokio::spawn(async move {
                let semaphore = Arc::new(tokio::sync::Semaphore::new(worker.config.workers));
                loop {
                    let item = tokio::select! {
                        _ = pool_shutdown.cancelled() => break,
                        item = receiver.recv() => item,
                    };
                    let Some(row) = item else { break };

                    let permit = match semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let worker = worker.clone();
                    tokio::spawn(async move {
                        worker.active_workers.fetch_add(1, Ordering::SeqCst);
                        if let Err(e) = worker.process_claimed(row).await {
                            tracing::warn!(error = %e, "fetch processing failed");
                        }
                        worker.active_workers.fetch_sub(1, Ordering::SeqCst);
                        drop(permit);
                    });
                }
            })
        };

        // Claim loop.
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if queue.is_throttled() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.idle_poll_interval) => {}
                }
                continue;
            }

            match self.frontier.claim().await {
                Ok(Some(row)) => {
                    match queue.submit(row, self.config.idle_poll_interval).await {
                        Ok(()) => continue,
                        Err(SubmitError::Closed) => break,
                        Err(e) => {
                            tracing::debug!(error = %e, "fetch queue saturated, skipping tick");
                        }
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.idle_poll_interval) => {}
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "frontier claim failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        let _ = pool.await;
        tracing::info!("fetch worker stopped");
    }

    /// Process one claimed frontier row end to end.
    pub async fn process_claimed(&self, row: FrontierUrl) -> Result<FetchDisposition> {
        // Robots gate first; a disallowed URL never generates page traffic.
        match self.check_robots(&row).await {
            Ok(true) => {}
            Ok(false) => {
                self.frontier
                    .update_dead(row.id, "robots_disallowed")
                    .await
                    .context("failed to mark robots-disallowed URL dead")?;
                return Ok(FetchDisposition::Dead);
            }
            Err(e) => {
                // Robots unavailable is not a reason to drop the URL.
                tracing::debug!(host = %row.host, error = %e, "robots check failed, allowing");
            }
        }

        let result = self
            .fetcher
            .fetch(&row.url, row.etag.as_deref(), row.last_modified.as_deref())
            .await;

        // The attempt hit the host regardless of outcome.
        self.hosts
            .update_last_fetch(&row.host)
            .await
            .context("failed to stamp host last_fetch_at")?;

        match result {
            Ok(response) => self.handle_response(row, response).await,
            Err(e) if e.is_permanent() => {
                self.frontier.update_dead(row.id, &e.to_string()).await?;
                Ok(FetchDisposition::Dead)
            }
            Err(e) => {
                self.frontier
                    .update_failed(row.id, &e.to_string(), self.config.max_retries)
                    .await?;
                Ok(FetchDisposition::Failed)
            }
        }
    }

    async fn handle_response(
        &self,
        row: FrontierUrl,
        response: PageResponse,
    ) -> Result<FetchDisposition> {
        match response.status {
            304 => {
                self.frontier
                    .update_fetched(
                        row.id,
                        FetchOutcome {
                            content_hash: None,
                            etag: response.etag,
                            last_modified: response.last_modified,
                        },
                    )
                    .await?;
                Ok(FetchDisposition::NotModified)
            }
            200 => {
                let content_hash = hash_content(&response.body);
                let outcome = FetchOutcome {
                    content_hash: Some(content_hash.clone()),
                    etag: response.etag.clone(),
                    last_modified: response.last_modified.clone(),
                };

                let final_normalized = normalize_url(&response.final_url).ok();
                let moved = final_normalized
                    .as_ref()
                    .map(|n| n.url_hash != row.url_hash)
                    .unwrap_or(false);

                if moved {
                    let n = final_normalized.as_ref().expect("checked above");
                    self.frontier
                        .update_fetched_with_final_url(
                            row.id, &n.url, &n.url_hash, &n.host, outcome,
                        )
                        .await?;
                } else {
                    self.frontier.update_fetched(row.id, outcome).await?;
                }

                let document = FetchedDocument {
                    frontier_id: row.id,
                    source_id: row.source_id,
                    url: row.url.clone(),
                    final_url: response.final_url,
                    origin: row.origin,
                    content_hash,
                    body: response.body,
                    fetched_at: Utc::now(),
                };
                if let Err(e) = self.classifier.classify(document).await {
                    // Classification failures are the classifier's to retry
                    // (its own ledger/DLQ); the fetch itself succeeded.
                    tracing::warn!(url = %row.url, error = %e, "classifier rejected document");
                }
                Ok(FetchDisposition::Fetched)
            }
            status @ (429 | 503) => {
                self.slow_down_host(&row.host).await;
                self.frontier
                    .update_failed(
                        row.id,
                        &format!("HTTP status {status}"),
                        self.config.max_retries,
                    )
                    .await?;
                Ok(FetchDisposition::Failed)
            }
            status @ (400 | 401 | 403 | 404 | 410) => {
                self.frontier
                    .update_dead(row.id, &format!("HTTP status {status}"))
                    .await?;
                Ok(FetchDisposition::Dead)
            }
            status => {
                self.frontier
                    .update_failed(
                        row.id,
                        &format!("HTTP status {status}"),
                        self.config.max_retries,
                    )
                    .await?;
                Ok(FetchDisposition::Failed)
            }
        }
    }

    /// Whether robots.txt allows this URL, refreshing the cached document
    /// when stale.
    async fn check_robots(&self, row: &FrontierUrl) -> Result<bool> {
        let state = self.hosts.get_or_create(&row.host).await?;
        let parsed = Url::parse(&row.url).context("frontier row has invalid URL")?;

        let robots_txt = if state.robots_stale(Utc::now()) {
            let robots_url = format!("{}://{}/robots.txt", parsed.scheme(), row.host);
            match self.fetcher.fetch_text(&robots_url).await {
                Ok(response) if response.status == 200 => {
                    let text = String::from_utf8_lossy(&response.body).into_owned();
                    let rules = RobotsRules::parse(&text, &self.config.user_agent);
                    self.hosts
                        .update_robots_txt(&row.host, &text, rules.crawl_delay_ms())
                        .await?;
                    self.hosts.update_last_fetch(&row.host).await?;
                    text
                }
                Ok(_) => {
                    // Missing robots.txt means everything is allowed; cache
                    // the empty document so we do not probe on every URL.
                    self.hosts.update_robots_txt(&row.host, "", None).await?;
                    self.hosts.update_last_fetch(&row.host).await?;
                    String::new()
                }
                Err(e) => return Err(e).context("robots.txt fetch failed"),
            }
        } else {
            state.robots_txt.unwrap_or_default()
        };

        let rules = RobotsRules::parse(&robots_txt, &self.config.user_agent);
        let mut path = parsed.path().to_string();
        if let Some(query) = parsed.query() {
            path.push('?');
            path.push_str(query);
        }
        Ok(rules.is_allowed(&path))
    }

    /// Double the host's politeness delay after a 429/503, capped.
    async fn slow_down_host(&self, host: &str) {
        let current = match self.hosts.get_or_create(host).await {
            Ok(state) => state.min_delay_ms,
            Err(e) => {
                tracing::warn!(host = %host, error = %e, "failed to read host state");
                return;
            }
        };
        let next = (current.saturating_mul(2)).min(MAX_MIN_DELAY_MS);
        if next != current {
            tracing::info!(host = %host, from = current, to = next, "raising host delay");
            if let Err(e) = self.hosts.update_min_delay(host, next).await {
                tracing::warn!(host = %host, error = %e, "failed to raise host delay");
            }
        }
    }
}
