//! Sitemap XML parsing and frontier ingestion.
//!
//! Handles both `urlset` documents and `sitemapindex` documents (one level
//! of nesting). `lastmod` is accepted as RFC 3339 or bare `YYYY-MM-DD`.
//! Malformed entries are skipped, not fatal.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use quick_xml::events::Event;
use uuid::Uuid;

use crate::normalize::normalize_url;
use crate::poller::FeedFetcher;
use crate::storage::FrontierStore;
use crate::types::{UrlOrigin, UrlSubmission, DEFAULT_PRIORITY};

/// Upper bound on child sitemaps followed from one index document.
const MAX_CHILD_SITEMAPS: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SitemapEntry {
    pub loc: String,
    pub lastmod: Option<DateTime<Utc>>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SitemapDocument {
    /// A `urlset` of page entries.
    Urls(Vec<SitemapEntry>),
    /// A `sitemapindex` of child sitemap locations.
    Index(Vec<String>),
}

/// Parse a sitemaps.org document.
pub fn parse_sitemap(xml: &str) -> Result<SitemapDocument> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut buf = Vec::new();

    let mut is_index = false;
    let mut saw_root = false;
    let mut in_loc = false;
    let mut in_lastmod = false;
    let mut current_loc: Option<String> = None;
    let mut current_lastmod: Option<DateTime<Utc>> = None;

    let mut entries = Vec::new();
    let mut children = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"urlset" => {
                    saw_root = true;
                    is_index = false;
                }
                b"sitemapindex" => {
                    saw_root = true;
                    is_index = true;
                }
                b"loc" => in_loc = true,
                b"lastmod" => in_lastmod = true,
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if in_loc {
                    if let Ok(text) = e.unescape() {
                        current_loc = Some(text.trim().to_string());
                    }
                } else if in_lastmod {
                    if let Ok(text) = e.unescape() {
                        current_lastmod = parse_lastmod(text.trim());
                    }
                }
            }
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"loc" => in_loc = false,
                b"lastmod" => in_lastmod = false,
                b"url" => {
                    if let Some(loc) = current_loc.take() {
                        entries.push(SitemapEntry {
                            loc,
                            lastmod: current_lastmod.take(),
                        });
                    }
                    current_lastmod = None;
                }
                b"sitemap" => {
                    if let Some(loc) = current_loc.take() {
                        children.push(loc);
                    }
                    current_lastmod = None;
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(e).context("malformed sitemap XML"),
            _ => {}
        }
        buf.clear();
    }

    if !saw_root {
        anyhow::bail!("document has no urlset or sitemapindex root");
    }

    if is_index {
        Ok(SitemapDocument::Index(children))
    } else {
        Ok(SitemapDocument::Urls(entries))
    }
}

/// `lastmod` per sitemaps.org: W3C datetime (RFC 3339) or a bare date.
fn parse_lastmod(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }
    None
}

/// Counts out of one sitemap ingestion.
#[derive(Debug, Default, Clone, Copy)]
pub struct SitemapStats {
    pub submitted: usize,
    pub skipped: usize,
    pub child_sitemaps: usize,
}

pub struct SitemapIngestor {
    frontier: Arc<dyn FrontierStore>,
    fetcher: Arc<dyn FeedFetcher>,
}

impl SitemapIngestor {
    pub fn new(frontier: Arc<dyn FrontierStore>, fetcher: Arc<dyn FeedFetcher>) -> Self {
        Self { frontier, fetcher }
    }

    /// Fetch a sitemap URL and submit its entries to the frontier with
    /// `origin = sitemap`. Index documents are followed one level deep.
    pub async fn ingest(&self, source_id: Uuid, sitemap_url: &str) -> Result<SitemapStats> {
        let mut stats = SitemapStats::default();
        self.ingest_inner(source_id, sitemap_url, true, &mut stats)
            .await?;
        tracing::info!(
            source_id = %source_id,
            sitemap_url = %sitemap_url,
            submitted = stats.submitted,
            skipped = stats.skipped,
            child_sitemaps = stats.child_sitemaps,
            "sitemap ingested"
        );
        Ok(stats)
    }

    async fn ingest_inner(
        &self,
        source_id: Uuid,
        sitemap_url: &str,
        follow_index: bool,
        stats: &mut SitemapStats,
    ) -> Result<()> {
        let response = self
            .fetcher
            .fetch(sitemap_url, None, None)
            .await
            .with_context(|| format!("failed to fetch sitemap {sitemap_url}"))?;
        if response.status != 200 {
            anyhow::bail!("sitemap {sitemap_url} returned HTTP {}", response.status);
        }

        let xml = String::from_utf8_lossy(&response.body);
        match parse_sitemap(&xml)? {
            SitemapDocument::Urls(entries) => {
                for entry in entries {
                    match normalize_url(&entry.loc) {
                        Ok(normalized) => {
                            let submission = UrlSubmission::new(
                                normalized.url,
                                normalized.url_hash,
                                normalized.host,
                                source_id,
                                UrlOrigin::Sitemap,
                            )
                            .with_priority(DEFAULT_PRIORITY);
                            self.frontier
                                .submit(submission)
                                .await
                                .context("failed to submit sitemap entry")?;
                            stats.submitted += 1;
                        }
                        Err(e) => {
                            tracing::debug!(loc = %entry.loc, error = %e, "skipping sitemap entry");
                            stats.skipped += 1;
                        }
                    }
                }
            }
            SitemapDocument::Index(children) => {
                if !follow_index {
                    tracing::warn!(
                        sitemap_url = %sitemap_url,
                        "nested sitemap index ignored"
                    );
                    return Ok(());
                }
                for child in children.into_iter().take(MAX_CHILD_SITEMAPS) {
                    stats.child_sitemaps += 1;
                    if let Err(e) =
                        Box::pin(self.ingest_inner(source_id, &child, false, stats)).await
                    {
                        tracing::warn!(child = %child, error = %e, "child sitemap failed");
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryFrontierStore;

    const URLSET: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
    <url>
        <loc>https://example.com/a</loc>
        <lastmod>2026-02-27T10:00:00Z</lastmod>
    </url>
    <url>
        <loc>https://example.com/b</loc>
        <lastmod>2026-02-28</lastmod>
    </url>
    <url>
        <loc>not a url</loc>
    </url>
</urlset>"#;

    const INDEX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
    <sitemap><loc>https://example.com/sitemap-news.xml</loc></sitemap>
    <sitemap><loc>https://example.com/sitemap-old.xml</loc></sitemap>
</sitemapindex>"#;

    #[test]
    fn parses_urlset_with_both_lastmod_formats() {
        let doc = parse_sitemap(URLSET).unwrap();
        let SitemapDocument::Urls(entries) = doc else {
            panic!("expected urlset");
        };
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].loc, "https://example.com/a");
        assert!(entries[0].lastmod.is_some());
        assert!(entries[1].lastmod.is_some());
        assert_eq!(
            entries[1].lastmod.unwrap(),
            NaiveDate::from_ymd_opt(2026, 2, 28)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap()
                .and_utc()
        );
        assert!(entries[2].lastmod.is_none());
    }

    #[test]
    fn parses_sitemapindex() {
        let doc = parse_sitemap(INDEX).unwrap();
        assert_eq!(
            doc,
            SitemapDocument::Index(vec![
                "https://example.com/sitemap-news.xml".to_string(),
                "https://example.com/sitemap-old.xml".to_string(),
            ])
        );
    }

    #[test]
    fn rejects_non_sitemap_xml() {
        assert!(parse_sitemap("<html><body>hi</body></html>").is_err());
    }

    #[tokio::test]
    async fn ingest_submits_entries_and_skips_bad_urls() {
        use crate::poller::{FeedFetcher, FeedResponse};
        use async_trait::async_trait;

        struct OneShot;

        #[async_trait]
        impl FeedFetcher for OneShot {
            async fn fetch(
                &self,
                _url: &str,
                _etag: Option<&str>,
                _last_modified: Option<&str>,
            ) -> Result<FeedResponse, crate::error::FetchError> {
                Ok(FeedResponse {
                    status: 200,
                    etag: None,
                    last_modified: None,
                    body: URLSET.as_bytes().to_vec(),
                })
            }
        }

        let frontier = Arc::new(MemoryFrontierStore::new());
        let ingestor = SitemapIngestor::new(frontier.clone(), Arc::new(OneShot));
        let stats = ingestor
            .ingest(Uuid::new_v4(), "https://example.com/sitemap.xml")
            .await
            .unwrap();

        assert_eq!(stats.submitted, 2);
        assert_eq!(stats.skipped, 1);
        let rows = frontier.list(Default::default(), 10, 0).await.unwrap();
        assert!(rows.iter().all(|r| r.origin == UrlOrigin::Sitemap));
    }
}
