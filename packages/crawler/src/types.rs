use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Baseline priority for newly discovered URLs.
pub const DEFAULT_PRIORITY: i32 = 0;

/// Bonus applied to URLs that arrived through a feed (fresher than spidered links).
pub const FEED_PRIORITY_BONUS: i32 = 10;

/// Default per-host minimum delay between fetches.
pub const DEFAULT_MIN_DELAY_MS: i32 = 1000;

/// Hard cap for adaptive per-host delay (after 429/503 doubling).
pub const MAX_MIN_DELAY_MS: i32 = 60_000;

/// Default TTL for cached robots.txt documents.
pub const DEFAULT_ROBOTS_TTL_HOURS: i32 = 24;

// ============================================================================
// ENUMS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlStatus {
    Pending,
    Fetching,
    Fetched,
    Failed,
    Dead,
}

impl UrlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrlStatus::Pending => "pending",
            UrlStatus::Fetching => "fetching",
            UrlStatus::Fetched => "fetched",
            UrlStatus::Failed => "failed",
            UrlStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(UrlStatus::Pending),
            "fetching" => Some(UrlStatus::Fetching),
            "fetched" => Some(UrlStatus::Fetched),
            "failed" => Some(UrlStatus::Failed),
            "dead" => Some(UrlStatus::Dead),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlOrigin {
    Feed,
    Spider,
    Sitemap,
    Seed,
}

impl UrlOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrlOrigin::Feed => "feed",
            UrlOrigin::Spider => "spider",
            UrlOrigin::Sitemap => "sitemap",
            UrlOrigin::Seed => "seed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "feed" => Some(UrlOrigin::Feed),
            "spider" => Some(UrlOrigin::Spider),
            "sitemap" => Some(UrlOrigin::Sitemap),
            "seed" => Some(UrlOrigin::Seed),
            _ => None,
        }
    }
}

/// Classified feed poll failures. Each kind may carry an auto-disable
/// threshold: once a source accumulates that many consecutive errors of the
/// kind, its feed is disabled until a successful poll re-enables it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedErrorKind {
    Network,
    RateLimited,
    Forbidden,
    NotFound,
    Gone,
    Upstream,
    ParseError,
    Unexpected,
}

impl FeedErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedErrorKind::Network => "network",
            FeedErrorKind::RateLimited => "rate_limited",
            FeedErrorKind::Forbidden => "forbidden",
            FeedErrorKind::NotFound => "not_found",
            FeedErrorKind::Gone => "gone",
            FeedErrorKind::Upstream => "upstream",
            FeedErrorKind::ParseError => "parse_error",
            FeedErrorKind::Unexpected => "unexpected",
        }
    }

    /// Consecutive-error count at which the feed is auto-disabled.
    /// `None` means the kind never disables a feed.
    pub fn disable_threshold(&self) -> Option<u32> {
        match self {
            FeedErrorKind::Gone => Some(1),
            FeedErrorKind::NotFound => Some(3),
            FeedErrorKind::ParseError => Some(5),
            FeedErrorKind::Forbidden => Some(5),
            FeedErrorKind::Upstream => Some(10),
            FeedErrorKind::Network => Some(10),
            FeedErrorKind::RateLimited | FeedErrorKind::Unexpected => None,
        }
    }
}

// ============================================================================
// FRONTIER
// ============================================================================

/// A row in the crawl frontier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontierUrl {
    pub id: Uuid,
    pub url: String,
    pub url_hash: String,
    pub host: String,
    pub source_id: Uuid,
    pub origin: UrlOrigin,
    pub parent_url: Option<String>,
    pub depth: i32,
    pub priority: i32,
    pub status: UrlStatus,
    pub next_fetch_at: DateTime<Utc>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub fetch_count: i32,
    pub content_hash: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub discovered_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything the frontier needs to accept a new URL.
#[derive(Debug, Clone)]
pub struct UrlSubmission {
    pub url: String,
    pub url_hash: String,
    pub host: String,
    pub source_id: Uuid,
    pub origin: UrlOrigin,
    pub parent_url: Option<String>,
    pub depth: i32,
    pub priority: i32,
    pub next_fetch_at: DateTime<Utc>,
}

impl UrlSubmission {
    pub fn new(
        url: String,
        url_hash: String,
        host: String,
        source_id: Uuid,
        origin: UrlOrigin,
    ) -> Self {
        Self {
            url,
            url_hash,
            host,
            source_id,
            origin,
            parent_url: None,
            depth: 0,
            priority: DEFAULT_PRIORITY,
            next_fetch_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parent(mut self, parent_url: String, depth: i32) -> Self {
        self.parent_url = Some(parent_url);
        self.depth = depth;
        self
    }

    pub fn with_next_fetch_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_fetch_at = at;
        self
    }
}

/// Metadata recorded when a frontier URL has been fetched.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub content_hash: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Read-side filter for listing frontier rows.
#[derive(Debug, Clone, Default)]
pub struct FrontierFilter {
    pub status: Option<UrlStatus>,
    pub host: Option<String>,
    pub source_id: Option<Uuid>,
}

/// Aggregate counts by status, for gauges and the operational surface.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct FrontierStats {
    pub pending: i64,
    pub fetching: i64,
    pub fetched: i64,
    pub failed: i64,
    pub dead: i64,
}

// ============================================================================
// HOSTS
// ============================================================================

/// Per-host politeness state. Lazily created on first sight, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostState {
    pub host: String,
    pub last_fetch_at: Option<DateTime<Utc>>,
    pub min_delay_ms: i32,
    pub robots_txt: Option<String>,
    pub robots_fetched_at: Option<DateTime<Utc>>,
    pub robots_ttl_hours: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HostState {
    /// Whether the cached robots document is missing or past its TTL.
    pub fn robots_stale(&self, now: DateTime<Utc>) -> bool {
        match self.robots_fetched_at {
            None => true,
            Some(fetched_at) => {
                now - fetched_at > chrono::Duration::hours(self.robots_ttl_hours as i64)
            }
        }
    }
}

// ============================================================================
// FEED STATE
// ============================================================================

/// Per-source polling metadata. One row per source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedState {
    pub source_id: Uuid,
    pub feed_url: String,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub last_etag: Option<String>,
    pub last_modified: Option<String>,
    pub last_item_count: i32,
    pub consecutive_errors: i32,
    pub last_error: Option<String>,
    pub last_error_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// SOURCES
// ============================================================================

/// A curated content source (news site, blog, agency page).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub source_id: Uuid,
    pub name: String,
    pub base_url: String,
    pub feed_url: Option<String>,
    pub enabled: bool,
    pub disabled_reason: Option<String>,
    pub interval_minutes: i32,
    pub selectors: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            UrlStatus::Pending,
            UrlStatus::Fetching,
            UrlStatus::Fetched,
            UrlStatus::Failed,
            UrlStatus::Dead,
        ] {
            assert_eq!(UrlStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(UrlStatus::parse("bogus"), None);
    }

    #[test]
    fn disable_thresholds_match_policy() {
        assert_eq!(FeedErrorKind::Gone.disable_threshold(), Some(1));
        assert_eq!(FeedErrorKind::NotFound.disable_threshold(), Some(3));
        assert_eq!(FeedErrorKind::ParseError.disable_threshold(), Some(5));
        assert_eq!(FeedErrorKind::Forbidden.disable_threshold(), Some(5));
        assert_eq!(FeedErrorKind::Upstream.disable_threshold(), Some(10));
        assert_eq!(FeedErrorKind::Network.disable_threshold(), Some(10));
        assert_eq!(FeedErrorKind::RateLimited.disable_threshold(), None);
        assert_eq!(FeedErrorKind::Unexpected.disable_threshold(), None);
    }

    #[test]
    fn robots_staleness_respects_ttl() {
        let now = Utc::now();
        let mut host = HostState {
            host: "example.com".to_string(),
            last_fetch_at: None,
            min_delay_ms: DEFAULT_MIN_DELAY_MS,
            robots_txt: None,
            robots_fetched_at: None,
            robots_ttl_hours: 24,
            created_at: now,
            updated_at: now,
        };
        assert!(host.robots_stale(now));

        host.robots_fetched_at = Some(now - chrono::Duration::hours(1));
        assert!(!host.robots_stale(now));

        host.robots_fetched_at = Some(now - chrono::Duration::hours(25));
        assert!(host.robots_stale(now));
    }
}
