//! In-memory storage implementations for tests.
//!
//! These mirror the SQL semantics of the Postgres stores: submit conflict
//! merging, claim ordering and disjointness (one mutex stands in for the
//! row lock), politeness gating, retry backoff, and terminal-state rules.
//! They exist so the poller, discoverer, and workers can be exercised
//! without a database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::storage::{FeedStateStore, FrontierStore, HostStore};
use crate::types::{
    FeedState, FetchOutcome, FrontierFilter, FrontierStats, FrontierUrl, HostState, UrlStatus,
    UrlSubmission, DEFAULT_MIN_DELAY_MS, DEFAULT_ROBOTS_TTL_HOURS,
};

#[derive(Default)]
pub struct MemoryHostStore {
    hosts: Mutex<HashMap<String, HostState>>,
}

impl MemoryHostStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, host: &str) -> Option<HostState> {
        self.hosts.lock().unwrap().get(host).cloned()
    }

    /// Test hook: place a host row directly.
    pub fn insert(&self, state: HostState) {
        self.hosts.lock().unwrap().insert(state.host.clone(), state);
    }

    fn default_state(host: &str) -> HostState {
        let now = Utc::now();
        HostState {
            host: host.to_string(),
            last_fetch_at: None,
            min_delay_ms: DEFAULT_MIN_DELAY_MS,
            robots_txt: None,
            robots_fetched_at: None,
            robots_ttl_hours: DEFAULT_ROBOTS_TTL_HOURS,
            created_at: now,
            updated_at: now,
        }
    }
}

#[async_trait]
impl HostStore for MemoryHostStore {
    async fn get_or_create(&self, host: &str) -> Result<HostState, StoreError> {
        let mut hosts = self.hosts.lock().unwrap();
        Ok(hosts
            .entry(host.to_string())
            .or_insert_with(|| Self::default_state(host))
            .clone())
    }

    async fn update_last_fetch(&self, host: &str) -> Result<(), StoreError> {
        let mut hosts = self.hosts.lock().unwrap();
        let state = hosts
            .entry(host.to_string())
            .or_insert_with(|| Self::default_state(host));
        state.last_fetch_at = Some(Utc::now());
        state.updated_at = Utc::now();
        Ok(())
    }

    async fn update_robots_txt(
        &self,
        host: &str,
        robots_txt: &str,
        crawl_delay_ms: Option<i32>,
    ) -> Result<(), StoreError> {
        let mut hosts = self.hosts.lock().unwrap();
        let state = hosts
            .entry(host.to_string())
            .or_insert_with(|| Self::default_state(host));
        state.robots_txt = Some(robots_txt.to_string());
        state.robots_fetched_at = Some(Utc::now());
        if let Some(advertised) = crawl_delay_ms {
            state.min_delay_ms = state.min_delay_ms.max(advertised);
        }
        state.updated_at = Utc::now();
        Ok(())
    }

    async fn update_min_delay(&self, host: &str, min_delay_ms: i32) -> Result<(), StoreError> {
        let mut hosts = self.hosts.lock().unwrap();
        if let Some(state) = hosts.get_mut(host) {
            state.min_delay_ms = min_delay_ms;
            state.updated_at = Utc::now();
        }
        Ok(())
    }
}

pub struct MemoryFrontierStore {
    rows: Mutex<HashMap<Uuid, FrontierUrl>>,
    hosts: Option<Arc<MemoryHostStore>>,
}

impl MemoryFrontierStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            hosts: None,
        }
    }

    /// Enable the politeness predicate against a shared host store.
    pub fn with_hosts(hosts: Arc<MemoryHostStore>) -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            hosts: Some(hosts),
        }
    }

    pub fn get(&self, id: Uuid) -> Option<FrontierUrl> {
        self.rows.lock().unwrap().get(&id).cloned()
    }

    pub fn get_by_hash(&self, url_hash: &str) -> Option<FrontierUrl> {
        self.rows
            .lock()
            .unwrap()
            .values()
            .find(|r| r.url_hash == url_hash)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn host_allows(&self, host: &str, now: DateTime<Utc>) -> bool {
        let Some(hosts) = &self.hosts else {
            return true;
        };
        match hosts.get(host) {
            None => true,
            Some(state) => match state.last_fetch_at {
                None => true,
                Some(last) => last + Duration::milliseconds(state.min_delay_ms as i64) <= now,
            },
        }
    }
}

impl Default for MemoryFrontierStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FrontierStore for MemoryFrontierStore {
    async fn submit(&self, s: UrlSubmission) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(existing) = rows.values_mut().find(|r| r.url_hash == s.url_hash) {
            if existing.status == UrlStatus::Pending {
                existing.priority = existing.priority.max(s.priority);
                existing.next_fetch_at = existing.next_fetch_at.min(s.next_fetch_at);
                existing.updated_at = Utc::now();
            }
            return Ok(());
        }

        let now = Utc::now();
        let row = FrontierUrl {
            id: Uuid::new_v4(),
            url: s.url,
            url_hash: s.url_hash,
            host: s.host,
            source_id: s.source_id,
            origin: s.origin,
            parent_url: s.parent_url,
            depth: s.depth,
            priority: s.priority,
            status: UrlStatus::Pending,
            next_fetch_at: s.next_fetch_at,
            last_fetched_at: None,
            fetch_count: 0,
            content_hash: None,
            etag: None,
            last_modified: None,
            retry_count: 0,
            last_error: None,
            discovered_at: now,
            created_at: now,
            updated_at: now,
        };
        rows.insert(row.id, row);
        Ok(())
    }

    async fn claim(&self) -> Result<Option<FrontierUrl>, StoreError> {
        let now = Utc::now();
        let mut rows = self.rows.lock().unwrap();

        let mut candidates: Vec<&FrontierUrl> = rows
            .values()
            .filter(|r| {
                r.status == UrlStatus::Pending
                    && r.next_fetch_at <= now
                    && self.host_allows(&r.host, now)
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.next_fetch_at.cmp(&b.next_fetch_at))
        });

        let Some(id) = candidates.first().map(|r| r.id) else {
            return Ok(None);
        };
        let row = rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        row.status = UrlStatus::Fetching;
        row.updated_at = now;
        Ok(Some(row.clone()))
    }

    async fn update_fetched(&self, id: Uuid, outcome: FetchOutcome) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .get_mut(&id)
            .filter(|r| r.status == UrlStatus::Fetching)
            .ok_or(StoreError::NotFound(id))?;
        row.status = UrlStatus::Fetched;
        row.last_fetched_at = Some(Utc::now());
        row.fetch_count += 1;
        row.retry_count = 0;
        if outcome.content_hash.is_some() {
            row.content_hash = outcome.content_hash;
        }
        if outcome.etag.is_some() {
            row.etag = outcome.etag;
        }
        if outcome.last_modified.is_some() {
            row.last_modified = outcome.last_modified;
        }
        row.last_error = None;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn update_fetched_with_final_url(
        &self,
        id: Uuid,
        final_url: &str,
        final_url_hash: &str,
        final_host: &str,
        outcome: FetchOutcome,
    ) -> Result<(), StoreError> {
        let collides = {
            let rows = self.rows.lock().unwrap();
            rows.values()
                .any(|r| r.id != id && r.url_hash == final_url_hash)
        };
        if collides {
            return self.update_fetched(id, outcome).await;
        }

        {
            let mut rows = self.rows.lock().unwrap();
            let row = rows
                .get_mut(&id)
                .filter(|r| r.status == UrlStatus::Fetching)
                .ok_or(StoreError::NotFound(id))?;
            row.url = final_url.to_string();
            row.url_hash = final_url_hash.to_string();
            row.host = final_host.to_string();
        }
        self.update_fetched(id, outcome).await
    }

    async fn update_failed(
        &self,
        id: Uuid,
        error: &str,
        max_retries: i32,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .get_mut(&id)
            .filter(|r| r.status == UrlStatus::Fetching)
            .ok_or(StoreError::NotFound(id))?;
        let old_retry_count = row.retry_count;
        row.retry_count += 1;
        row.last_error = Some(error.to_string());
        if row.retry_count >= max_retries {
            row.status = UrlStatus::Dead;
        } else {
            row.status = UrlStatus::Pending;
            row.next_fetch_at =
                Utc::now() + Duration::minutes(2i64.pow(old_retry_count.min(16) as u32));
        }
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn update_dead(&self, id: Uuid, reason: &str) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .get_mut(&id)
            .filter(|r| r.status != UrlStatus::Dead)
            .ok_or(StoreError::NotFound(id))?;
        row.status = UrlStatus::Dead;
        row.last_error = Some(reason.to_string());
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn reset_for_retry(&self, id: Uuid) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if row.status != UrlStatus::Dead {
            return Err(StoreError::WrongState {
                id,
                expected: "dead",
                actual: row.status.as_str().to_string(),
            });
        }
        row.status = UrlStatus::Pending;
        row.retry_count = 0;
        row.next_fetch_at = Utc::now();
        row.last_error = None;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn list(
        &self,
        filter: FrontierFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FrontierUrl>, StoreError> {
        let rows = self.rows.lock().unwrap();
        let mut matched: Vec<FrontierUrl> = rows
            .values()
            .filter(|r| {
                filter.status.map_or(true, |s| r.status == s)
                    && filter.host.as_deref().map_or(true, |h| r.host == h)
                    && filter.source_id.map_or(true, |s| r.source_id == s)
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.next_fetch_at.cmp(&b.next_fetch_at))
        });
        Ok(matched
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn stats(&self) -> Result<FrontierStats, StoreError> {
        let rows = self.rows.lock().unwrap();
        let mut stats = FrontierStats::default();
        for row in rows.values() {
            match row.status {
                UrlStatus::Pending => stats.pending += 1,
                UrlStatus::Fetching => stats.fetching += 1,
                UrlStatus::Fetched => stats.fetched += 1,
                UrlStatus::Failed => stats.failed += 1,
                UrlStatus::Dead => stats.dead += 1,
            }
        }
        Ok(stats)
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        rows.remove(&id).ok_or(StoreError::NotFound(id))?;
        Ok(())
    }

    async fn cleanup_terminal(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|_, r| {
            !(matches!(r.status, UrlStatus::Fetched | UrlStatus::Dead)
                && r.updated_at < older_than)
        });
        Ok((before - rows.len()) as u64)
    }

    async fn recover_stale(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let mut recovered = 0;
        for row in rows.values_mut() {
            if row.status == UrlStatus::Fetching && row.updated_at < older_than {
                row.status = UrlStatus::Pending;
                row.updated_at = Utc::now();
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}

#[derive(Default)]
pub struct MemoryFeedStateStore {
    states: Mutex<HashMap<Uuid, FeedState>>,
}

impl MemoryFeedStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, source_id: Uuid) -> Option<FeedState> {
        self.states.lock().unwrap().get(&source_id).cloned()
    }

    /// Test hook: place a feed state row directly.
    pub fn insert(&self, state: FeedState) {
        self.states.lock().unwrap().insert(state.source_id, state);
    }
}

#[async_trait]
impl FeedStateStore for MemoryFeedStateStore {
    async fn get_or_create(
        &self,
        source_id: Uuid,
        feed_url: &str,
    ) -> Result<FeedState, StoreError> {
        let mut states = self.states.lock().unwrap();
        let state = states.entry(source_id).or_insert_with(|| {
            let now = Utc::now();
            FeedState {
                source_id,
                feed_url: feed_url.to_string(),
                last_polled_at: None,
                last_etag: None,
                last_modified: None,
                last_item_count: 0,
                consecutive_errors: 0,
                last_error: None,
                last_error_type: None,
                created_at: now,
                updated_at: now,
            }
        });
        state.feed_url = feed_url.to_string();
        Ok(state.clone())
    }

    async fn update_success(
        &self,
        source_id: Uuid,
        etag: Option<&str>,
        last_modified: Option<&str>,
        item_count: i32,
    ) -> Result<(), StoreError> {
        let mut states = self.states.lock().unwrap();
        let state = states
            .get_mut(&source_id)
            .ok_or(StoreError::NotFound(source_id))?;
        state.last_polled_at = Some(Utc::now());
        state.last_etag = etag.map(str::to_string);
        state.last_modified = last_modified.map(str::to_string);
        state.last_item_count = item_count;
        state.consecutive_errors = 0;
        state.last_error = None;
        state.last_error_type = None;
        state.updated_at = Utc::now();
        Ok(())
    }

    async fn update_error(
        &self,
        source_id: Uuid,
        error_type: &str,
        message: &str,
    ) -> Result<i32, StoreError> {
        let mut states = self.states.lock().unwrap();
        let state = states
            .get_mut(&source_id)
            .ok_or(StoreError::NotFound(source_id))?;
        state.last_polled_at = Some(Utc::now());
        state.consecutive_errors += 1;
        state.last_error = Some(message.to_string());
        state.last_error_type = Some(error_type.to_string());
        state.updated_at = Utc::now();
        Ok(state.consecutive_errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UrlOrigin;

    fn submission(url: &str, priority: i32) -> UrlSubmission {
        let normalized = crate::normalize::normalize_url(url).unwrap();
        UrlSubmission::new(
            normalized.url,
            normalized.url_hash,
            normalized.host,
            Uuid::new_v4(),
            UrlOrigin::Feed,
        )
        .with_priority(priority)
    }

    #[tokio::test]
    async fn resubmission_merges_priority_and_schedule() {
        let store = MemoryFrontierStore::new();
        let first = submission("https://example.com/a", 1);
        let hash = first.url_hash.clone();
        store.submit(first).await.unwrap();

        let earlier = Utc::now() - Duration::minutes(5);
        let mut second = submission("https://example.com/a", 7);
        second.next_fetch_at = earlier;
        store.submit(second).await.unwrap();

        let row = store.get_by_hash(&hash).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(row.priority, 7);
        assert!(row.next_fetch_at <= earlier + Duration::seconds(1));
        assert_eq!(row.status, UrlStatus::Pending);
    }

    #[tokio::test]
    async fn dead_rows_are_not_revived_by_submission() {
        let store = MemoryFrontierStore::new();
        let sub = submission("https://example.com/a", 1);
        let hash = sub.url_hash.clone();
        store.submit(sub).await.unwrap();

        let claimed = store.claim().await.unwrap().unwrap();
        store.update_dead(claimed.id, "robots_disallowed").await.unwrap();

        store.submit(submission("https://example.com/a", 99)).await.unwrap();
        let row = store.get_by_hash(&hash).unwrap();
        assert_eq!(row.status, UrlStatus::Dead);
        assert_eq!(row.priority, 1);
    }

    #[tokio::test]
    async fn concurrent_claims_return_disjoint_rows() {
        let store = Arc::new(MemoryFrontierStore::new());
        for i in 0..10 {
            store
                .submit(submission(&format!("https://host{i}.example/p"), i))
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.claim().await.unwrap() }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            let row = handle.await.unwrap().expect("each claimer gets a row");
            ids.push(row.id);
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 10);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.fetching, 10);
    }

    #[tokio::test]
    async fn serialized_claims_follow_priority_order() {
        let store = MemoryFrontierStore::new();
        for i in 1..=3 {
            store
                .submit(submission(&format!("https://host{i}.example/p"), i))
                .await
                .unwrap();
        }
        let first = store.claim().await.unwrap().unwrap();
        let second = store.claim().await.unwrap().unwrap();
        let third = store.claim().await.unwrap().unwrap();
        assert_eq!(first.priority, 3);
        assert_eq!(second.priority, 2);
        assert_eq!(third.priority, 1);
    }

    #[tokio::test]
    async fn politeness_gates_claims_until_delay_elapses() {
        let hosts = Arc::new(MemoryHostStore::new());
        let store = MemoryFrontierStore::with_hosts(hosts.clone());
        store
            .submit(submission("https://slow.example/p", 1))
            .await
            .unwrap();

        let now = Utc::now();
        hosts.insert(HostState {
            host: "slow.example".to_string(),
            last_fetch_at: Some(now),
            min_delay_ms: 5000,
            robots_txt: None,
            robots_fetched_at: None,
            robots_ttl_hours: 24,
            created_at: now,
            updated_at: now,
        });

        assert!(store.claim().await.unwrap().is_none());

        // Simulate the delay having elapsed.
        hosts.insert(HostState {
            host: "slow.example".to_string(),
            last_fetch_at: Some(now - Duration::milliseconds(5001)),
            min_delay_ms: 5000,
            robots_txt: None,
            robots_fetched_at: None,
            robots_ttl_hours: 24,
            created_at: now,
            updated_at: now,
        });
        assert!(store.claim().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failures_back_off_then_go_dead() {
        let store = MemoryFrontierStore::new();
        store
            .submit(submission("https://example.com/flaky", 1))
            .await
            .unwrap();

        // First failure: back to pending with ~1 minute backoff.
        let row = store.claim().await.unwrap().unwrap();
        store.update_failed(row.id, "timeout", 3).await.unwrap();
        let after_first = store.get(row.id).unwrap();
        assert_eq!(after_first.status, UrlStatus::Pending);
        assert_eq!(after_first.retry_count, 1);
        let delta = after_first.next_fetch_at - Utc::now();
        assert!(delta > Duration::seconds(55) && delta < Duration::seconds(65));

        // Force the row claimable again and fail twice more.
        for expected_retry in 2..=3 {
            {
                let mut rows = store.rows.lock().unwrap();
                let r = rows.get_mut(&row.id).unwrap();
                r.next_fetch_at = Utc::now() - Duration::seconds(1);
            }
            let claimed = store.claim().await.unwrap().unwrap();
            store.update_failed(claimed.id, "timeout", 3).await.unwrap();
            assert_eq!(store.get(row.id).unwrap().retry_count, expected_retry);
        }

        let final_row = store.get(row.id).unwrap();
        assert_eq!(final_row.status, UrlStatus::Dead);
    }

    #[tokio::test]
    async fn reset_for_retry_requires_dead() {
        let store = MemoryFrontierStore::new();
        store
            .submit(submission("https://example.com/a", 1))
            .await
            .unwrap();
        let row = store.claim().await.unwrap().unwrap();

        let err = store.reset_for_retry(row.id).await.unwrap_err();
        assert!(matches!(err, StoreError::WrongState { .. }));

        store.update_dead(row.id, "gone").await.unwrap();
        store.reset_for_retry(row.id).await.unwrap();
        let revived = store.get(row.id).unwrap();
        assert_eq!(revived.status, UrlStatus::Pending);
        assert_eq!(revived.retry_count, 0);
    }

    #[tokio::test]
    async fn redirect_collision_falls_back_to_plain_fetched() {
        let store = MemoryFrontierStore::new();
        store
            .submit(submission("https://example.com/old", 1))
            .await
            .unwrap();
        store
            .submit(submission("https://example.com/new", 1))
            .await
            .unwrap();

        let target = crate::normalize::normalize_url("https://example.com/new").unwrap();
        let old = store.get_by_hash(
            &crate::normalize::normalize_url("https://example.com/old")
                .unwrap()
                .url_hash,
        )
        .unwrap();

        // Claim rows until we hold the /old row.
        let mut claimed = store.claim().await.unwrap().unwrap();
        if claimed.id != old.id {
            claimed = store.claim().await.unwrap().unwrap();
        }
        assert_eq!(claimed.id, old.id);

        store
            .update_fetched_with_final_url(
                old.id,
                &target.url,
                &target.url_hash,
                &target.host,
                FetchOutcome::default(),
            )
            .await
            .unwrap();

        // The original row keeps its URL; the duplicate row wins the hash.
        let kept = store.get(old.id).unwrap();
        assert_eq!(kept.status, UrlStatus::Fetched);
        assert!(kept.url.ends_with("/old"));
    }
}
