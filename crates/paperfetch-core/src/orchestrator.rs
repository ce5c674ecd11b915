//! Fetch orchestration across the ephemeral tier, the durable tier and the
//! upstream provider.
//!
//! A search walks: ephemeral lookup, durable lookup, rate-limit wait, upstream
//! fetch (retried), sequential per-item resolution, write-back. Either cache
//! lookup short-circuits on a hit. Upstream failures never escape as errors;
//! they come back as a [`CacheResult`] with `failure` set.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::durable::DurableStore;
use crate::ephemeral::EphemeralCache;
use crate::key::{SearchFilters, derive_key, paper_slot, search_slot};
use crate::rate_limit::RateLimiter;
use crate::retry::{Classify, ErrorClass, RetryPolicy};
use crate::upstream::{RawItem, SearchParams, UpstreamClient, UpstreamError};
use crate::{CacheResult, CacheStats, FetchFailure, Paper, ResultSource, SearchCacheEntry};

/// Upper bound on the per-request limit sent upstream. Larger pages were
/// observed to time out.
pub const DEFAULT_SAFE_MAX_LIMIT: usize = 25;

/// Lifetime of a cached search.
pub const DEFAULT_SEARCH_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub safe_max_limit: usize,
    pub search_ttl: Duration,
    /// Provider sort expression passed with every search.
    pub sort: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            safe_max_limit: DEFAULT_SAFE_MAX_LIMIT,
            search_ttl: DEFAULT_SEARCH_TTL,
            sort: None,
        }
    }
}

/// How a single search item was resolved.
enum Resolved {
    Cached(Paper),
    Fresh(Paper),
}

pub struct Orchestrator {
    ephemeral: EphemeralCache,
    durable: Arc<dyn DurableStore>,
    upstream: Arc<dyn UpstreamClient>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        ephemeral: EphemeralCache,
        durable: Arc<dyn DurableStore>,
        upstream: Arc<dyn UpstreamClient>,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            ephemeral,
            durable,
            upstream,
            limiter,
            retry,
            config,
        }
    }

    pub fn ephemeral(&self) -> &EphemeralCache {
        &self.ephemeral
    }

    pub fn durable(&self) -> &Arc<dyn DurableStore> {
        &self.durable
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Search without filters.
    pub async fn search_with_caching(&self, query: &str, limit: usize) -> CacheResult {
        self.search_with_filters(query, limit, &SearchFilters::default())
            .await
    }

    /// Search with provider-side filters. Filters are part of the cache key,
    /// so filtered and unfiltered searches never share an entry.
    pub async fn search_with_filters(
        &self,
        query: &str,
        limit: usize,
        filters: &SearchFilters,
    ) -> CacheResult {
        if let Err(e) = validate(query, limit) {
            tracing::debug!(error = %e, "rejected search input");
            return CacheResult::failed(limit, 0, FetchFailure::from_upstream(&e));
        }

        let key = derive_key(query, limit, Some(filters));
        let slot = search_slot(&key);

        if let Some(entry) = self.ephemeral.get::<SearchCacheEntry>(&slot) {
            if !entry.is_expired(Utc::now()) {
                tracing::trace!(%key, "ephemeral hit");
                return CacheResult::cached(entry, ResultSource::Ephemeral);
            }
            self.ephemeral.delete(&slot);
        }

        match self.durable.get_by_key(&key).await {
            Ok(Some(entry)) => {
                let now = Utc::now();
                if let Some(ttl) = entry.remaining_ttl(now) {
                    tracing::trace!(%key, "durable hit");
                    self.ephemeral.set(&slot, &entry, Some(ttl));
                    return CacheResult::cached(entry, ResultSource::Durable);
                }
                tracing::debug!(%key, expired_at = %entry.expires_at, "durable entry expired");
            }
            Ok(None) => tracing::trace!(%key, "durable miss"),
            Err(e) => {
                tracing::warn!(
                    %key,
                    store = self.durable.name(),
                    error = %e,
                    "durable lookup failed, fetching upstream"
                );
            }
        }

        self.fetch(query, limit, filters, key).await
    }

    /// Drop ephemeral entries whose key contains `pattern` (all when `None`).
    pub fn clear_cache(&self, pattern: Option<&str>) -> usize {
        let removed = self.ephemeral.clear(pattern);
        tracing::info!(removed, pattern = pattern.unwrap_or("*"), "cleared ephemeral cache");
        removed
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        self.ephemeral.stats()
    }

    async fn fetch(
        &self,
        query: &str,
        limit: usize,
        filters: &SearchFilters,
        key: String,
    ) -> CacheResult {
        let upstream_limit = limit.min(self.config.safe_max_limit);
        if upstream_limit < limit {
            tracing::debug!(requested = limit, upstream_limit, "clamped search limit");
        }
        let params = SearchParams {
            limit: upstream_limit,
            sort: self.config.sort.clone(),
            filters: filters.clone(),
        };

        self.limiter.wait_for_next_request().await;
        let response = match self
            .retry
            .execute(|| self.upstream.search(query, &params))
            .await
        {
            Ok(response) => response,
            Err(e) => return self.batch_failure(query, limit, &e),
        };

        tracing::debug!(
            query,
            returned = response.results.len(),
            total = response.count,
            upstream = self.upstream.name(),
            "upstream search complete"
        );

        let now = Utc::now();
        let mut successful = Vec::with_capacity(response.results.len());
        let mut from_cache = Vec::new();
        let mut rate_limited = 0usize;

        // Sequential: hydrating stubs goes through the shared rate limiter.
        for raw in response.results {
            let Some(paper_id) = raw.id().map(str::to_string) else {
                tracing::warn!(query, "skipping result without paperId");
                continue;
            };
            match self.resolve_item(&paper_id, raw, now).await {
                Ok(Resolved::Cached(paper)) => {
                    from_cache.push(paper.clone());
                    successful.push(paper);
                }
                Ok(Resolved::Fresh(paper)) => successful.push(paper),
                Err(e) if e.class() == ErrorClass::RateLimited => {
                    self.limiter.on_rate_limited();
                    rate_limited += 1;
                    tracing::debug!(%paper_id, "item rate limited, skipping");
                }
                Err(e) => {
                    tracing::warn!(%paper_id, error = %e, "failed to resolve item, skipping");
                }
            }
        }

        let entry = SearchCacheEntry::new(
            key,
            query.to_string(),
            successful.clone(),
            limit,
            rate_limited,
            Utc::now(),
            self.config.search_ttl,
        );
        if let Err(e) = self.durable.upsert(&entry).await {
            tracing::warn!(key = %entry.query_key, error = %e, "durable write-back failed");
        }
        self.ephemeral.set(
            &search_slot(&entry.query_key),
            &entry,
            Some(self.config.search_ttl),
        );

        CacheResult {
            successful,
            from_cache,
            rate_limited,
            total_requested: limit,
            source: ResultSource::Upstream,
            failure: None,
        }
    }

    fn batch_failure(&self, query: &str, limit: usize, err: &UpstreamError) -> CacheResult {
        let failure = FetchFailure::from_upstream(err);
        if failure.class == ErrorClass::RateLimited {
            self.limiter.on_rate_limited();
            tracing::warn!(query, error = %err, "upstream search throttled");
            CacheResult::failed(limit, limit, failure)
        } else {
            tracing::warn!(query, class = %failure.class, error = %err, "upstream search failed");
            CacheResult::failed(limit, 0, failure)
        }
    }

    /// Resolve one search item: paper caches first, then the item itself,
    /// hydrating stubs by id.
    async fn resolve_item(
        &self,
        paper_id: &str,
        raw: RawItem,
        now: DateTime<Utc>,
    ) -> Result<Resolved, UpstreamError> {
        let slot = paper_slot(paper_id);
        if let Some(paper) = self.ephemeral.get::<Paper>(&slot) {
            return Ok(Resolved::Cached(paper));
        }
        match self.durable.get_paper_by_id(paper_id).await {
            Ok(Some(paper)) => {
                self.ephemeral.set(&slot, &paper, None);
                return Ok(Resolved::Cached(paper));
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(paper_id, error = %e, "durable paper lookup failed");
            }
        }

        let raw = if raw.is_stub() {
            self.limiter.wait_for_next_request().await;
            self.upstream.get_by_id(paper_id).await?
        } else {
            raw
        };
        let paper = raw.into_paper(now)?;

        if let Err(e) = self.durable.upsert_paper(&paper).await {
            tracing::warn!(paper_id, error = %e, "durable paper write failed");
        }
        self.ephemeral.set(&paper_slot(&paper.paper_id), &paper, None);
        Ok(Resolved::Fresh(paper))
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("durable", &self.durable.name())
            .field("upstream", &self.upstream.name())
            .field("limiter", &self.limiter)
            .field("retry", &self.retry)
            .field("config", &self.config)
            .finish()
    }
}

fn validate(query: &str, limit: usize) -> Result<(), UpstreamError> {
    if query.trim().is_empty() {
        return Err(UpstreamError::validation("query", "query must not be empty"));
    }
    if limit == 0 {
        return Err(UpstreamError::validation("limit", "limit must be at least 1"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::MemoryStore;
    use crate::test_support::paper;
    use crate::upstream::mock::{MockSearch, MockUpstream, raw_item, raw_items, stub_item};
    use tokio::time::Instant;

    struct Harness {
        orch: Orchestrator,
        upstream: Arc<MockUpstream>,
        store: Arc<MemoryStore>,
    }

    fn harness(upstream: MockUpstream) -> Harness {
        harness_with(upstream, RetryPolicy::none(), Duration::ZERO)
    }

    fn harness_with(upstream: MockUpstream, retry: RetryPolicy, interval: Duration) -> Harness {
        let upstream = Arc::new(upstream);
        let store = Arc::new(MemoryStore::new());
        let orch = Orchestrator::new(
            EphemeralCache::default(),
            store.clone(),
            upstream.clone(),
            Arc::new(RateLimiter::new(interval)),
            retry,
            OrchestratorConfig::default(),
        );
        Harness {
            orch,
            upstream,
            store,
        }
    }

    fn ids(papers: &[Paper]) -> Vec<&str> {
        papers.iter().map(|p| p.paper_id.as_str()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn cold_fetch_then_ephemeral_hit() {
        let h = harness(MockUpstream::with_items(raw_items(10)));

        let first = h.orch.search_with_caching("graph neural networks", 10).await;
        assert_eq!(first.successful.len(), 10);
        assert!(first.from_cache.is_empty());
        assert_eq!(first.source, ResultSource::Upstream);
        assert!(first.failure.is_none());

        let second = h.orch.search_with_caching("graph neural networks", 10).await;
        assert_eq!(second.source, ResultSource::Ephemeral);
        assert_eq!(second.from_cache.len(), 10);
        assert_eq!(ids(&second.successful), ids(&first.successful));
        assert_eq!(h.upstream.total_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_ephemeral_tier_serves_from_durable() {
        let upstream = Arc::new(MockUpstream::with_items(raw_items(3)));
        let store = Arc::new(MemoryStore::new());
        let orch = Orchestrator::new(
            EphemeralCache::disabled(),
            store.clone(),
            upstream.clone(),
            Arc::new(RateLimiter::new(Duration::ZERO)),
            RetryPolicy::none(),
            OrchestratorConfig::default(),
        );
        assert!(!orch.ephemeral().is_available());

        let first = orch.search_with_caching("climate models", 3).await;
        assert_eq!(first.successful.len(), 3);
        assert_eq!(first.source, ResultSource::Upstream);
        assert_eq!(store.entry_count(), 1);

        let second = orch.search_with_caching("climate models", 3).await;
        assert_eq!(second.source, ResultSource::Durable);
        assert_eq!(second.from_cache.len(), 3);
        assert_eq!(ids(&second.successful), ids(&first.successful));
        assert_eq!(upstream.total_calls(), 1);
        assert_eq!(orch.get_cache_stats().total_entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cosmetic_query_variants_share_a_key() {
        let h = harness(MockUpstream::with_items(raw_items(3)));
        h.orch.search_with_caching("Deep  Learning", 3).await;
        let again = h.orch.search_with_caching("deep learning ", 3).await;
        assert_eq!(again.source, ResultSource::Ephemeral);
        assert_eq!(h.upstream.search_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn limit_is_clamped_upstream_only() {
        let h = harness(MockUpstream::with_items(raw_items(40)));
        let result = h.orch.search_with_caching("transformers", 100).await;
        assert_eq!(h.upstream.last_params().unwrap().limit, DEFAULT_SAFE_MAX_LIMIT);
        assert_eq!(result.successful.len(), 25);
        assert_eq!(result.total_requested, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_item_is_counted_and_skipped() {
        let items = vec![
            raw_item("p0"),
            raw_item("p1"),
            stub_item("p2"),
            raw_item("p3"),
            raw_item("p4"),
        ];
        let upstream = MockUpstream::with_items(items).with_paper(
            "p2",
            Err(UpstreamError::RateLimited { retry_after: None }),
        );
        let h = harness(upstream);

        let result = h.orch.search_with_caching("partial", 5).await;
        assert_eq!(ids(&result.successful), vec!["p0", "p1", "p3", "p4"]);
        assert_eq!(result.rate_limited, 1);
        assert!(result.rate_limited + result.successful.len() <= result.total_requested);
        assert!(result.failure.is_none());
        assert_eq!(h.upstream.get_calls(), 1);
        assert_eq!(h.orch.limiter().current_interval(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn stub_is_hydrated_by_id() {
        let upstream = MockUpstream::with_items(vec![stub_item("s1")])
            .with_paper("s1", Ok(raw_item("s1")));
        let h = harness(upstream);
        let result = h.orch.search_with_caching("stubs", 1).await;
        assert_eq!(result.successful.len(), 1);
        assert_eq!(result.successful[0].title, "Paper s1");
        assert_eq!(h.upstream.get_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn other_item_errors_are_skipped() {
        let items = vec![
            raw_item("p0"),
            stub_item("gone"),
            RawItem {
                title: Some("No id".into()),
                ..Default::default()
            },
            raw_item("p1"),
        ];
        let h = harness(MockUpstream::with_items(items));
        let result = h.orch.search_with_caching("skips", 4).await;
        assert_eq!(ids(&result.successful), vec!["p0", "p1"]);
        assert_eq!(result.rate_limited, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_rate_limit_reports_whole_limit() {
        let upstream = MockUpstream::new(MockSearch::Error(UpstreamError::RateLimited {
            retry_after: None,
        }));
        let h = harness_with(upstream, RetryPolicy::default(), Duration::from_millis(100));

        let result = h.orch.search_with_caching("throttled", 7).await;
        assert!(result.successful.is_empty());
        assert_eq!(result.rate_limited, 7);
        assert_eq!(result.failure.as_ref().unwrap().class, ErrorClass::RateLimited);
        assert_eq!(h.upstream.search_calls(), 1);
        assert_eq!(
            h.orch.limiter().current_interval(),
            Duration::from_millis(200)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn batch_failure_is_retried_then_reported() {
        let upstream = MockUpstream::new(MockSearch::Error(UpstreamError::Unavailable {
            status: 503,
        }));
        let retry = RetryPolicy::new(2, Duration::from_millis(10));
        let h = harness_with(upstream, retry, Duration::ZERO);

        let result = h.orch.search_with_caching("outage", 5).await;
        assert!(result.successful.is_empty());
        assert_eq!(result.rate_limited, 0);
        let failure = result.failure.unwrap();
        assert_eq!(failure.class, ErrorClass::Retryable);
        assert!(failure.message.contains("503"));
        assert_eq!(h.upstream.search_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_is_not_cached() {
        let upstream = MockUpstream::with_sequence(vec![
            MockSearch::Error(UpstreamError::Timeout),
            MockSearch::Items(raw_items(2)),
        ]);
        let h = harness(upstream);

        let failed = h.orch.search_with_caching("flaky", 2).await;
        assert!(failed.failure.is_some());
        assert_eq!(h.store.entry_count(), 0);

        let ok = h.orch.search_with_caching("flaky", 2).await;
        assert_eq!(ok.source, ResultSource::Upstream);
        assert_eq!(ok.successful.len(), 2);
        assert_eq!(h.upstream.search_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_input_touches_nothing() {
        let h = harness(MockUpstream::with_items(raw_items(1)));

        let blank = h.orch.search_with_caching("   ", 5).await;
        let failure = blank.failure.unwrap();
        assert_eq!(failure.class, ErrorClass::Validation);
        assert_eq!(failure.field.as_deref(), Some("query"));

        let zero = h.orch.search_with_caching("ok", 0).await;
        assert_eq!(zero.failure.unwrap().field.as_deref(), Some("limit"));

        assert_eq!(h.upstream.total_calls(), 0);
        assert_eq!(h.orch.get_cache_stats().misses, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn durable_hit_is_promoted() {
        let h = harness(MockUpstream::with_items(raw_items(1)));
        let key = derive_key("cached query", 2, None);
        let entry = SearchCacheEntry::new(
            key.clone(),
            "cached query".into(),
            vec![paper("d1"), paper("d2")],
            2,
            0,
            Utc::now(),
            Duration::from_secs(600),
        );
        h.store.upsert(&entry).await.unwrap();

        let first = h.orch.search_with_caching("cached query", 2).await;
        assert_eq!(first.source, ResultSource::Durable);
        assert_eq!(ids(&first.from_cache), vec!["d1", "d2"]);

        let second = h.orch.search_with_caching("cached query", 2).await;
        assert_eq!(second.source, ResultSource::Ephemeral);
        assert_eq!(h.upstream.total_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_durable_entry_is_refetched() {
        let h = harness(MockUpstream::with_items(raw_items(2)));
        let key = derive_key("old", 2, None);
        let mut entry = SearchCacheEntry::new(
            key,
            "old".into(),
            vec![paper("stale")],
            2,
            0,
            Utc::now(),
            Duration::from_secs(60),
        );
        entry.expires_at = Utc::now() - chrono::Duration::seconds(1);
        h.store.upsert(&entry).await.unwrap();

        let result = h.orch.search_with_caching("old", 2).await;
        assert_eq!(result.source, ResultSource::Upstream);
        assert_eq!(ids(&result.successful), vec!["p0", "p1"]);
        assert_eq!(h.upstream.search_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn durable_failure_falls_through() {
        let h = harness(MockUpstream::with_items(raw_items(3)));
        h.store.set_failing(true);

        let result = h.orch.search_with_caching("resilient", 3).await;
        assert_eq!(result.successful.len(), 3);
        assert!(result.failure.is_none());
        assert_eq!(h.store.entry_count(), 0);

        // Ephemeral write-back still happened.
        let again = h.orch.search_with_caching("resilient", 3).await;
        assert_eq!(again.source, ResultSource::Ephemeral);
    }

    #[tokio::test(start_paused = true)]
    async fn papers_cached_by_other_queries_count_as_from_cache() {
        let upstream = MockUpstream::with_sequence(vec![
            MockSearch::Items(vec![raw_item("a"), raw_item("b")]),
            MockSearch::Items(vec![raw_item("b"), raw_item("c"), raw_item("a")]),
        ]);
        let h = harness(upstream);

        h.orch.search_with_caching("first", 2).await;
        let second = h.orch.search_with_caching("second", 3).await;
        assert_eq!(ids(&second.successful), vec!["b", "c", "a"]);
        assert_eq!(ids(&second.from_cache), vec!["b", "a"]);
        assert_eq!(h.store.paper_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cached_paper_skips_stub_hydration() {
        let upstream = MockUpstream::with_sequence(vec![
            MockSearch::Items(vec![raw_item("x")]),
            MockSearch::Items(vec![stub_item("x")]),
        ]);
        let h = harness(upstream);
        h.orch.search_with_caching("one", 1).await;
        let second = h.orch.search_with_caching("two", 1).await;
        assert_eq!(second.from_cache.len(), 1);
        assert_eq!(h.upstream.get_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn filters_change_the_key_and_reach_upstream() {
        let h = harness(MockUpstream::with_items(raw_items(2)));
        let filters = SearchFilters {
            year: Some("2020-2023".into()),
            open_access_only: true,
            ..Default::default()
        };

        h.orch.search_with_filters("llm", 2, &filters).await;
        assert_eq!(h.upstream.last_params().unwrap().filters, filters);

        let unfiltered = h.orch.search_with_caching("llm", 2).await;
        assert_eq!(unfiltered.source, ResultSource::Upstream);

        let refiltered = h.orch.search_with_filters("llm", 2, &filters).await;
        assert_eq!(refiltered.source, ResultSource::Ephemeral);
        assert_eq!(h.upstream.search_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn upstream_calls_respect_min_interval() {
        let upstream = MockUpstream::with_items(vec![stub_item("s1"), stub_item("s2")])
            .with_paper("s1", Ok(raw_item("s1")))
            .with_paper("s2", Ok(raw_item("s2")));
        let h = harness_with(upstream, RetryPolicy::none(), Duration::from_secs(1));

        let start = Instant::now();
        let result = h.orch.search_with_caching("spaced", 2).await;
        assert_eq!(result.successful.len(), 2);
        // search + two lookups: three grants, two full intervals apart.
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert_eq!(h.upstream.total_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_cache_by_pattern() {
        let h = harness(MockUpstream::with_items(raw_items(2)));
        h.orch.search_with_caching("q", 2).await;
        // one search entry plus two papers
        assert_eq!(h.orch.get_cache_stats().total_entries, 3);

        assert_eq!(h.orch.clear_cache(Some("search:")), 1);
        assert_eq!(h.orch.get_cache_stats().total_entries, 2);

        // The durable tier still has the entry.
        let result = h.orch.search_with_caching("q", 2).await;
        assert_eq!(result.source, ResultSource::Durable);

        assert_eq!(h.orch.clear_cache(None), 3);
        assert_eq!(h.orch.get_cache_stats().total_entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_track_hit_rate() {
        let h = harness(MockUpstream::with_items(raw_items(1)));
        h.orch.search_with_caching("stats", 1).await;
        h.orch.search_with_caching("stats", 1).await;
        let stats = h.orch.get_cache_stats();
        assert!(stats.hits >= 1);
        assert!(stats.hit_rate > 0.0 && stats.hit_rate <= 1.0);
        assert!(stats.total_size_bytes > 0);
    }
}
