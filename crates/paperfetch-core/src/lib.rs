use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod config_file;
pub mod durable;
pub mod ephemeral;
pub mod key;
pub mod orchestrator;
pub mod rate_limit;
pub mod retry;
pub mod upstream;

// Re-export for convenience
pub use durable::{DurableError, DurableStore, MemoryStore, SqliteStore};
pub use ephemeral::{EphemeralCache, EphemeralLimits};
pub use key::{SearchFilters, derive_key};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use rate_limit::RateLimiter;
pub use retry::{Classify, ErrorClass, RetryPolicy};
pub use upstream::{UpstreamClient, UpstreamError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    pub author_id: Option<String>,
    pub name: String,
}

/// One bibliographic record, keyed by its stable upstream id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Paper {
    pub paper_id: String,
    pub title: String,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    pub year: Option<i32>,
    pub venue: Option<String>,
    pub citation_count: Option<u64>,
    #[serde(default)]
    pub authors: Vec<Author>,
    pub url: Option<String>,
    pub pdf_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A cached search: the ordered papers resolved for one query key, plus the
/// counts recorded when they were fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchCacheEntry {
    pub query_key: String,
    pub query: String,
    pub results: Vec<Paper>,
    pub total_requested: usize,
    pub successful_count: usize,
    pub rate_limited_count: usize,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SearchCacheEntry {
    /// Build an entry stamped at `now` that expires `ttl` later.
    ///
    /// A zero TTL is raised to one millisecond so `expires_at > updated_at`
    /// always holds.
    pub fn new(
        query_key: String,
        query: String,
        results: Vec<Paper>,
        total_requested: usize,
        rate_limited_count: usize,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        let ttl = chrono::Duration::from_std(ttl.max(Duration::from_millis(1)))
            .unwrap_or(chrono::Duration::MAX);
        let expires_at = now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            query_key,
            query,
            successful_count: results.len(),
            results,
            total_requested,
            rate_limited_count,
            updated_at: now,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Time left before expiry, or `None` once expired.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
        (self.expires_at - now)
            .to_std()
            .ok()
            .filter(|d| !d.is_zero())
    }
}

/// Where the papers of a [`CacheResult`] came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Ephemeral,
    Durable,
    Upstream,
    #[default]
    None,
}

/// Why a call returned no fresh results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchFailure {
    pub class: ErrorClass,
    /// Offending input field, for validation failures.
    pub field: Option<String>,
    pub message: String,
}

impl FetchFailure {
    pub fn from_upstream(err: &UpstreamError) -> Self {
        let field = match err {
            UpstreamError::Validation { field, .. } => Some(field.clone()),
            _ => None,
        };
        Self {
            class: err.class(),
            field,
            message: err.to_string(),
        }
    }
}

/// The result of one orchestrated search.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheResult {
    /// Every resolved paper, in upstream order, whatever its source.
    pub successful: Vec<Paper>,
    /// The subset of `successful` that was already cached before this call.
    pub from_cache: Vec<Paper>,
    /// Items lost to upstream throttling.
    pub rate_limited: usize,
    pub total_requested: usize,
    pub source: ResultSource,
    /// Set when the upstream fetch failed outright. `None` with an empty
    /// `successful` means a genuine zero-result search.
    pub failure: Option<FetchFailure>,
}

impl CacheResult {
    /// A result served entirely from a cached search entry.
    pub fn cached(entry: SearchCacheEntry, source: ResultSource) -> Self {
        Self {
            from_cache: entry.results.clone(),
            successful: entry.results,
            rate_limited: entry.rate_limited_count,
            total_requested: entry.total_requested,
            source,
            failure: None,
        }
    }

    pub fn failed(total_requested: usize, rate_limited: usize, failure: FetchFailure) -> Self {
        Self {
            rate_limited,
            total_requested,
            failure: Some(failure),
            ..Default::default()
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.failure.is_some() || self.rate_limited > 0
    }
}

/// Ephemeral-tier statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub total_size_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Default minimum spacing between upstream requests with an API key.
pub const DEFAULT_MIN_INTERVAL_MS: u64 = 1000;

/// Default minimum spacing between upstream requests without an API key.
pub const DEFAULT_MIN_INTERVAL_NO_KEY_MS: u64 = 3000;

/// Runtime configuration.
#[derive(Clone)]
pub struct Config {
    pub s2_api_key: Option<String>,
    pub base_url: String,
    pub request_timeout_secs: u64,
    /// Minimum request spacing. `None` picks a default based on whether an
    /// API key is configured.
    pub min_interval_ms: Option<u64>,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub safe_max_limit: usize,
    pub sort: Option<String>,
    /// Path to the SQLite durable store. In-memory when unset.
    pub cache_path: Option<PathBuf>,
    pub search_ttl_secs: u64,
    pub ephemeral_max_entries: usize,
    pub ephemeral_max_bytes: usize,
    pub ephemeral_ttl_secs: u64,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("s2_api_key", &self.s2_api_key.as_ref().map(|_| "***"))
            .field("base_url", &self.base_url)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("min_interval_ms", &self.min_interval_ms)
            .field("max_retries", &self.max_retries)
            .field("retry_base_delay_ms", &self.retry_base_delay_ms)
            .field("safe_max_limit", &self.safe_max_limit)
            .field("sort", &self.sort)
            .field("cache_path", &self.cache_path)
            .field("search_ttl_secs", &self.search_ttl_secs)
            .field("ephemeral_max_entries", &self.ephemeral_max_entries)
            .field("ephemeral_max_bytes", &self.ephemeral_max_bytes)
            .field("ephemeral_ttl_secs", &self.ephemeral_ttl_secs)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            s2_api_key: None,
            base_url: upstream::semantic_scholar::DEFAULT_BASE_URL.to_string(),
            request_timeout_secs: 10,
            min_interval_ms: None,
            max_retries: retry::DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: retry::DEFAULT_BASE_DELAY.as_millis() as u64,
            safe_max_limit: orchestrator::DEFAULT_SAFE_MAX_LIMIT,
            sort: None,
            cache_path: None,
            search_ttl_secs: orchestrator::DEFAULT_SEARCH_TTL.as_secs(),
            ephemeral_max_entries: ephemeral::DEFAULT_MAX_ENTRIES,
            ephemeral_max_bytes: ephemeral::DEFAULT_MAX_BYTES,
            ephemeral_ttl_secs: ephemeral::DEFAULT_TTL.as_secs(),
        }
    }
}

impl Config {
    /// Apply values present in a config file over the current ones.
    pub fn apply_file(&mut self, file: &config_file::ConfigFile) {
        if let Some(keys) = &file.api_keys
            && let Some(key) = &keys.s2_api_key
        {
            self.s2_api_key = Some(key.clone());
        }
        if let Some(cache) = &file.cache {
            if let Some(path) = &cache.path {
                self.cache_path = Some(PathBuf::from(path));
            }
            if let Some(v) = cache.search_ttl_secs {
                self.search_ttl_secs = v;
            }
            if let Some(v) = cache.max_entries {
                self.ephemeral_max_entries = v;
            }
            if let Some(v) = cache.max_bytes {
                self.ephemeral_max_bytes = v;
            }
            if let Some(v) = cache.ttl_secs {
                self.ephemeral_ttl_secs = v;
            }
        }
        if let Some(up) = &file.upstream {
            if let Some(url) = &up.base_url {
                self.base_url = url.clone();
            }
            if let Some(v) = up.timeout_secs {
                self.request_timeout_secs = v;
            }
            if let Some(v) = up.min_interval_ms {
                self.min_interval_ms = Some(v);
            }
            if let Some(v) = up.max_retries {
                self.max_retries = v;
            }
            if let Some(v) = up.retry_base_delay_ms {
                self.retry_base_delay_ms = v;
            }
            if let Some(v) = up.safe_max_limit {
                self.safe_max_limit = v;
            }
            if let Some(sort) = &up.sort {
                self.sort = Some(sort.clone());
            }
        }
    }

    /// The settings as a config file. The API key is left out.
    pub fn to_config_file(&self) -> config_file::ConfigFile {
        use config_file::{CacheConfig, ConfigFile, UpstreamConfig};
        ConfigFile {
            api_keys: None,
            cache: Some(CacheConfig {
                path: self.cache_path.as_ref().map(|p| p.display().to_string()),
                search_ttl_secs: Some(self.search_ttl_secs),
                max_entries: Some(self.ephemeral_max_entries),
                max_bytes: Some(self.ephemeral_max_bytes),
                ttl_secs: Some(self.ephemeral_ttl_secs),
            }),
            upstream: Some(UpstreamConfig {
                base_url: Some(self.base_url.clone()),
                timeout_secs: Some(self.request_timeout_secs),
                min_interval_ms: self.min_interval_ms,
                max_retries: Some(self.max_retries),
                retry_base_delay_ms: Some(self.retry_base_delay_ms),
                safe_max_limit: Some(self.safe_max_limit),
                sort: self.sort.clone(),
            }),
        }
    }

    /// Apply `S2_API_KEY` and `PAPERFETCH_CACHE_PATH` from the process
    /// environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    /// Like [`apply_env`](Config::apply_env) with a custom variable lookup.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("S2_API_KEY").filter(|k| !k.trim().is_empty()) {
            self.s2_api_key = Some(key);
        }
        if let Some(path) = lookup("PAPERFETCH_CACHE_PATH").filter(|p| !p.trim().is_empty()) {
            self.cache_path = Some(PathBuf::from(path));
        }
    }

    /// The request spacing actually enforced.
    pub fn effective_min_interval(&self) -> Duration {
        let ms = self.min_interval_ms.unwrap_or(if self.s2_api_key.is_some() {
            DEFAULT_MIN_INTERVAL_MS
        } else {
            DEFAULT_MIN_INTERVAL_NO_KEY_MS
        });
        Duration::from_millis(ms)
    }

    pub fn ephemeral_limits(&self) -> EphemeralLimits {
        EphemeralLimits {
            max_entries: self.ephemeral_max_entries,
            max_bytes: self.ephemeral_max_bytes,
            default_ttl: Duration::from_secs(self.ephemeral_ttl_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.retry_base_delay_ms),
        )
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            safe_max_limit: self.safe_max_limit,
            search_ttl: Duration::from_secs(self.search_ttl_secs),
            sort: self.sort.clone(),
        }
    }
}

/// Build a [`DurableStore`] from configuration.
///
/// If `cache_path` is set, opens a SQLite-backed store there. Otherwise, or
/// if the database cannot be opened, returns an in-memory store.
pub fn build_durable_store(cache_path: Option<&Path>) -> Arc<dyn DurableStore> {
    if let Some(path) = cache_path {
        match SqliteStore::open(path) {
            Ok(store) => {
                tracing::info!(path = %path.display(), "opened durable cache");
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to open durable cache, falling back to in-memory"
                );
            }
        }
    }
    Arc::new(MemoryStore::new())
}

/// Wire an [`Orchestrator`] against the Semantic Scholar API.
pub fn build_orchestrator(config: &Config) -> Orchestrator {
    let client = upstream::semantic_scholar::SemanticScholarClient::new(
        config.base_url.clone(),
        config.s2_api_key.clone(),
        Duration::from_secs(config.request_timeout_secs),
    );
    Orchestrator::new(
        EphemeralCache::new(config.ephemeral_limits()),
        build_durable_store(config.cache_path.as_deref()),
        Arc::new(client),
        Arc::new(RateLimiter::new(config.effective_min_interval())),
        config.retry_policy(),
        config.orchestrator_config(),
    )
}
