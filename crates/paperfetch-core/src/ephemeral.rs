//! Bounded, process-local cache tier.
//!
//! Values are serialized to JSON and wrapped in a [`CacheEnvelope`] carrying
//! the last access time and the expiry (both epoch milliseconds). The tier is
//! bounded by entry count and by total serialized size; whenever a `set`
//! pushes it past either bound, a sweep drops the least recently used ~20%
//! of entries in one batch.
//!
//! Nothing here ever returns an error. Serialization problems, oversized
//! values and an unavailable backing store all degrade to a logged no-op,
//! so callers can treat a miss and a failure the same way.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{CacheStats, now_millis};

/// Default maximum number of entries.
pub const DEFAULT_MAX_ENTRIES: usize = 500;

/// Default maximum total serialized size: 5 MiB.
pub const DEFAULT_MAX_BYTES: usize = 5 * 1024 * 1024;

/// Default time-to-live when `set` is called without one: 1 hour.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// Share of entries removed by one eviction sweep.
const EVICTION_FRACTION: f64 = 0.2;

/// Stored shape of every cached value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEnvelope<T> {
    pub data: T,
    pub last_access_timestamp: i64,
    pub expires_at: i64,
}

impl<T> CacheEnvelope<T> {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms > self.expires_at
    }
}

#[derive(Debug)]
struct Slot {
    /// `data` holds the serialized JSON of the cached value.
    envelope: CacheEnvelope<String>,
    /// Monotonic recency stamp; breaks ties between same-millisecond accesses.
    seq: u64,
    size: usize,
}

/// Size limits and default TTL for an [`EphemeralCache`].
#[derive(Debug, Clone, Copy)]
pub struct EphemeralLimits {
    pub max_entries: usize,
    pub max_bytes: usize,
    pub default_ttl: Duration,
}

impl Default for EphemeralLimits {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            max_bytes: DEFAULT_MAX_BYTES,
            default_ttl: DEFAULT_TTL,
        }
    }
}

pub struct EphemeralCache {
    /// `None` when the backing store is unavailable; every operation is then a no-op.
    entries: Option<DashMap<String, Slot>>,
    limits: EphemeralLimits,
    total_bytes: AtomicUsize,
    seq: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for EphemeralCache {
    fn default() -> Self {
        Self::new(EphemeralLimits::default())
    }
}

impl EphemeralCache {
    pub fn new(limits: EphemeralLimits) -> Self {
        Self {
            entries: Some(DashMap::new()),
            limits,
            total_bytes: AtomicUsize::new(0),
            seq: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// A cache with no backing store. Reads miss and writes are dropped.
    pub fn disabled() -> Self {
        tracing::warn!("ephemeral cache unavailable, continuing without it");
        Self {
            entries: None,
            ..Self::default()
        }
    }

    pub fn is_available(&self) -> bool {
        self.entries.is_some()
    }

    /// Fetch a value, refreshing its recency.
    ///
    /// An expired entry is removed and reported as a miss. An entry that no
    /// longer decodes as `T` is discarded the same way.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entries = self.entries.as_ref()?;
        let now = now_millis();

        let payload = match entries.get_mut(key) {
            Some(mut slot) => {
                if slot.envelope.is_expired(now) {
                    drop(slot);
                    self.remove_where(entries, key, |s| s.envelope.is_expired(now));
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(key, "ephemeral entry expired");
                    return None;
                }
                slot.envelope.last_access_timestamp = now;
                slot.seq = self.next_seq();
                slot.envelope.data.clone()
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(key, "ephemeral miss");
                return None;
            }
        };

        match serde_json::from_str(&payload) {
            Ok(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(key, "ephemeral hit");
                Some(value)
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "discarding undecodable ephemeral entry");
                self.remove_where(entries, key, |_| true);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Read an entry's envelope without touching its recency or the hit counters.
    pub fn peek<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEnvelope<T>> {
        let entries = self.entries.as_ref()?;
        let slot = entries.get(key)?;
        let data = serde_json::from_str(&slot.envelope.data).ok()?;
        Some(CacheEnvelope {
            data,
            last_access_timestamp: slot.envelope.last_access_timestamp,
            expires_at: slot.envelope.expires_at,
        })
    }

    /// Store a value for `ttl` (or the default TTL), replacing any previous value.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        let Some(entries) = self.entries.as_ref() else {
            return;
        };
        let payload = match serde_json::to_string(value) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(key, error = %e, "failed to serialize ephemeral entry");
                return;
            }
        };
        let size = key.len() + payload.len();
        if size > self.limits.max_bytes {
            tracing::warn!(
                key,
                size,
                max_bytes = self.limits.max_bytes,
                "value exceeds ephemeral size bound, not cached"
            );
            return;
        }

        let now = now_millis();
        let ttl = ttl.unwrap_or(self.limits.default_ttl);
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let slot = Slot {
            envelope: CacheEnvelope {
                data: payload,
                last_access_timestamp: now,
                expires_at: now.saturating_add(ttl_ms),
            },
            seq: self.next_seq(),
            size,
        };

        // Account before publishing so a concurrent removal never underflows.
        self.total_bytes.fetch_add(size, Ordering::Relaxed);
        if let Some(old) = entries.insert(key.to_string(), slot) {
            self.total_bytes.fetch_sub(old.size, Ordering::Relaxed);
        }

        if self.over_bounds(entries) {
            self.evict(entries);
        }
    }

    /// Remove one entry. Returns whether it existed.
    pub fn delete(&self, key: &str) -> bool {
        match self.entries.as_ref() {
            Some(entries) => self.remove_where(entries, key, |_| true),
            None => false,
        }
    }

    /// Remove every entry whose key contains `pattern`, or everything when `None`.
    /// Returns the number of entries removed.
    pub fn clear(&self, pattern: Option<&str>) -> usize {
        let Some(entries) = self.entries.as_ref() else {
            return 0;
        };
        let mut removed = 0usize;
        let mut freed = 0usize;
        entries.retain(|key, slot| {
            let matches = pattern.is_none_or(|p| key.contains(p));
            if matches {
                removed += 1;
                freed += slot.size;
            }
            !matches
        });
        self.total_bytes.fetch_sub(freed, Ordering::Relaxed);
        tracing::debug!(pattern, removed, "ephemeral cache cleared");
        removed
    }

    /// Eagerly drop every expired entry. Returns the number removed.
    pub fn invalidate_expired(&self) -> usize {
        let Some(entries) = self.entries.as_ref() else {
            return 0;
        };
        let now = now_millis();
        let mut removed = 0usize;
        let mut freed = 0usize;
        entries.retain(|_, slot| {
            let expired = slot.envelope.is_expired(now);
            if expired {
                removed += 1;
                freed += slot.size;
            }
            !expired
        });
        self.total_bytes.fetch_sub(freed, Ordering::Relaxed);
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            total_entries: self.len(),
            total_size_bytes: self.total_bytes.load(Ordering::Relaxed),
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }

    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, |e| e.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn over_bounds(&self, entries: &DashMap<String, Slot>) -> bool {
        entries.len() > self.limits.max_entries
            || self.total_bytes.load(Ordering::Relaxed) > self.limits.max_bytes
    }

    fn remove_where(
        &self,
        entries: &DashMap<String, Slot>,
        key: &str,
        pred: impl FnOnce(&Slot) -> bool,
    ) -> bool {
        match entries.remove_if(key, |_, slot| pred(slot)) {
            Some((_, slot)) => {
                self.total_bytes.fetch_sub(slot.size, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Drop the least recently used fifth of the entries, repeating only while
    /// a bound is still exceeded.
    fn evict(&self, entries: &DashMap<String, Slot>) {
        let mut evicted = 0usize;
        while self.over_bounds(entries) && !entries.is_empty() {
            let mut by_recency: Vec<(u64, String)> = entries
                .iter()
                .map(|e| (e.value().seq, e.key().clone()))
                .collect();
            by_recency.sort_unstable();

            let batch = ((by_recency.len() as f64 * EVICTION_FRACTION).ceil() as usize).max(1);
            for (_, key) in by_recency.into_iter().take(batch) {
                if self.remove_where(entries, &key, |_| true) {
                    evicted += 1;
                }
            }
        }
        tracing::debug!(
            evicted,
            remaining = entries.len(),
            bytes = self.total_bytes.load(Ordering::Relaxed),
            "ephemeral eviction sweep"
        );
    }
}

impl std::fmt::Debug for EphemeralCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralCache")
            .field("available", &self.is_available())
            .field("entries", &self.len())
            .field("bytes", &self.total_bytes.load(Ordering::Relaxed))
            .field("limits", &self.limits)
            .finish()
    }
}
