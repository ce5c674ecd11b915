//! Durable cache tier: the narrow read/write contract the orchestrator
//! depends on, plus an in-memory implementation.
//!
//! Unlike the ephemeral tier, failures here surface as [`DurableError`]. The
//! store never judges freshness: callers check
//! [`SearchCacheEntry::is_expired`] themselves.

pub mod sqlite;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use thiserror::Error;

use crate::{Paper, SearchCacheEntry};

pub use sqlite::SqliteStore;

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DurableError>> + Send + 'a>>;

#[derive(Error, Debug)]
pub enum DurableError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("durable store unavailable: {0}")]
    Unavailable(String),
}

/// Keyed get/upsert access to search entries and papers.
pub trait DurableStore: Send + Sync {
    /// Short store name for logs.
    fn name(&self) -> &str;

    /// The entry for `key`, expired or not.
    fn get_by_key<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<SearchCacheEntry>>;

    /// Insert or wholesale-replace the entry at `entry.query_key`.
    fn upsert<'a>(&'a self, entry: &'a SearchCacheEntry) -> StoreFuture<'a, ()>;

    fn get_paper_by_id<'a>(&'a self, paper_id: &'a str) -> StoreFuture<'a, Option<Paper>>;

    fn upsert_paper<'a>(&'a self, paper: &'a Paper) -> StoreFuture<'a, ()>;
}

/// In-memory durable store.
///
/// Useful when no database path is configured and in tests; `set_failing`
/// makes every operation return [`DurableError::Unavailable`].
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, SearchCacheEntry>,
    papers: DashMap<String, Paper>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn paper_count(&self) -> usize {
        self.papers.len()
    }

    fn check(&self) -> Result<(), DurableError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(DurableError::Unavailable("memory store set to fail".into()))
        } else {
            Ok(())
        }
    }
}

impl DurableStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn get_by_key<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<SearchCacheEntry>> {
        Box::pin(async move {
            self.check()?;
            Ok(self.entries.get(key).map(|e| e.value().clone()))
        })
    }

    fn upsert<'a>(&'a self, entry: &'a SearchCacheEntry) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.check()?;
            self.entries.insert(entry.query_key.clone(), entry.clone());
            Ok(())
        })
    }

    fn get_paper_by_id<'a>(&'a self, paper_id: &'a str) -> StoreFuture<'a, Option<Paper>> {
        Box::pin(async move {
            self.check()?;
            Ok(self.papers.get(paper_id).map(|p| p.value().clone()))
        })
    }

    fn upsert_paper<'a>(&'a self, paper: &'a Paper) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.check()?;
            self.papers.insert(paper.paper_id.clone(), paper.clone());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{entry, paper};
    use std::time::Duration;

    #[tokio::test]
    async fn paper_round_trip() {
        let store = MemoryStore::new();
        assert!(store.get_paper_by_id("p1").await.unwrap().is_none());
        let p = paper("p1");
        store.upsert_paper(&p).await.unwrap();
        assert_eq!(store.get_paper_by_id("p1").await.unwrap(), Some(p));
    }

    #[tokio::test]
    async fn identical_upsert_is_idempotent() {
        let store = MemoryStore::new();
        let p = paper("p1");
        store.upsert_paper(&p).await.unwrap();
        store.upsert_paper(&p).await.unwrap();
        assert_eq!(store.paper_count(), 1);
        assert_eq!(store.get_paper_by_id("p1").await.unwrap(), Some(p));
    }

    #[tokio::test]
    async fn entry_is_replaced_wholesale() {
        let store = MemoryStore::new();
        let first = entry("k", vec![paper("a"), paper("b")], Duration::from_secs(60));
        let second = entry("k", vec![paper("c")], Duration::from_secs(60));
        store.upsert(&first).await.unwrap();
        store.upsert(&second).await.unwrap();
        let got = store.get_by_key("k").await.unwrap().unwrap();
        assert_eq!(got.results.len(), 1);
        assert_eq!(got.results[0].paper_id, "c");
    }

    #[tokio::test]
    async fn failing_store_errors() {
        let store = MemoryStore::new();
        store.set_failing(true);
        assert!(matches!(
            store.get_by_key("k").await,
            Err(DurableError::Unavailable(_))
        ));
        assert!(store.upsert_paper(&paper("p")).await.is_err());
        store.set_failing(false);
        assert!(store.get_by_key("k").await.unwrap().is_none());
    }
}
