//! SQLite-backed durable store.
//!
//! One writer connection behind a mutex and a pool of read-only connections
//! (WAL allows concurrent readers). All blocking work runs on
//! `spawn_blocking`. Search entries store the ordered list of paper ids;
//! the papers themselves live in their own table and are joined back on read.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};

use super::{DurableError, DurableStore, StoreFuture};
use crate::{Paper, SearchCacheEntry};

fn open_sqlite(path: &Path, read_only: bool) -> Result<Connection, rusqlite::Error> {
    let flags = if read_only {
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX
    } else {
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
    };
    let conn = Connection::open_with_flags(path, flags)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(conn)
}

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

struct SqliteWriter {
    conn: Connection,
}

impl SqliteWriter {
    fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let conn = open_sqlite(path, false)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS papers (
                 paper_id   TEXT PRIMARY KEY,
                 json       TEXT NOT NULL,
                 updated_at INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS search_cache (
                 query_key          TEXT PRIMARY KEY,
                 query              TEXT NOT NULL,
                 paper_ids          TEXT NOT NULL,
                 total_requested    INTEGER NOT NULL,
                 successful_count   INTEGER NOT NULL,
                 rate_limited_count INTEGER NOT NULL,
                 updated_at         INTEGER NOT NULL,
                 expires_at         INTEGER NOT NULL
             );",
        )?;
        Ok(Self { conn })
    }

    fn upsert_paper(&self, paper: &Paper) -> Result<(), DurableError> {
        upsert_paper_row(&self.conn, paper)
    }

    /// Write the entry and all of its papers in one transaction.
    fn upsert_entry(&mut self, entry: &SearchCacheEntry) -> Result<(), DurableError> {
        let ids: Vec<&str> = entry.results.iter().map(|p| p.paper_id.as_str()).collect();
        let ids_json = serde_json::to_string(&ids)?;

        let tx = self.conn.transaction()?;
        for paper in &entry.results {
            upsert_paper_row(&tx, paper)?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO search_cache
                 (query_key, query, paper_ids, total_requested, successful_count,
                  rate_limited_count, updated_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.query_key,
                entry.query,
                ids_json,
                entry.total_requested as i64,
                entry.successful_count as i64,
                entry.rate_limited_count as i64,
                to_millis(entry.updated_at),
                to_millis(entry.expires_at),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn clear(&self) -> Result<(), DurableError> {
        self.conn
            .execute_batch("DELETE FROM search_cache; DELETE FROM papers;")?;
        // Deleted pages stay allocated until VACUUM.
        if let Err(e) = self.conn.execute_batch("VACUUM") {
            tracing::warn!(error = %e, "VACUUM after clear failed");
        }
        Ok(())
    }

    fn evict_expired(&self, now: DateTime<Utc>) -> Result<usize, DurableError> {
        Ok(self.conn.execute(
            "DELETE FROM search_cache WHERE expires_at < ?1",
            params![to_millis(now)],
        )?)
    }

    /// (search entries, papers)
    fn counts(&self) -> Result<(usize, usize), DurableError> {
        let count = |table: &str| -> Result<usize, DurableError> {
            let n: i64 = self.conn.query_row(
                &format!("SELECT COUNT(*) FROM {table}"),
                [],
                |row| row.get(0),
            )?;
            Ok(n.max(0) as usize)
        };
        Ok((count("search_cache")?, count("papers")?))
    }
}

fn upsert_paper_row(conn: &Connection, paper: &Paper) -> Result<(), DurableError> {
    let json = serde_json::to_string(paper)?;
    conn.execute(
        "INSERT OR REPLACE INTO papers (paper_id, json, updated_at) VALUES (?1, ?2, ?3)",
        params![paper.paper_id, json, to_millis(paper.updated_at)],
    )?;
    Ok(())
}

fn read_paper(conn: &Connection, paper_id: &str) -> Result<Option<Paper>, DurableError> {
    let json: Option<String> = conn
        .prepare_cached("SELECT json FROM papers WHERE paper_id = ?1")?
        .query_row(params![paper_id], |row| row.get(0))
        .optional()?;
    json.map(|j| serde_json::from_str(&j).map_err(DurableError::from))
        .transpose()
}

fn read_entry(conn: &Connection, key: &str) -> Result<Option<SearchCacheEntry>, DurableError> {
    let row = conn
        .prepare_cached(
            "SELECT query, paper_ids, total_requested, successful_count,
                    rate_limited_count, updated_at, expires_at
             FROM search_cache WHERE query_key = ?1",
        )?
        .query_row(params![key], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })
        .optional()?;

    let Some((query, ids_json, total, successful, rate_limited, updated_at, expires_at)) = row
    else {
        return Ok(None);
    };

    let ids: Vec<String> = serde_json::from_str(&ids_json)?;
    let mut results = Vec::with_capacity(ids.len());
    for id in &ids {
        // An entry with a missing paper is incomplete; report a miss so it is refetched.
        let Some(paper) = read_paper(conn, id)? else {
            tracing::warn!(query_key = key, paper_id = %id, "cached paper row missing");
            return Ok(None);
        };
        results.push(paper);
    }

    Ok(Some(SearchCacheEntry {
        query_key: key.to_string(),
        query,
        results,
        total_requested: total.max(0) as usize,
        successful_count: successful.max(0) as usize,
        rate_limited_count: rate_limited.max(0) as usize,
        updated_at: from_millis(updated_at),
        expires_at: from_millis(expires_at),
    }))
}

/// Pool of read-only connections; opens a new one when empty.
struct ReadPool {
    pool: Mutex<Vec<Connection>>,
    path: PathBuf,
}

impl ReadPool {
    fn new(path: &Path) -> Self {
        Self {
            pool: Mutex::new(Vec::new()),
            path: path.to_path_buf(),
        }
    }

    fn acquire(&self) -> Result<Connection, DurableError> {
        if let Ok(mut pool) = self.pool.lock()
            && let Some(conn) = pool.pop()
        {
            return Ok(conn);
        }
        Ok(open_sqlite(&self.path, true)?)
    }

    fn release(&self, conn: Connection) {
        if let Ok(mut pool) = self.pool.lock() {
            pool.push(conn);
        }
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, DurableError>,
    ) -> Result<T, DurableError> {
        let conn = self.acquire()?;
        let result = f(&conn);
        self.release(conn);
        result
    }
}

/// Durable store persisted to a SQLite file.
#[derive(Clone)]
pub struct SqliteStore {
    writer: Arc<Mutex<SqliteWriter>>,
    reads: Arc<ReadPool>,
    path: PathBuf,
}

impl SqliteStore {
    /// Open (or create) the database at `path`, dropping search entries that
    /// have already expired.
    pub fn open(path: &Path) -> Result<Self, DurableError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let writer = SqliteWriter::open(path)?;
        match writer.evict_expired(Utc::now()) {
            Ok(0) => {}
            Ok(evicted) => {
                tracing::debug!(evicted, path = %path.display(), "evicted expired search entries");
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "evicting expired entries failed"
                );
            }
        }
        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            reads: Arc::new(ReadPool::new(path)),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete every search entry and paper.
    pub async fn clear(&self) -> Result<(), DurableError> {
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || lock(&writer)?.clear()).await?
    }

    /// Row counts as (search entries, papers).
    pub async fn counts(&self) -> Result<(usize, usize), DurableError> {
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || lock(&writer)?.counts()).await?
    }

    async fn read<T, F>(&self, f: F) -> Result<T, DurableError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, DurableError> + Send + 'static,
    {
        let reads = Arc::clone(&self.reads);
        tokio::task::spawn_blocking(move || reads.with_conn(f)).await?
    }

    async fn write<F>(&self, f: F) -> Result<(), DurableError>
    where
        F: FnOnce(&mut SqliteWriter) -> Result<(), DurableError> + Send + 'static,
    {
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || f(&mut *lock(&writer)?)).await?
    }
}

fn lock(
    writer: &Mutex<SqliteWriter>,
) -> Result<std::sync::MutexGuard<'_, SqliteWriter>, DurableError> {
    writer
        .lock()
        .map_err(|_| DurableError::Unavailable("sqlite writer lock poisoned".into()))
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .finish()
    }
}

impl DurableStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn get_by_key<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<SearchCacheEntry>> {
        let key = key.to_string();
        Box::pin(async move { self.read(move |conn| read_entry(conn, &key)).await })
    }

    fn upsert<'a>(&'a self, entry: &'a SearchCacheEntry) -> StoreFuture<'a, ()> {
        let entry = entry.clone();
        Box::pin(async move { self.write(move |w| w.upsert_entry(&entry)).await })
    }

    fn get_paper_by_id<'a>(&'a self, paper_id: &'a str) -> StoreFuture<'a, Option<Paper>> {
        let paper_id = paper_id.to_string();
        Box::pin(async move { self.read(move |conn| read_paper(conn, &paper_id)).await })
    }

    fn upsert_paper<'a>(&'a self, paper: &'a Paper) -> StoreFuture<'a, ()> {
        let paper = paper.clone();
        Box::pin(async move { self.write(move |w| w.upsert_paper(&paper)).await })
    }
}
