//! Response cache storage, partitioned into named generations.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::StorageError;
use crate::sync::HttpResponse;

/// Buckets of cached responses, one generation per bucket and version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBucket {
  Static,
  Tiles,
  Api,
}

impl CacheBucket {
  pub const ALL: [CacheBucket; 3] = [CacheBucket::Static, CacheBucket::Tiles, CacheBucket::Api];

  pub fn generation(&self, version: &str) -> String {
    let prefix = match self {
      Self::Static => "static",
      Self::Tiles => "tiles",
      Self::Api => "api",
    };
    format!("fieldsync-{}-{}", prefix, version)
  }
}

/// Tile cache generation for a deployment version.
pub fn tile_generation(version: &str) -> String {
  CacheBucket::Tiles.generation(version)
}

/// A cached response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: HttpResponse,
  pub cached_at: DateTime<Utc>,
}

/// SQLite-based response cache.
#[derive(Clone)]
pub struct ResponseCache {
  conn: Arc<Mutex<Connection>>,
}

const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS response_cache (
    generation TEXT NOT NULL,
    url_hash TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    content_type TEXT,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, url_hash)
);
"#;

impl ResponseCache {
  /// Open or create the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self, StorageError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        StorageError::Corrupt(format!(
          "failed to create cache directory {}: {}",
          parent.display(),
          e
        ))
      })?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Self::init(conn)
  }

  pub fn open_in_memory() -> Result<Self, StorageError> {
    Self::init(Connection::open_in_memory()?)
  }

  /// Default cache path inside the data directory.
  pub fn default_path(data_dir: &Path) -> std::path::PathBuf {
    data_dir.join("responses.db")
  }

  fn init(conn: Connection) -> Result<Self, StorageError> {
    conn.execute_batch(CACHE_SCHEMA)?;
    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
    self.conn.lock().map_err(|_| StorageError::LockPoisoned)
  }

  /// Store (or replace) the response for `url`.
  pub fn put(&self, generation: &str, url: &str, response: &HttpResponse) -> Result<(), StorageError> {
    let conn = self.conn()?;
    conn.execute(
      "INSERT OR REPLACE INTO response_cache (generation, url_hash, url, status, content_type, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        generation,
        url_hash(url),
        url,
        response.status,
        response.content_type,
        response.body
      ],
    )?;
    Ok(())
  }

  pub fn get(&self, generation: &str, url: &str) -> Result<Option<CachedResponse>, StorageError> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare(
      "SELECT status, content_type, body, cached_at FROM response_cache
       WHERE generation = ? AND url_hash = ?",
    )?;

    let row: Option<(u16, Option<String>, Vec<u8>, String)> = stmt
      .query_row(params![generation, url_hash(url)], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .optional()?;

    match row {
      Some((status, content_type, body, cached_at)) => Ok(Some(CachedResponse {
        response: HttpResponse {
          status,
          content_type,
          body,
        },
        cached_at: parse_datetime(&cached_at)?,
      })),
      None => Ok(None),
    }
  }

  pub fn contains(&self, generation: &str, url: &str) -> Result<bool, StorageError> {
    let conn = self.conn()?;
    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM response_cache WHERE generation = ? AND url_hash = ?",
        params![generation, url_hash(url)],
        |row| row.get(0),
      )
      .optional()?;
    Ok(found.is_some())
  }

  pub fn count(&self, generation: &str) -> Result<usize, StorageError> {
    let conn = self.conn()?;
    let count: i64 = conn.query_row(
      "SELECT COUNT(*) FROM response_cache WHERE generation = ?",
      params![generation],
      |row| row.get(0),
    )?;
    Ok(count as usize)
  }

  /// Names of all generations currently holding entries.
  pub fn generations(&self) -> Result<Vec<String>, StorageError> {
    let conn = self.conn()?;
    let mut stmt =
      conn.prepare("SELECT DISTINCT generation FROM response_cache ORDER BY generation")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
  }

  /// Delete every generation not in `keep`. Returns the number of entries removed.
  pub fn purge_except(&self, keep: &[String]) -> Result<usize, StorageError> {
    let stale: Vec<String> = self
      .generations()?
      .into_iter()
      .filter(|g| !keep.contains(g))
      .collect();

    let conn = self.conn()?;
    let mut removed = 0;
    for generation in &stale {
      removed += conn.execute(
        "DELETE FROM response_cache WHERE generation = ?",
        params![generation],
      )?;
      tracing::info!(generation = %generation, "purged cache generation");
    }
    Ok(removed)
  }
}

/// SHA256 of the URL for stable, fixed-length keys.
fn url_hash(url: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(url.as_bytes());
  hex::encode(hasher.finalize())
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StorageError> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| StorageError::Corrupt(format!("failed to parse datetime '{}': {}", s, e)))
}
