pub mod schema;

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::StorageError;

/// Shared connection to the local database.
///
/// The local store and the sync queue both borrow this; every call takes the
/// lock for the duration of one statement or one transaction.
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database at `path`, optionally capping its size.
  pub fn open(path: &Path, max_pages: Option<u32>) -> Result<Self, StorageError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        StorageError::Corrupt(format!(
          "failed to create database directory {}: {}",
          parent.display(),
          e
        ))
      })?;
    }

    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Self::init(conn, max_pages)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory(max_pages: Option<u32>) -> Result<Self, StorageError> {
    Self::init(Connection::open_in_memory()?, max_pages)
  }

  /// Default database path inside the data directory.
  pub fn default_path(data_dir: &Path) -> PathBuf {
    data_dir.join("fieldsync.db")
  }

  fn init(conn: Connection, max_pages: Option<u32>) -> Result<Self, StorageError> {
    conn.execute_batch(schema::SCHEMA)?;

    if let Some(pages) = max_pages {
      // SQLite raises SQLITE_FULL once the file would grow past this.
      let _: i64 = conn.query_row(&format!("PRAGMA max_page_count = {}", pages), [], |row| {
        row.get(0)
      })?;
    }

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Lock the connection.
  pub fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
    self.conn.lock().map_err(|_| StorageError::LockPoisoned)
  }

  /// Bytes currently allocated by the database.
  pub fn usage(&self) -> Result<u64, StorageError> {
    let conn = self.conn()?;
    let pages: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
    let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
    Ok((pages * page_size) as u64)
  }
}
