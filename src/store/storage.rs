//! SQLite implementation of the local store.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::sync::Arc;

use super::traits::{Collection, Index, Record};
use crate::db::Database;
use crate::error::StorageError;

/// Durable keyed collections with parent and sync-status indexes.
///
/// Each call is atomic on its own; nothing spans collections.
#[derive(Clone)]
pub struct LocalStore {
  db: Arc<Database>,
}

impl LocalStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  /// Upsert a record.
  ///
  /// The record is marked unsynced and its modification time set to now, or
  /// kept at the previously stored time if the clock went backwards.
  pub fn put<T: Record>(&self, record: &mut T) -> Result<(), StorageError> {
    let collection = T::collection();
    let key = record.key();

    let mut conn = self.db.conn()?;
    let tx = conn.transaction()?;

    let previous: Option<String> = tx
      .query_row(
        "SELECT last_modified FROM records WHERE collection = ? AND record_key = ?",
        params![collection.as_str(), key],
        |row| row.get(0),
      )
      .optional()?;

    let now = Utc::now().trunc_subsecs(6);
    let last_modified = match previous {
      Some(prev) => parse_timestamp(&prev)?.max(now),
      None => now,
    };

    record.set_sync_state(false, last_modified);
    let data = serde_json::to_vec(record)?;

    tx.execute(
      "INSERT INTO records (collection, record_key, parent_id, synced, last_modified, data)
       VALUES (?1, ?2, ?3, 0, ?4, ?5)
       ON CONFLICT(collection, record_key) DO UPDATE SET
         parent_id = excluded.parent_id,
         synced = 0,
         last_modified = excluded.last_modified,
         data = excluded.data",
      params![
        collection.as_str(),
        key,
        record.parent_id(),
        format_timestamp(last_modified),
        data
      ],
    )?;

    tx.commit()?;

    tracing::trace!(collection = %collection, key = %key, "stored record");
    Ok(())
  }

  /// Get a single record by key.
  pub fn get<T: Record>(&self, key: &str) -> Result<Option<T>, StorageError> {
    let conn = self.db.conn()?;
    let mut stmt = conn.prepare(
      "SELECT synced, last_modified, data FROM records
       WHERE collection = ? AND record_key = ?",
    )?;

    let row = stmt
      .query_row(params![T::collection().as_str(), key], read_row)
      .optional()?;

    row.map(decode).transpose()
  }

  /// All records of a collection in insertion order.
  pub fn get_all<T: Record>(&self) -> Result<Vec<T>, StorageError> {
    let conn = self.db.conn()?;
    let mut stmt = conn.prepare(
      "SELECT synced, last_modified, data FROM records
       WHERE collection = ?
       ORDER BY rowid",
    )?;

    let rows = stmt
      .query_map(params![T::collection().as_str()], read_row)?
      .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter().map(decode).collect()
  }

  /// Records matching a secondary index, in insertion order.
  pub fn get_all_by_index<T: Record>(&self, index: Index<'_>) -> Result<Vec<T>, StorageError> {
    let conn = self.db.conn()?;
    let collection = T::collection().as_str();

    let rows = match index {
      Index::Parent(parent_id) => {
        let mut stmt = conn.prepare(
          "SELECT synced, last_modified, data FROM records
           WHERE collection = ? AND parent_id = ?
           ORDER BY rowid",
        )?;
        let rows = stmt
          .query_map(params![collection, parent_id], read_row)?
          .collect::<Result<Vec<_>, _>>()?;
        rows
      }
      Index::Synced(synced) => {
        let mut stmt = conn.prepare(
          "SELECT synced, last_modified, data FROM records
           WHERE collection = ? AND synced = ?
           ORDER BY rowid",
        )?;
        let rows = stmt
          .query_map(params![collection, synced], read_row)?
          .collect::<Result<Vec<_>, _>>()?;
        rows
      }
    };

    rows.into_iter().map(decode).collect()
  }

  /// Replace a stored record's key and content without counting as a local
  /// mutation: the sync flag and modification time stay as stored, and are
  /// applied to `record`. Returns whether `old_key` existed.
  pub fn rewrite<T: Record>(&self, old_key: &str, record: &mut T) -> Result<bool, StorageError> {
    let collection = T::collection();

    let mut conn = self.db.conn()?;
    let tx = conn.transaction()?;

    let state: Option<(bool, String)> = tx
      .query_row(
        "SELECT synced, last_modified FROM records WHERE collection = ? AND record_key = ?",
        params![collection.as_str(), old_key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()?;
    let Some((synced, last_modified)) = state else {
      return Ok(false);
    };

    record.set_sync_state(synced, parse_timestamp(&last_modified)?);
    let data = serde_json::to_vec(record)?;

    tx.execute(
      "UPDATE records SET record_key = ?1, parent_id = ?2, data = ?3
       WHERE collection = ?4 AND record_key = ?5",
      params![
        record.key(),
        record.parent_id(),
        data,
        collection.as_str(),
        old_key
      ],
    )?;

    tx.commit()?;

    tracing::trace!(collection = %collection, old_key, key = %record.key(), "rewrote record");
    Ok(true)
  }

  /// Delete a record. Returns whether it existed.
  pub fn delete(&self, collection: Collection, key: &str) -> Result<bool, StorageError> {
    let conn = self.db.conn()?;
    let deleted = conn.execute(
      "DELETE FROM records WHERE collection = ? AND record_key = ?",
      params![collection.as_str(), key],
    )?;
    Ok(deleted > 0)
  }

  /// Mark a record as acknowledged by the server.
  ///
  /// This is not a local mutation, so the modification time is left alone.
  pub fn mark_synced(&self, collection: Collection, key: &str) -> Result<bool, StorageError> {
    let conn = self.db.conn()?;
    let updated = conn.execute(
      "UPDATE records SET synced = 1 WHERE collection = ? AND record_key = ?",
      params![collection.as_str(), key],
    )?;
    Ok(updated > 0)
  }

  /// Number of records in a collection, and how many of them are unsynced.
  pub fn counts(&self, collection: Collection) -> Result<(usize, usize), StorageError> {
    let conn = self.db.conn()?;
    let (total, unsynced): (i64, i64) = conn.query_row(
      "SELECT COUNT(*), COALESCE(SUM(CASE WHEN synced = 0 THEN 1 ELSE 0 END), 0)
       FROM records WHERE collection = ?",
      params![collection.as_str()],
      |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok((total as usize, unsynced as usize))
  }

  /// Bytes allocated by the underlying database.
  pub fn usage(&self) -> Result<u64, StorageError> {
    self.db.usage()
  }
}

type RawRow = (bool, String, Vec<u8>);

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
  Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn decode<T: Record>((synced, last_modified, data): RawRow) -> Result<T, StorageError> {
  let mut record: T = serde_json::from_slice(&data)?;
  record.set_sync_state(synced, parse_timestamp(&last_modified)?);
  Ok(record)
}

/// Fixed-width RFC 3339 so stored timestamps also sort as text.
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
  ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StorageError> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| StorageError::Corrupt(format!("bad timestamp '{}': {}", s, e)))
}
