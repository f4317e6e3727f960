//! Durable FIFO of pending mutations.

use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use super::transport::Method;
use crate::db::Database;
use crate::error::StorageError;
use crate::store::{format_timestamp, parse_timestamp, Collection};

/// The local record a queue entry carries to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRef {
  pub collection: Collection,
  pub key: String,
}

impl RecordRef {
  pub fn new(collection: Collection, key: impl Into<String>) -> Self {
    Self {
      collection,
      key: key.into(),
    }
  }
}

/// A mutation waiting to be delivered, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueEntry {
  /// Monotonic, never reused
  pub id: i64,
  pub method: Method,
  pub endpoint: String,
  pub payload: Value,
  pub enqueue_timestamp: DateTime<Utc>,
  pub attempts: u32,
  /// Sent as `Idempotency-Key` so the server can drop replays
  pub idempotency_key: String,
  #[serde(default)]
  pub last_error: Option<String>,
  #[serde(default)]
  pub record_ref: Option<RecordRef>,
}

/// A mutation to enqueue.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
  pub method: Method,
  pub endpoint: String,
  pub payload: Value,
  pub record_ref: Option<RecordRef>,
}

impl Mutation {
  pub fn new(method: Method, endpoint: impl Into<String>, payload: Value) -> Self {
    Self {
      method,
      endpoint: endpoint.into(),
      payload,
      record_ref: None,
    }
  }

  pub fn for_record(mut self, record_ref: RecordRef) -> Self {
    self.record_ref = Some(record_ref);
    self
  }
}

#[derive(Clone)]
pub struct SyncQueue {
  db: Arc<Database>,
}

impl SyncQueue {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  /// Append a mutation with zero attempts.
  pub fn enqueue(&self, mutation: &Mutation) -> Result<SyncQueueEntry, StorageError> {
    let conn = self.db.conn()?;
    let now = Utc::now().trunc_subsecs(6);
    let idempotency_key = Uuid::new_v4().to_string();
    let payload = serde_json::to_string(&mutation.payload)?;
    let (record_collection, record_key) = match &mutation.record_ref {
      Some(r) => (Some(r.collection.as_str()), Some(r.key.as_str())),
      None => (None, None),
    };

    conn.execute(
      "INSERT INTO sync_queue
         (method, endpoint, payload, enqueue_timestamp, attempts, idempotency_key, record_collection, record_key)
       VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7)",
      params![
        mutation.method.as_str(),
        mutation.endpoint,
        payload,
        format_timestamp(now),
        idempotency_key,
        record_collection,
        record_key
      ],
    )?;
    let id = conn.last_insert_rowid();

    tracing::debug!(id, method = mutation.method.as_str(), endpoint = %mutation.endpoint, "enqueued mutation");

    Ok(SyncQueueEntry {
      id,
      method: mutation.method,
      endpoint: mutation.endpoint.clone(),
      payload: mutation.payload.clone(),
      enqueue_timestamp: now,
      attempts: 0,
      idempotency_key,
      last_error: None,
      record_ref: mutation.record_ref.clone(),
    })
  }

  /// All entries in FIFO order.
  pub fn entries(&self) -> Result<Vec<SyncQueueEntry>, StorageError> {
    let conn = self.db.conn()?;
    let mut stmt = conn.prepare(
      "SELECT id, method, endpoint, payload, enqueue_timestamp, attempts, idempotency_key,
              last_error, record_collection, record_key
       FROM sync_queue ORDER BY id",
    )?;

    let rows = stmt
      .query_map([], read_row)?
      .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter().map(decode).collect()
  }

  pub fn get(&self, id: i64) -> Result<Option<SyncQueueEntry>, StorageError> {
    let conn = self.db.conn()?;
    let mut stmt = conn.prepare(
      "SELECT id, method, endpoint, payload, enqueue_timestamp, attempts, idempotency_key,
              last_error, record_collection, record_key
       FROM sync_queue WHERE id = ?",
    )?;

    let row = stmt.query_row(params![id], read_row).optional()?;
    row.map(decode).transpose()
  }

  /// Number of queued entries carrying this record.
  pub fn references(&self, record: &RecordRef) -> Result<usize, StorageError> {
    let conn = self.db.conn()?;
    let count: i64 = conn.query_row(
      "SELECT COUNT(*) FROM sync_queue WHERE record_collection = ? AND record_key = ?",
      params![record.collection.as_str(), record.key],
      |row| row.get(0),
    )?;
    Ok(count as usize)
  }

  /// Point a queued entry at a different target. Attempts and the
  /// idempotency key are kept.
  pub fn retarget(
    &self,
    id: i64,
    endpoint: &str,
    payload: &Value,
    record_ref: Option<&RecordRef>,
  ) -> Result<bool, StorageError> {
    let conn = self.db.conn()?;
    let payload = serde_json::to_string(payload)?;
    let (record_collection, record_key) = match record_ref {
      Some(r) => (Some(r.collection.as_str()), Some(r.key.as_str())),
      None => (None, None),
    };
    let updated = conn.execute(
      "UPDATE sync_queue SET endpoint = ?1, payload = ?2, record_collection = ?3, record_key = ?4
       WHERE id = ?5",
      params![endpoint, payload, record_collection, record_key, id],
    )?;
    Ok(updated > 0)
  }

  pub fn len(&self) -> Result<usize, StorageError> {
    let conn = self.db.conn()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?;
    Ok(count as usize)
  }

  pub fn is_empty(&self) -> Result<bool, StorageError> {
    Ok(self.len()? == 0)
  }

  /// Remove an acknowledged entry. Returns whether it was still queued.
  pub fn remove(&self, id: i64) -> Result<bool, StorageError> {
    let conn = self.db.conn()?;
    let removed = conn.execute("DELETE FROM sync_queue WHERE id = ?", params![id])?;
    Ok(removed > 0)
  }

  /// Count a failed delivery attempt.
  pub fn record_failure(&self, id: i64, error: &str) -> Result<(), StorageError> {
    let conn = self.db.conn()?;
    conn.execute(
      "UPDATE sync_queue SET attempts = attempts + 1, last_error = ? WHERE id = ?",
      params![error, id],
    )?;
    Ok(())
  }
}

type RawEntry = (
  i64,
  String,
  String,
  String,
  String,
  u32,
  String,
  Option<String>,
  Option<String>,
  Option<String>,
);

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawEntry> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
    row.get(6)?,
    row.get(7)?,
    row.get(8)?,
    row.get(9)?,
  ))
}

fn decode(raw: RawEntry) -> Result<SyncQueueEntry, StorageError> {
  let (id, method, endpoint, payload, enqueued, attempts, key, last_error, collection, record_key) =
    raw;

  let method: Method = method.parse().map_err(StorageError::Corrupt)?;
  let record_ref = match (collection, record_key) {
    (Some(c), Some(k)) => Some(RecordRef {
      collection: c.parse().map_err(StorageError::Corrupt)?,
      key: k,
    }),
    _ => None,
  };

  Ok(SyncQueueEntry {
    id,
    method,
    endpoint,
    payload: serde_json::from_str(&payload)?,
    enqueue_timestamp: parse_timestamp(&enqueued)?,
    attempts,
    idempotency_key: key,
    last_error,
    record_ref,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use tempfile::TempDir;

  fn queue() -> SyncQueue {
    SyncQueue::new(Arc::new(Database::open_in_memory(None).unwrap()))
  }

  #[test]
  fn enqueue_appends_in_fifo_order() {
    let queue = queue();
    let a = queue
      .enqueue(&Mutation::new(Method::Put, "/api/projects/p1", json!({"notes": "a"})))
      .unwrap();
    let b = queue
      .enqueue(&Mutation::new(Method::Post, "/api/projects/p1/gps", json!({"lat": 1.0})))
      .unwrap();

    assert!(b.id > a.id);
    assert_eq!(a.attempts, 0);
    assert_ne!(a.idempotency_key, b.idempotency_key);

    let entries = queue.entries().unwrap();
    assert_eq!(entries, vec![a, b]);
  }

  #[test]
  fn ids_are_never_reused() {
    let queue = queue();
    let a = queue
      .enqueue(&Mutation::new(Method::Put, "/api/projects/p1", json!({})))
      .unwrap();
    assert!(queue.remove(a.id).unwrap());
    let b = queue
      .enqueue(&Mutation::new(Method::Put, "/api/projects/p1", json!({})))
      .unwrap();
    assert!(b.id > a.id);
  }

  #[test]
  fn record_failure_counts_attempts() {
    let queue = queue();
    let entry = queue
      .enqueue(
        &Mutation::new(Method::Post, "/api/projects/p1/gps", json!({}))
          .for_record(RecordRef::new(Collection::GpsPoints, "pt1")),
      )
      .unwrap();

    queue.record_failure(entry.id, "connection refused").unwrap();
    queue.record_failure(entry.id, "timed out").unwrap();

    let stored = &queue.entries().unwrap()[0];
    assert_eq!(stored.attempts, 2);
    assert_eq!(stored.last_error.as_deref(), Some("timed out"));
    assert_eq!(
      stored.record_ref,
      Some(RecordRef::new(Collection::GpsPoints, "pt1"))
    );
  }

  #[test]
  fn references_count_entries_per_record() {
    let queue = queue();
    let project = RecordRef::new(Collection::Projects, "p1");
    for notes in ["a", "b"] {
      queue
        .enqueue(
          &Mutation::new(Method::Put, "/api/projects/p1", json!({"notes": notes}))
            .for_record(project.clone()),
        )
        .unwrap();
    }
    queue
      .enqueue(&Mutation::new(Method::Post, "/api/projects/p1/gps", json!({})))
      .unwrap();

    assert_eq!(queue.references(&project).unwrap(), 2);
    assert_eq!(
      queue
        .references(&RecordRef::new(Collection::Projects, "p2"))
        .unwrap(),
      0
    );
  }

  #[test]
  fn retarget_keeps_attempts_and_key() {
    let queue = queue();
    let entry = queue
      .enqueue(
        &Mutation::new(Method::Put, "/api/projects/p1", json!({"id": "p1"}))
          .for_record(RecordRef::new(Collection::Projects, "p1")),
      )
      .unwrap();
    queue.record_failure(entry.id, "timed out").unwrap();

    let record = RecordRef::new(Collection::Projects, "20261016_083000");
    assert!(queue
      .retarget(
        entry.id,
        "/api/projects/20261016_083000",
        &json!({"id": "20261016_083000"}),
        Some(&record)
      )
      .unwrap());

    let stored = queue.get(entry.id).unwrap().unwrap();
    assert_eq!(stored.endpoint, "/api/projects/20261016_083000");
    assert_eq!(stored.payload["id"], "20261016_083000");
    assert_eq!(stored.record_ref, Some(record));
    assert_eq!(stored.attempts, 1);
    assert_eq!(stored.idempotency_key, entry.idempotency_key);
    assert!(queue.get(entry.id + 1).unwrap().is_none());
  }

  #[test]
  fn persisted_shape_uses_camel_case() {
    let queue = queue();
    let entry = queue
      .enqueue(&Mutation::new(Method::Post, "/api/projects/p1/gps", json!({})))
      .unwrap();
    let json = serde_json::to_value(&entry).unwrap();
    for field in ["id", "method", "endpoint", "payload", "enqueueTimestamp", "attempts"] {
      assert!(json.get(field).is_some(), "missing {}", field);
    }
    assert_eq!(json["method"], "POST");
  }

  #[test]
  fn queue_survives_reopen() {
    let dir = TempDir::new().expect("tempdir");
    let path = Database::default_path(dir.path());
    {
      let queue = SyncQueue::new(Arc::new(Database::open(&path, None).unwrap()));
      queue
        .enqueue(&Mutation::new(Method::Post, "/api/projects/p1/photo", json!({})))
        .unwrap();
    }
    let queue = SyncQueue::new(Arc::new(Database::open(&path, None).unwrap()));
    assert_eq!(queue.len().unwrap(), 1);
  }
}
