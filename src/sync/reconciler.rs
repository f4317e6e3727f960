//! Drains the sync queue to the server.

use std::sync::Arc;
use tokio::sync::Mutex;
use url::Url;

use super::queue::{SyncQueue, SyncQueueEntry};
use super::transport::{HttpRequest, HttpResponse, Transport};
use crate::error::{StorageError, SyncError};
use crate::store::LocalStore;

/// Counts from one pass over the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub attempted: usize,
  pub synced: usize,
  /// Failures a later retry may fix: transport errors, 5xx, 408 and 429
  pub failed: usize,
  /// Other 4xx answers; kept queued like any other failure
  pub rejected: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
  Completed(DrainReport),
  /// Another drain was in flight; nothing was submitted.
  AlreadyRunning,
}

impl DrainOutcome {
  pub fn report(&self) -> Option<&DrainReport> {
    match self {
      Self::Completed(report) => Some(report),
      Self::AlreadyRunning => None,
    }
  }
}

/// Runs after the server acknowledges an entry, before the next entry is
/// read back from the queue. It may rewrite queued entries.
pub trait AckHook: Send + Sync {
  fn acknowledged(
    &self,
    entry: &SyncQueueEntry,
    response: &HttpResponse,
  ) -> Result<(), StorageError>;
}

/// Delivers queued mutations in FIFO order.
///
/// Only one drain runs at a time; a concurrent call returns
/// `AlreadyRunning` instead of waiting, so no entry is submitted twice.
#[derive(Clone)]
pub struct Reconciler {
  queue: SyncQueue,
  store: LocalStore,
  transport: Arc<dyn Transport>,
  base_url: Url,
  ack_hook: Option<Arc<dyn AckHook>>,
  in_flight: Arc<Mutex<()>>,
}

impl Reconciler {
  pub fn new(
    queue: SyncQueue,
    store: LocalStore,
    transport: Arc<dyn Transport>,
    base_url: Url,
  ) -> Self {
    Self {
      queue,
      store,
      transport,
      base_url,
      ack_hook: None,
      in_flight: Arc::new(Mutex::new(())),
    }
  }

  pub fn with_ack_hook(mut self, hook: Arc<dyn AckHook>) -> Self {
    self.ack_hook = Some(hook);
    self
  }

  pub fn queue(&self) -> &SyncQueue {
    &self.queue
  }

  /// Attempt every queued entry once.
  ///
  /// A failed entry stays queued with its attempt counter bumped and does not
  /// stop the entries behind it. Entries enqueued while the drain runs wait
  /// for the next one. A record is marked synced once no queued entry
  /// carries it any more.
  pub async fn drain(&self) -> Result<DrainOutcome, StorageError> {
    let Ok(_guard) = self.in_flight.try_lock() else {
      tracing::debug!("drain already in flight, skipping");
      return Ok(DrainOutcome::AlreadyRunning);
    };

    let ids: Vec<i64> = self.queue.entries()?.iter().map(|e| e.id).collect();
    let mut report = DrainReport::default();
    if ids.is_empty() {
      return Ok(DrainOutcome::Completed(report));
    }

    tracing::info!(pending = ids.len(), "draining sync queue");

    for id in ids {
      // Re-read: an earlier acknowledgment may have retargeted this entry.
      let Some(entry) = self.queue.get(id)? else {
        continue;
      };
      report.attempted += 1;

      match self.submit(&entry).await {
        Ok(response) => {
          self.queue.remove(entry.id)?;
          if let Some(record) = &entry.record_ref {
            if self.queue.references(record)? == 0 {
              self.store.mark_synced(record.collection, &record.key)?;
            }
          }
          if let Some(hook) = &self.ack_hook {
            hook.acknowledged(&entry, &response)?;
          }
          report.synced += 1;
          tracing::debug!(id = entry.id, endpoint = %entry.endpoint, "entry acknowledged");
        }
        Err(SyncError::Storage(e)) => return Err(e),
        Err(e) => {
          self.queue.record_failure(entry.id, &e.to_string())?;
          if e.is_transient() {
            report.failed += 1;
            tracing::debug!(id = entry.id, error = %e, "delivery failed, will retry");
          } else {
            report.rejected += 1;
            tracing::warn!(
              id = entry.id,
              endpoint = %entry.endpoint,
              attempts = entry.attempts + 1,
              error = %e,
              "server rejected queued mutation, keeping it queued"
            );
          }
        }
      }
    }

    tracing::info!(
      synced = report.synced,
      failed = report.failed,
      rejected = report.rejected,
      "drain finished"
    );

    Ok(DrainOutcome::Completed(report))
  }

  async fn submit(&self, entry: &SyncQueueEntry) -> Result<HttpResponse, SyncError> {
    let url = self
      .base_url
      .join(&entry.endpoint)
      .map_err(|e| SyncError::InvalidInput(format!("bad endpoint '{}': {}", entry.endpoint, e)))?;

    let request = HttpRequest::new(entry.method, url)
      .json(&entry.payload)?
      .header("Idempotency-Key", &entry.idempotency_key);

    let response = self.transport.send(request).await?;
    match SyncError::from_status(response.status) {
      None => Ok(response),
      Some(e) => Err(e),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::Database;
  use crate::store::Collection;
  use crate::sync::queue::{Mutation, RecordRef};
  use crate::sync::transport::mock::MockTransport;
  use crate::sync::transport::Method;
  use serde_json::json;
  use std::time::Duration;

  fn setup(transport: Arc<MockTransport>) -> Reconciler {
    let db = Arc::new(Database::open_in_memory(None).unwrap());
    Reconciler::new(
      SyncQueue::new(db.clone()),
      LocalStore::new(db),
      transport,
      Url::parse("http://localhost:5050").unwrap(),
    )
  }

  fn enqueue(reconciler: &Reconciler, endpoint: &str) -> SyncQueueEntry {
    reconciler
      .queue()
      .enqueue(&Mutation::new(Method::Post, endpoint, json!({"n": endpoint})))
      .unwrap()
  }

  #[tokio::test]
  async fn empty_queue_is_a_noop() {
    let transport = Arc::new(MockTransport::ok());
    let reconciler = setup(transport.clone());

    let outcome = reconciler.drain().await.unwrap();
    assert_eq!(outcome, DrainOutcome::Completed(DrainReport::default()));
    let again = reconciler.drain().await.unwrap();
    assert_eq!(again, outcome);
    assert!(transport.requests().is_empty());
  }

  #[tokio::test]
  async fn drains_in_fifo_order_and_removes_acknowledged() {
    let transport = Arc::new(MockTransport::ok());
    let reconciler = setup(transport.clone());
    for i in 0..5 {
      enqueue(&reconciler, &format!("/api/projects/p{}/gps", i));
    }

    let outcome = reconciler.drain().await.unwrap();
    assert_eq!(outcome.report().unwrap().synced, 5);
    assert_eq!(reconciler.queue().len().unwrap(), 0);

    let paths: Vec<String> = transport
      .requests()
      .iter()
      .map(|r| r.url.path().to_string())
      .collect();
    let expected: Vec<String> = (0..5).map(|i| format!("/api/projects/p{}/gps", i)).collect();
    assert_eq!(paths, expected);
  }

  #[tokio::test]
  async fn one_failure_does_not_block_later_entries() {
    let transport = Arc::new(MockTransport::new(|request| {
      if request.url.path().contains("/p1/") {
        Err(SyncError::Network("reset by peer".into()))
      } else {
        Ok(HttpResponse::new(200, None, Vec::new()))
      }
    }));
    let reconciler = setup(transport.clone());
    enqueue(&reconciler, "/api/projects/p0/gps");
    let failing = enqueue(&reconciler, "/api/projects/p1/gps");
    enqueue(&reconciler, "/api/projects/p2/gps");

    let report = *reconciler.drain().await.unwrap().report().unwrap();
    assert_eq!(report.attempted, 3);
    assert_eq!(report.synced, 2);
    assert_eq!(report.failed, 1);

    let remaining = reconciler.queue().entries().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, failing.id);
    assert_eq!(remaining[0].attempts, 1);
  }

  #[tokio::test]
  async fn rejected_entries_stay_queued() {
    let transport = Arc::new(MockTransport::new(|_| {
      Ok(HttpResponse::new(422, Some("application/json"), b"{}".to_vec()))
    }));
    let reconciler = setup(transport.clone());
    enqueue(&reconciler, "/api/projects/p0/photo");

    let report = *reconciler.drain().await.unwrap().report().unwrap();
    assert_eq!(report.rejected, 1);
    assert_eq!(report.synced, 0);
    let entry = &reconciler.queue().entries().unwrap()[0];
    assert_eq!(entry.attempts, 1);
    assert!(entry.last_error.as_deref().unwrap().contains("422"));
  }

  #[tokio::test]
  async fn retries_recur_on_next_drain() {
    let transport = Arc::new(MockTransport::ok());
    let reconciler = setup(transport.clone());
    enqueue(&reconciler, "/api/projects/p0/gps");

    transport.set_offline(true);
    reconciler.drain().await.unwrap();
    reconciler.drain().await.unwrap();
    assert_eq!(reconciler.queue().entries().unwrap()[0].attempts, 2);

    transport.set_offline(false);
    reconciler.drain().await.unwrap();
    assert!(reconciler.queue().is_empty().unwrap());
  }

  #[tokio::test]
  async fn concurrent_drains_submit_each_entry_once() {
    let transport = Arc::new(MockTransport::ok().with_delay(Duration::from_millis(20)));
    let reconciler = setup(transport.clone());
    for i in 0..4 {
      enqueue(&reconciler, &format!("/api/projects/p{}/gps", i));
    }

    let (a, b) = tokio::join!(reconciler.drain(), reconciler.drain());
    let outcomes = [a.unwrap(), b.unwrap()];
    assert!(outcomes.contains(&DrainOutcome::AlreadyRunning));

    let per_key = transport.submissions_per_key();
    assert_eq!(per_key.len(), 4);
    assert!(per_key.values().all(|&count| count == 1));
    assert!(reconciler.queue().is_empty().unwrap());
  }

  #[tokio::test]
  async fn acknowledgment_marks_local_record_synced() {
    use crate::field::types::GpsPoint;
    use crate::store::Index;

    let transport = Arc::new(MockTransport::ok());
    let reconciler = setup(transport.clone());
    let mut point = GpsPoint {
      id: "pt1".into(),
      project_id: "p1".into(),
      label: "corner".into(),
      kind: "corner".into(),
      lat: 39.0,
      lon: -105.0,
      altitude: None,
      altitude_accuracy: None,
      accuracy: 5.0,
      timestamp: chrono::Utc::now(),
      synced: false,
    };
    reconciler.store.put(&mut point).unwrap();
    reconciler
      .queue()
      .enqueue(
        &Mutation::new(Method::Post, "/api/projects/p1/gps", serde_json::to_value(&point).unwrap())
          .for_record(RecordRef::new(Collection::GpsPoints, "pt1")),
      )
      .unwrap();

    reconciler.drain().await.unwrap();

    let unsynced: Vec<GpsPoint> = reconciler.store.get_all_by_index(Index::Synced(false)).unwrap();
    assert!(unsynced.is_empty());
  }

  #[tokio::test]
  async fn requests_carry_idempotency_key() {
    let transport = Arc::new(MockTransport::ok());
    let reconciler = setup(transport.clone());
    let entry = enqueue(&reconciler, "/api/projects/p0/gps");

    reconciler.drain().await.unwrap();

    let request = &transport.requests()[0];
    assert_eq!(request.method, Method::Post);
    assert!(request
      .headers
      .contains(&("Idempotency-Key".to_string(), entry.idempotency_key.clone())));
  }

  #[tokio::test]
  async fn throttled_entries_count_as_retryable() {
    let transport = Arc::new(MockTransport::ok());
    transport.push_result(Ok(HttpResponse::new(429, None, Vec::new())));
    let reconciler = setup(transport.clone());
    enqueue(&reconciler, "/api/projects/p0/gps");

    let report = *reconciler.drain().await.unwrap().report().unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.rejected, 0);

    let report = *reconciler.drain().await.unwrap().report().unwrap();
    assert_eq!(report.synced, 1);
  }

  #[tokio::test]
  async fn record_stays_unsynced_while_other_entries_carry_it() {
    use crate::field::types::{Project, Property};

    let transport = Arc::new(MockTransport::ok());
    let reconciler = setup(transport.clone());
    let mut project = Project::new(Property::default());
    reconciler.store.put(&mut project).unwrap();
    let endpoint = format!("/api/projects/{}", project.id);
    for notes in ["first", "second"] {
      reconciler
        .queue()
        .enqueue(
          &Mutation::new(Method::Put, endpoint.as_str(), json!({"notes": notes}))
            .for_record(RecordRef::new(Collection::Projects, project.id.clone())),
        )
        .unwrap();
    }

    transport.push_result(Ok(HttpResponse::new(200, None, Vec::new())));
    transport.push_result(Err(SyncError::Network("reset by peer".into())));
    reconciler.drain().await.unwrap();
    let stored: Project = reconciler.store.get(&project.id).unwrap().unwrap();
    assert!(!stored.synced);

    reconciler.drain().await.unwrap();
    let stored: Project = reconciler.store.get(&project.id).unwrap().unwrap();
    assert!(stored.synced);
  }

  #[tokio::test]
  async fn ack_hook_sees_response_and_can_retarget_later_entries() {
    struct Retarget(SyncQueue);

    impl AckHook for Retarget {
      fn acknowledged(
        &self,
        _entry: &SyncQueueEntry,
        response: &HttpResponse,
      ) -> Result<(), StorageError> {
        let target: String = response.json().unwrap_or_default();
        for entry in self.0.entries()? {
          self.0.retarget(entry.id, &target, &entry.payload, None)?;
        }
        Ok(())
      }
    }

    let transport = Arc::new(MockTransport::ok());
    transport.push_result(Ok(HttpResponse::new(
      201,
      Some("application/json"),
      br#""/api/projects/moved/gps""#.to_vec(),
    )));
    let db = Arc::new(Database::open_in_memory(None).unwrap());
    let queue = SyncQueue::new(db.clone());
    let reconciler = Reconciler::new(
      queue.clone(),
      LocalStore::new(db),
      transport.clone(),
      Url::parse("http://localhost:5050").unwrap(),
    )
    .with_ack_hook(Arc::new(Retarget(queue)));
    enqueue(&reconciler, "/api/projects");
    enqueue(&reconciler, "/api/projects/p0/gps");

    reconciler.drain().await.unwrap();

    assert_eq!(transport.count_for("/api/projects/moved/gps"), 1);
    assert_eq!(transport.count_for("/api/projects/p0/gps"), 0);
  }
}
