//! Foreground operations on site-visit data.
//!
//! Every mutation is applied to the local store first and then queued for the
//! server. When the session believes it is online the queue is drained right
//! away; otherwise the connectivity monitor drains it on reconnection.

use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;
use uuid::Uuid;

use crate::connectivity::{Connectivity, ConnectivityMonitor};
use crate::error::{StorageError, SyncError};
use crate::event::{EventBus, SyncEvent};
use crate::field::api_types::{
  decode_photo, gps_endpoint, photo_endpoint, project_endpoint, projects_endpoint, PhotoUpload,
};
use crate::field::{BoundaryEntry, GpsPoint, Photo, Project, ProjectStatus, Property};
use crate::geo::GeolocationProvider;
use crate::store::{Collection, Index, LocalStore, Record};
use crate::sync::{DrainOutcome, Method, Mutation, Reconciler, RecordRef, Transport};
use crate::tiles::{BoundingBox, PrefetchProgress, TilePrefetch};

/// A local write that did not land and is held in memory until flushed.
#[derive(Debug, Clone)]
enum PendingWrite {
  Project(Project),
  /// Project whose change rides on a child's queue entry
  Attachment(Project),
  GpsPoint(GpsPoint),
  Photo(Photo),
  Boundary(BoundaryEntry),
  Enqueue(Mutation),
}

impl PendingWrite {
  fn describe(&self) -> String {
    match self {
      Self::Project(p) => format!("project {}", p.id),
      Self::Attachment(p) => format!("attachments of project {}", p.id),
      Self::GpsPoint(p) => format!("gps point '{}'", p.label),
      Self::Photo(p) => format!("photo '{}'", p.label),
      Self::Boundary(b) => format!("boundary for parcel {}", b.parcel_id),
      Self::Enqueue(m) => format!("{} {}", m.method.as_str(), m.endpoint),
    }
  }
}

/// Sensor and map capabilities the session depends on.
pub struct Capabilities {
  pub geolocation: Arc<dyn GeolocationProvider>,
  pub tiles: Arc<dyn TilePrefetch>,
}

pub struct Session {
  store: LocalStore,
  reconciler: Reconciler,
  monitor: Arc<ConnectivityMonitor>,
  events: EventBus,
  geolocation: Arc<dyn GeolocationProvider>,
  tiles: Arc<dyn TilePrefetch>,
  pending_writes: Mutex<Vec<PendingWrite>>,
  permission_prompted: AtomicBool,
}

impl Session {
  pub fn new(
    store: LocalStore,
    reconciler: Reconciler,
    monitor: Arc<ConnectivityMonitor>,
    events: EventBus,
    capabilities: Capabilities,
  ) -> Self {
    Self {
      store,
      reconciler,
      monitor,
      events,
      geolocation: capabilities.geolocation,
      tiles: capabilities.tiles,
      pending_writes: Mutex::new(Vec::new()),
      permission_prompted: AtomicBool::new(false),
    }
  }

  pub fn store(&self) -> &LocalStore {
    &self.store
  }

  pub fn events(&self) -> &EventBus {
    &self.events
  }

  pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
    &self.monitor
  }

  // ==========================================================================
  // Projects
  // ==========================================================================

  /// Create a project locally and queue its creation on the server.
  pub async fn create_project(&self, property: Property) -> Result<Project, SyncError> {
    let mut project = Project::new(property);
    self.persist_project(&mut project)?;

    let payload = serde_json::to_value(&project)?;
    self.enqueue(
      Mutation::new(Method::Post, projects_endpoint(), payload)
        .for_record(RecordRef::new(Collection::Projects, &project.id)),
    )?;

    tracing::info!(project = %project.id, "created project");
    self.sync_if_online().await;
    Ok(project)
  }

  /// Overwrite the whole project, locally and then on the server.
  pub async fn update_project(&self, mut project: Project) -> Result<Project, SyncError> {
    self.persist_project(&mut project)?;

    let payload = serde_json::to_value(&project)?;
    self.enqueue(
      Mutation::new(Method::Put, project_endpoint(&project.id), payload)
        .for_record(RecordRef::new(Collection::Projects, &project.id)),
    )?;

    self.sync_if_online().await;
    Ok(project)
  }

  pub fn project(&self, project_id: &str) -> Result<Project, SyncError> {
    self
      .store
      .get::<Project>(project_id)?
      .ok_or_else(|| SyncError::NotFound(format!("project {}", project_id)))
  }

  pub fn projects(&self) -> Result<Vec<Project>, SyncError> {
    Ok(self.store.get_all::<Project>()?)
  }

  pub async fn set_status(&self, project_id: &str, status: ProjectStatus) -> Result<Project, SyncError> {
    let mut project = self.project(project_id)?;
    project.status = status;
    self.update_project(project).await
  }

  pub async fn set_notes(&self, project_id: &str, notes: &str) -> Result<Project, SyncError> {
    let mut project = self.project(project_id)?;
    project.notes = notes.to_string();
    self.update_project(project).await
  }

  /// Replace one checklist section of the visit data.
  pub async fn update_visit_section(
    &self,
    project_id: &str,
    section: &str,
    value: Value,
  ) -> Result<Project, SyncError> {
    if section.trim().is_empty() {
      return Err(SyncError::InvalidInput("section name is empty".to_string()));
    }
    let mut project = self.project(project_id)?;
    project.visit_data.insert(section.to_string(), value);
    self.update_project(project).await
  }

  // ==========================================================================
  // Captures
  // ==========================================================================

  /// Record the current position as a labeled point of the project.
  ///
  /// Only the point itself is queued; the server appends it to the project,
  /// so the project's own sync state is left as it was.
  pub async fn capture_point(
    &self,
    project_id: &str,
    label: &str,
    kind: &str,
  ) -> Result<GpsPoint, SyncError> {
    let mut project = self.project(project_id)?;

    let reading = match self.geolocation.current_reading().await {
      Ok(reading) => reading,
      Err(SyncError::PermissionDenied(reason)) => {
        self.permission_denied(&reason);
        return Err(SyncError::PermissionDenied(reason));
      }
      Err(e) => return Err(e),
    };

    let mut point = GpsPoint::from_reading(project_id, label, kind, &reading);
    self.persist(&mut point, PendingWrite::GpsPoint)?;

    project.gps_points.push(point.clone());
    self.persist_attachment(&mut project)?;

    let payload = serde_json::to_value(&point)?;
    self.enqueue(
      Mutation::new(Method::Post, gps_endpoint(project_id), payload)
        .for_record(RecordRef::new(Collection::GpsPoints, &point.id)),
    )?;

    tracing::info!(
      project = %project_id,
      label = %label,
      lat = point.lat,
      lon = point.lon,
      accuracy = point.accuracy,
      "captured gps point"
    );
    self.sync_if_online().await;
    Ok(point)
  }

  /// Attach a base64 photo (plain or `data:` URL) to the project.
  pub async fn add_photo(&self, project_id: &str, payload: &str, label: &str) -> Result<Photo, SyncError> {
    let mut project = self.project(project_id)?;
    let data = decode_photo(payload)?;
    if data.is_empty() {
      return Err(SyncError::InvalidInput("no photo data".to_string()));
    }

    // A photo without a position is still worth keeping.
    let gps = self.geolocation.current_reading().await.ok();

    let mut photo = Photo {
      id: Uuid::new_v4().simple().to_string(),
      project_id: project_id.to_string(),
      data,
      label: label.to_string(),
      timestamp: chrono::Utc::now(),
      gps,
      synced: false,
    };
    self.persist(&mut photo, PendingWrite::Photo)?;

    project.photos.push(photo.reference());
    self.persist_attachment(&mut project)?;

    let payload = serde_json::to_value(PhotoUpload::from(&photo))?;
    self.enqueue(
      Mutation::new(Method::Post, photo_endpoint(project_id), payload)
        .for_record(RecordRef::new(Collection::Photos, &photo.id)),
    )?;

    tracing::info!(project = %project_id, label = %label, bytes = photo.data.len(), "added photo");
    self.sync_if_online().await;
    Ok(photo)
  }

  pub fn points(&self, project_id: &str) -> Result<Vec<GpsPoint>, SyncError> {
    Ok(self.store.get_all_by_index(Index::Parent(project_id))?)
  }

  pub fn photos(&self, project_id: &str) -> Result<Vec<Photo>, SyncError> {
    Ok(self.store.get_all_by_index(Index::Parent(project_id))?)
  }

  // ==========================================================================
  // Boundaries and tiles
  // ==========================================================================

  /// Cache parcel geometry for offline display. Never queued.
  pub fn cache_boundary(&self, parcel_id: &str, geometry: Value) -> Result<BoundaryEntry, SyncError> {
    let mut entry = BoundaryEntry {
      parcel_id: parcel_id.to_string(),
      geometry,
      cached_at: chrono::Utc::now(),
      synced: false,
    };
    self.persist(&mut entry, PendingWrite::Boundary)?;
    Ok(entry)
  }

  pub fn boundary(&self, parcel_id: &str) -> Result<Option<BoundaryEntry>, SyncError> {
    Ok(self.store.get(parcel_id)?)
  }

  /// Ask the tile capability to cache an area for offline use.
  pub async fn prefetch_tiles(
    &self,
    area: BoundingBox,
    max_zoom: u8,
  ) -> Result<mpsc::UnboundedReceiver<PrefetchProgress>, SyncError> {
    self.tiles.prefetch(area, max_zoom).await
  }

  // ==========================================================================
  // Sync
  // ==========================================================================

  pub fn pending_count(&self) -> Result<usize, SyncError> {
    Ok(self.reconciler.queue().len()?)
  }

  /// Drain the queue now, whatever the last connectivity signal said.
  ///
  /// Writes held in memory are retried first so their queue entries go out
  /// with this drain.
  pub async fn sync_now(&self) -> Result<DrainOutcome, SyncError> {
    if self.stashed_writes() > 0 {
      if let Err(e) = self.flush_pending_writes() {
        tracing::warn!(error = %e, "could not flush held writes before sync");
      }
    }

    let outcome = self.reconciler.drain().await?;
    if let DrainOutcome::Completed(report) = outcome {
      self.events.emit(SyncEvent::Drained {
        synced: report.synced,
        failed: report.failed,
        rejected: report.rejected,
      });
      if report.rejected > 0 {
        self.events.emit(SyncEvent::Notice(format!(
          "{} change(s) rejected by the server",
          report.rejected
        )));
      }
    }
    self.events.emit(SyncEvent::PendingChanged(self.pending_count()?));
    Ok(outcome)
  }

  /// Apply one connectivity reading.
  ///
  /// Held writes are retried first. When they land while the state stays
  /// online there is no transition to trigger a drain, so one runs here.
  pub async fn observe_connectivity(&self, state: Connectivity) -> Result<(), SyncError> {
    let flushed = if self.stashed_writes() > 0 {
      self.flush_pending_writes()?
    } else {
      0
    };

    let transitioned = self.monitor.set(state).await?.is_some();
    if flushed > 0 && !transitioned && self.monitor.is_online() {
      self.sync_now().await?;
    }
    Ok(())
  }

  /// Probe forever, feeding each result into
  /// [`observe_connectivity`](Self::observe_connectivity).
  pub async fn run_probe_loop(&self, transport: Arc<dyn Transport>, url: Url, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
      ticker.tick().await;
      let state = ConnectivityMonitor::probe(transport.as_ref(), &url).await;
      if let Err(e) = self.observe_connectivity(state).await {
        tracing::warn!(error = %e, "failed to handle connectivity reading");
        self.events.emit(SyncEvent::Notice(format!("sync paused: {}", e)));
      }
    }
  }

  async fn sync_if_online(&self) {
    if !self.monitor.is_online() {
      if let Ok(pending) = self.pending_count() {
        self.events.emit(SyncEvent::PendingChanged(pending));
      }
      return;
    }
    if let Err(e) = self.sync_now().await {
      tracing::warn!(error = %e, "sync after local write failed");
      self.events.emit(SyncEvent::Notice(format!("sync paused: {}", e)));
    }
  }

  /// Number of local writes held in memory after a storage failure.
  pub fn stashed_writes(&self) -> usize {
    self.pending_writes.lock().map(|w| w.len()).unwrap_or(0)
  }

  /// Retry local writes that previously failed. Returns how many landed.
  pub fn flush_pending_writes(&self) -> Result<usize, SyncError> {
    let writes = {
      let mut pending = self
        .pending_writes
        .lock()
        .map_err(|_| StorageError::LockPoisoned)?;
      std::mem::take(&mut *pending)
    };
    if writes.is_empty() {
      return Ok(0);
    }

    let mut flushed = 0;
    let mut remaining: VecDeque<PendingWrite> = writes.into();
    while let Some(write) = remaining.front() {
      match self.apply(write.clone()) {
        Ok(()) => {
          remaining.pop_front();
          flushed += 1;
        }
        // Still full; keep this and everything after it in order.
        Err(StorageError::QuotaExceeded) => break,
        Err(e) => {
          self.restash(remaining.into());
          return Err(e.into());
        }
      }
    }
    let remaining: Vec<PendingWrite> = remaining.into();

    tracing::info!(flushed, remaining = remaining.len(), "flushed pending writes");
    if !remaining.is_empty() {
      self.events.emit(SyncEvent::StorageQuota(format!(
        "{} change(s) still held in memory",
        remaining.len()
      )));
    }
    self.restash(remaining);
    Ok(flushed)
  }

  // ==========================================================================
  // Internals
  // ==========================================================================

  fn apply(&self, write: PendingWrite) -> Result<(), StorageError> {
    match write {
      PendingWrite::Project(mut p) => self.store.put(&mut p),
      PendingWrite::Attachment(mut p) => {
        let key = p.id.clone();
        if self.store.rewrite(&key, &mut p)? {
          Ok(())
        } else {
          self.store.put(&mut p)
        }
      }
      PendingWrite::GpsPoint(mut p) => self.store.put(&mut p),
      PendingWrite::Photo(mut p) => self.store.put(&mut p),
      PendingWrite::Boundary(mut b) => self.store.put(&mut b),
      PendingWrite::Enqueue(m) => self.reconciler.queue().enqueue(&m).map(|_| ()),
    }
  }

  fn restash(&self, mut writes: Vec<PendingWrite>) {
    if writes.is_empty() {
      return;
    }
    match self.pending_writes.lock() {
      Ok(mut pending) => {
        // Anything stashed while flushing goes after the older writes.
        writes.append(&mut pending);
        *pending = writes;
      }
      Err(_) => tracing::error!(lost = writes.len(), "pending write buffer poisoned"),
    }
  }

  fn persist_project(&self, project: &mut Project) -> Result<(), SyncError> {
    self.persist(project, PendingWrite::Project)
  }

  /// Store a project without touching its sync state. Falls back to a plain
  /// put when the project never landed locally.
  fn persist_attachment(&self, project: &mut Project) -> Result<(), SyncError> {
    let key = project.id.clone();
    match self.store.rewrite(&key, project) {
      Ok(true) => Ok(()),
      Ok(false) => self.persist_project(project),
      Err(StorageError::QuotaExceeded) => {
        self.stash(PendingWrite::Attachment(project.clone()));
        Ok(())
      }
      Err(e) => Err(e.into()),
    }
  }

  /// Store a record; on a full store keep it in memory and warn the user.
  fn persist<T: Record>(&self, record: &mut T, stash: fn(T) -> PendingWrite) -> Result<(), SyncError> {
    match self.store.put(record) {
      Ok(()) => Ok(()),
      Err(StorageError::QuotaExceeded) => {
        self.stash(stash(record.clone()));
        Ok(())
      }
      Err(e) => Err(e.into()),
    }
  }

  fn enqueue(&self, mutation: Mutation) -> Result<(), SyncError> {
    match self.reconciler.queue().enqueue(&mutation) {
      Ok(_) => Ok(()),
      Err(StorageError::QuotaExceeded) => {
        self.stash(PendingWrite::Enqueue(mutation));
        Ok(())
      }
      Err(e) => Err(e.into()),
    }
  }

  fn stash(&self, write: PendingWrite) {
    let what = write.describe();
    tracing::warn!(write = %what, "local store full, holding write in memory");
    match self.pending_writes.lock() {
      Ok(mut pending) => pending.push(write),
      Err(_) => tracing::error!(write = %what, "pending write buffer poisoned, write lost"),
    }
    self.events.emit(SyncEvent::StorageQuota(format!(
      "storage full: {} is only kept in memory until space frees up",
      what
    )));
  }

  fn permission_denied(&self, reason: &str) {
    if !self.permission_prompted.swap(true, Ordering::SeqCst) {
      self.events.emit(SyncEvent::PermissionRequired(format!(
        "location access is needed to capture points: {}",
        reason
      )));
    } else {
      self.events.emit(SyncEvent::Notice(format!("location unavailable: {}", reason)));
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::connectivity::Connectivity;
  use crate::db::Database;
  use crate::field::ServerAssignedIds;
  use crate::geo::{FixedGeolocation, NullGeolocation, Reading};
  use crate::sync::transport::mock::MockTransport;
  use crate::sync::SyncQueue;
  use crate::tiles::NullTilePrefetcher;
  use async_trait::async_trait;
  use chrono::{TimeZone, Utc};
  use serde_json::json;
  use tokio::sync::broadcast;
  use url::Url;

  struct Harness {
    session: Session,
    transport: Arc<MockTransport>,
    db: Arc<Database>,
  }

  fn harness_with(
    initial: Connectivity,
    geolocation: Arc<dyn GeolocationProvider>,
    max_pages: Option<u32>,
  ) -> Harness {
    let db = Arc::new(Database::open_in_memory(max_pages).unwrap());
    let transport = Arc::new(MockTransport::ok());
    let store = LocalStore::new(db.clone());
    let queue = SyncQueue::new(db.clone());
    let reconciler = Reconciler::new(
      queue.clone(),
      store.clone(),
      transport.clone(),
      Url::parse("http://localhost:5050").unwrap(),
    )
    .with_ack_hook(Arc::new(ServerAssignedIds::new(store.clone(), queue)));
    let events = EventBus::default();
    let monitor = Arc::new(ConnectivityMonitor::new(initial, reconciler.clone(), events.clone()));
    let session = Session::new(
      store,
      reconciler,
      monitor,
      events,
      Capabilities {
        geolocation,
        tiles: Arc::new(NullTilePrefetcher),
      },
    );
    Harness {
      session,
      transport,
      db,
    }
  }

  fn harness(initial: Connectivity) -> Harness {
    harness_with(
      initial,
      Arc::new(FixedGeolocation::new(39.160840, -104.932185, 4.0)),
      None,
    )
  }

  fn raise_quota(db: &Database) {
    let _: i64 = db
      .conn()
      .unwrap()
      .query_row("PRAGMA max_page_count = 100000", [], |row| row.get(0))
      .unwrap();
  }

  fn big_photo() -> String {
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, vec![7u8; 512 * 1024])
  }

  fn drain_events(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
      events.push(event);
    }
    events
  }

  /// Yields scripted readings in order.
  struct ScriptedGeolocation(Mutex<Vec<Reading>>);

  #[async_trait]
  impl GeolocationProvider for ScriptedGeolocation {
    async fn current_reading(&self) -> Result<Reading, SyncError> {
      Ok(self.0.lock().unwrap().remove(0))
    }
  }

  #[tokio::test]
  async fn well_location_offline_then_synced_once() {
    let h = harness(Connectivity::Online);
    let project = h.session.create_project(Property::default()).await.unwrap();
    assert_eq!(h.session.pending_count().unwrap(), 0);

    h.session.monitor().set_online(false).await.unwrap();
    let point = h
      .session
      .capture_point(&project.id, "well_location", "well")
      .await
      .unwrap();

    let stored = h.session.project(&project.id).unwrap();
    assert_eq!(stored.gps_points.len(), 1);
    assert_eq!(stored.gps_points[0].label, "well_location");
    assert_eq!(h.session.pending_count().unwrap(), 1);

    let gps_path = format!("/api/projects/{}/gps", project.id);
    assert_eq!(h.transport.count_for(&gps_path), 0);

    h.session.monitor().set_online(true).await.unwrap();
    assert_eq!(h.session.pending_count().unwrap(), 0);
    assert_eq!(h.transport.count_for(&gps_path), 1);

    let mut expected = point.clone();
    expected.synced = true;
    let persisted: GpsPoint = h.session.store().get(&point.id).unwrap().unwrap();
    assert_eq!(persisted, expected);
  }

  #[tokio::test]
  async fn synced_point_payload_matches_captured_point() {
    let h = harness(Connectivity::Offline);
    let project = h.session.create_project(Property::default()).await.unwrap();
    let point = h
      .session
      .capture_point(&project.id, "corner_ne", "corner")
      .await
      .unwrap();

    h.session.sync_now().await.unwrap();

    let request = h
      .transport
      .requests()
      .into_iter()
      .find(|r| r.url.path().ends_with("/gps"))
      .unwrap();
    let sent: GpsPoint = serde_json::from_slice(request.body.as_deref().unwrap()).unwrap();
    assert_eq!(sent, point);
  }

  #[tokio::test]
  async fn identical_coordinates_with_distinct_timestamps_both_persist() {
    let at = |secs| Reading {
      lat: 39.16,
      lon: -104.93,
      altitude: None,
      altitude_accuracy: None,
      accuracy: 5.0,
      timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
    };
    let geo = Arc::new(ScriptedGeolocation(Mutex::new(vec![
      at(1_760_000_000),
      at(1_760_000_060),
    ])));
    let h = harness_with(Connectivity::Offline, geo, None);
    let project = h.session.create_project(Property::default()).await.unwrap();

    let first = h.session.capture_point(&project.id, "septic", "septic").await.unwrap();
    let second = h.session.capture_point(&project.id, "septic", "septic").await.unwrap();
    assert_ne!(first.id, second.id);

    let points = h.session.points(&project.id).unwrap();
    assert_eq!(points.len(), 2);
    assert_eq!(h.session.project(&project.id).unwrap().gps_points.len(), 2);
  }

  #[tokio::test]
  async fn permission_prompt_is_shown_once() {
    let h = harness_with(Connectivity::Offline, Arc::new(NullGeolocation), None);
    let project = h.session.create_project(Property::default()).await.unwrap();
    let mut rx = h.session.events().subscribe();

    for _ in 0..3 {
      let result = h.session.capture_point(&project.id, "well", "well").await;
      assert!(matches!(result, Err(SyncError::PermissionDenied(_))));
    }

    let prompts = drain_events(&mut rx)
      .into_iter()
      .filter(|e| matches!(e, SyncEvent::PermissionRequired(_)))
      .count();
    assert_eq!(prompts, 1);
    assert!(h.session.points(&project.id).unwrap().is_empty());
  }

  #[tokio::test]
  async fn project_edits_queue_full_state_puts() {
    let h = harness(Connectivity::Offline);
    let project = h.session.create_project(Property::default()).await.unwrap();

    h.session
      .update_visit_section(&project.id, "well", json!({"permit": "123456"}))
      .await
      .unwrap();
    h.session.set_notes(&project.id, "gate code 4411").await.unwrap();
    let updated = h
      .session
      .set_status(&project.id, ProjectStatus::InProgress)
      .await
      .unwrap();

    assert_eq!(updated.notes, "gate code 4411");
    assert_eq!(updated.visit_data["well"]["permit"], "123456");

    let entries = h.session.reconciler.queue().entries().unwrap();
    let methods: Vec<Method> = entries.iter().map(|e| e.method).collect();
    assert_eq!(methods, vec![Method::Post, Method::Put, Method::Put, Method::Put]);
    assert_eq!(entries[3].payload["status"], "in_progress");
    assert_eq!(entries[3].payload["notes"], "gate code 4411");
  }

  #[tokio::test]
  async fn unknown_project_is_not_found() {
    let h = harness(Connectivity::Offline);
    assert!(matches!(
      h.session.set_notes("nope", "x").await,
      Err(SyncError::NotFound(_))
    ));
  }

  #[tokio::test]
  async fn photo_is_stored_referenced_and_queued() {
    let h = harness(Connectivity::Offline);
    let project = h.session.create_project(Property::default()).await.unwrap();

    let photo = h
      .session
      .add_photo(&project.id, "data:image/jpeg;base64,/9j/", "Driveway")
      .await
      .unwrap();
    assert_eq!(photo.data, vec![0xff, 0xd8, 0xff]);
    assert!(photo.gps.is_some());

    let stored = h.session.project(&project.id).unwrap();
    assert_eq!(stored.photos, vec![photo.reference()]);

    let entry = h.session.reconciler.queue().entries().unwrap().pop().unwrap();
    assert_eq!(entry.endpoint, format!("/api/projects/{}/photo", project.id));
    assert_eq!(entry.payload["photo"], "/9j/");
    assert_eq!(entry.payload["label"], "Driveway");

    assert!(h.session.add_photo(&project.id, "", "empty").await.is_err());
  }

  #[tokio::test]
  async fn boundaries_are_cached_locally_only() {
    let h = harness(Connectivity::Online);
    let geometry = json!({"type": "Polygon", "coordinates": [[[-104.94, 39.15], [-104.92, 39.15], [-104.92, 39.17], [-104.94, 39.15]]]});

    h.session.cache_boundary("7108000012", geometry.clone()).unwrap();
    let entry = h.session.boundary("7108000012").unwrap().unwrap();
    assert_eq!(entry.geometry, geometry);
    assert!(h.session.boundary("unknown").unwrap().is_none());
    assert!(h.transport.requests().is_empty());
  }

  #[tokio::test]
  async fn full_store_keeps_writes_in_memory_until_flushed() {
    let h = harness_with(
      Connectivity::Offline,
      Arc::new(FixedGeolocation::new(39.16, -104.93, 4.0)),
      Some(16),
    );
    let project = h.session.create_project(Property::default()).await.unwrap();
    let mut rx = h.session.events().subscribe();

    let photo = h.session.add_photo(&project.id, &big_photo(), "Soil pit").await.unwrap();

    assert!(h.session.stashed_writes() >= 1);
    assert!(drain_events(&mut rx)
      .iter()
      .any(|e| matches!(e, SyncEvent::StorageQuota(_))));
    assert!(h.session.store().get::<Photo>(&photo.id).unwrap().is_none());

    // Still full: nothing lands and nothing is lost.
    let before = h.session.stashed_writes();
    assert_eq!(h.session.flush_pending_writes().unwrap(), 0);
    assert_eq!(h.session.stashed_writes(), before);

    raise_quota(&h.db);

    assert_eq!(h.session.flush_pending_writes().unwrap(), before);
    assert_eq!(h.session.stashed_writes(), 0);
    let stored: Photo = h.session.store().get(&photo.id).unwrap().unwrap();
    assert_eq!(stored.data.len(), 512 * 1024);
  }

  #[tokio::test]
  async fn sync_now_reports_and_empties_queue() {
    let h = harness(Connectivity::Offline);
    h.session.create_project(Property::default()).await.unwrap();
    let mut rx = h.session.events().subscribe();

    let outcome = h.session.sync_now().await.unwrap();
    assert_eq!(outcome.report().unwrap().synced, 1);
    assert_eq!(
      drain_events(&mut rx),
      vec![
        SyncEvent::Drained {
          synced: 1,
          failed: 0,
          rejected: 0
        },
        SyncEvent::PendingChanged(0)
      ]
    );
  }

  #[tokio::test]
  async fn project_stays_synced_across_offline_captures() {
    let h = harness(Connectivity::Online);
    let project = h.session.create_project(Property::default()).await.unwrap();
    assert!(h.session.project(&project.id).unwrap().synced);

    h.session.monitor().set_online(false).await.unwrap();
    h.session
      .capture_point(&project.id, "corner_sw", "corner")
      .await
      .unwrap();
    h.session
      .add_photo(&project.id, "/9j/", "Driveway")
      .await
      .unwrap();
    h.session.monitor().set_online(true).await.unwrap();

    assert_eq!(h.session.pending_count().unwrap(), 0);
    let stored = h.session.project(&project.id).unwrap();
    assert!(stored.synced);
    assert_eq!(stored.gps_points.len(), 1);
    assert_eq!(stored.photos.len(), 1);
    assert!(h.session.points(&project.id).unwrap()[0].synced);
    assert!(h.session.photos(&project.id).unwrap()[0].synced);
  }

  #[tokio::test]
  async fn queued_edit_keeps_project_unsynced_until_delivered() {
    let h = harness(Connectivity::Online);
    let project = h.session.create_project(Property::default()).await.unwrap();

    h.session.monitor().set_online(false).await.unwrap();
    h.session.set_notes(&project.id, "dog on site").await.unwrap();
    h.session
      .capture_point(&project.id, "septic", "septic")
      .await
      .unwrap();
    assert!(!h.session.project(&project.id).unwrap().synced);

    h.session.monitor().set_online(true).await.unwrap();
    assert!(h.session.project(&project.id).unwrap().synced);
  }

  #[tokio::test]
  async fn held_upload_lands_and_drains_on_sync() {
    let h = harness_with(
      Connectivity::Online,
      Arc::new(FixedGeolocation::new(39.16, -104.93, 4.0)),
      Some(16),
    );
    let project = h.session.create_project(Property::default()).await.unwrap();
    let photo = h.session.add_photo(&project.id, &big_photo(), "Soil pit").await.unwrap();
    assert!(h.session.stashed_writes() >= 2);

    let photo_path = format!("/api/projects/{}/photo", project.id);
    assert_eq!(h.transport.count_for(&photo_path), 0);

    raise_quota(&h.db);
    let outcome = h.session.sync_now().await.unwrap();

    assert_eq!(outcome.report().unwrap().synced, 1);
    assert_eq!(h.session.stashed_writes(), 0);
    assert_eq!(h.session.pending_count().unwrap(), 0);
    assert_eq!(h.transport.count_for(&photo_path), 1);
    let stored: Photo = h.session.store().get(&photo.id).unwrap().unwrap();
    assert!(stored.synced);
  }

  #[tokio::test]
  async fn connectivity_tick_flushes_and_drains_while_online() {
    let h = harness_with(
      Connectivity::Online,
      Arc::new(FixedGeolocation::new(39.16, -104.93, 4.0)),
      Some(16),
    );
    let project = h.session.create_project(Property::default()).await.unwrap();
    h.session.add_photo(&project.id, &big_photo(), "Soil pit").await.unwrap();
    assert!(h.session.stashed_writes() > 0);

    // Still full: the tick keeps everything held.
    h.session.observe_connectivity(Connectivity::Online).await.unwrap();
    assert!(h.session.stashed_writes() > 0);

    raise_quota(&h.db);
    h.session.observe_connectivity(Connectivity::Online).await.unwrap();

    assert_eq!(h.session.stashed_writes(), 0);
    assert_eq!(h.session.pending_count().unwrap(), 0);
    let photo_path = format!("/api/projects/{}/photo", project.id);
    assert_eq!(h.transport.count_for(&photo_path), 1);
  }
}
