//! Local store bindings for the site-visit types.

use chrono::{DateTime, Utc};

use crate::store::{Collection, Record};

use super::types::{BoundaryEntry, GpsPoint, Photo, Project};

impl Record for Project {
  fn collection() -> Collection {
    Collection::Projects
  }

  fn key(&self) -> String {
    self.id.clone()
  }

  fn parent_id(&self) -> Option<&str> {
    None
  }

  fn set_sync_state(&mut self, synced: bool, last_modified: DateTime<Utc>) {
    self.synced = synced;
    self.last_modified = last_modified;
  }
}

impl Record for GpsPoint {
  fn collection() -> Collection {
    Collection::GpsPoints
  }

  fn key(&self) -> String {
    self.id.clone()
  }

  fn parent_id(&self) -> Option<&str> {
    Some(&self.project_id)
  }

  fn set_sync_state(&mut self, synced: bool, _last_modified: DateTime<Utc>) {
    // Points are immutable after capture; only the flag moves.
    self.synced = synced;
  }
}

impl Record for Photo {
  fn collection() -> Collection {
    Collection::Photos
  }

  fn key(&self) -> String {
    self.id.clone()
  }

  fn parent_id(&self) -> Option<&str> {
    Some(&self.project_id)
  }

  fn set_sync_state(&mut self, synced: bool, _last_modified: DateTime<Utc>) {
    self.synced = synced;
  }
}

impl Record for BoundaryEntry {
  fn collection() -> Collection {
    Collection::Boundaries
  }

  fn key(&self) -> String {
    self.parcel_id.clone()
  }

  fn parent_id(&self) -> Option<&str> {
    None
  }

  fn set_sync_state(&mut self, synced: bool, last_modified: DateTime<Utc>) {
    self.synced = synced;
    self.cached_at = last_modified;
  }
}
