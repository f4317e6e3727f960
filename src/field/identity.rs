//! Adopts project ids assigned by the server.
//!
//! Projects are created locally under a client id. A server that names its
//! own projects answers the create with `{"project_id": ...}`; from then on
//! only that id resolves, so the local records and every queued entry for the
//! project are moved over to it.

use serde_json::Value;

use crate::error::StorageError;
use crate::store::{Collection, Index, LocalStore};
use crate::sync::{AckHook, HttpResponse, Method, RecordRef, SyncQueue, SyncQueueEntry};

use super::api_types::{project_endpoint, projects_endpoint, CreatedProject};
use super::types::{GpsPoint, Photo, Project};

#[derive(Clone)]
pub struct ServerAssignedIds {
  store: LocalStore,
  queue: SyncQueue,
}

impl ServerAssignedIds {
  pub fn new(store: LocalStore, queue: SyncQueue) -> Self {
    Self { store, queue }
  }

  fn rekey_project(&self, old: &str, new: &str) -> Result<(), StorageError> {
    tracing::info!(old, new, "server assigned project id, rekeying local records");

    if let Some(mut project) = self.store.get::<Project>(old)? {
      project.id = new.to_string();
      for point in &mut project.gps_points {
        if point.project_id == old {
          point.project_id = new.to_string();
        }
      }
      self.store.rewrite(old, &mut project)?;
    }

    for mut point in self.store.get_all_by_index::<GpsPoint>(Index::Parent(old))? {
      point.project_id = new.to_string();
      let key = point.id.clone();
      self.store.rewrite(&key, &mut point)?;
    }
    for mut photo in self.store.get_all_by_index::<Photo>(Index::Parent(old))? {
      photo.project_id = new.to_string();
      let key = photo.id.clone();
      self.store.rewrite(&key, &mut photo)?;
    }

    for entry in self.queue.entries()? {
      let endpoint = retarget_endpoint(&entry.endpoint, old, new);
      let mut payload = entry.payload.clone();
      let payload_changed = retarget_payload(&mut payload, old, new);
      let record_ref = match &entry.record_ref {
        Some(r) if r.collection == Collection::Projects && r.key == old => {
          Some(RecordRef::new(Collection::Projects, new))
        }
        other => other.clone(),
      };

      if endpoint.is_some() || payload_changed || record_ref != entry.record_ref {
        let endpoint = endpoint.unwrap_or(entry.endpoint);
        self
          .queue
          .retarget(entry.id, &endpoint, &payload, record_ref.as_ref())?;
      }
    }

    Ok(())
  }
}

impl AckHook for ServerAssignedIds {
  fn acknowledged(
    &self,
    entry: &SyncQueueEntry,
    response: &HttpResponse,
  ) -> Result<(), StorageError> {
    let Some(record) = &entry.record_ref else {
      return Ok(());
    };
    if entry.method != Method::Post
      || record.collection != Collection::Projects
      || entry.endpoint != projects_endpoint()
    {
      return Ok(());
    }

    let assigned = response
      .json::<CreatedProject>()
      .ok()
      .and_then(|created| created.project_id)
      .filter(|id| !id.is_empty() && *id != record.key);

    match assigned {
      Some(id) => self.rekey_project(&record.key, &id),
      None => Ok(()),
    }
  }
}

/// `/api/projects/{old}[/...]` rewritten to the new id, or `None` if the
/// endpoint is not under the project.
fn retarget_endpoint(endpoint: &str, old: &str, new: &str) -> Option<String> {
  let prefix = project_endpoint(old);
  let rest = endpoint.strip_prefix(&prefix)?;
  if rest.is_empty() || rest.starts_with('/') {
    Some(format!("{}{}", project_endpoint(new), rest))
  } else {
    None
  }
}

fn retarget_payload(payload: &mut Value, old: &str, new: &str) -> bool {
  let Some(object) = payload.as_object_mut() else {
    return false;
  };

  let mut changed = false;
  for field in ["id", "project_id"] {
    if object.get(field).and_then(Value::as_str) == Some(old) {
      object.insert(field.to_string(), Value::from(new));
      changed = true;
    }
  }
  if let Some(points) = object.get_mut("gps_points").and_then(Value::as_array_mut) {
    for point in points {
      changed |= retarget_payload(point, old, new);
    }
  }
  changed
}
