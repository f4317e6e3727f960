//! Serde types matching the field API's request and response bodies.
//!
//! These are separate from the domain types so the wire shape can follow the
//! server while the domain types follow the engine.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::SyncError;
use crate::geo::Reading;

use super::types::{GpsPoint, Photo, PhotoRef, Project, ProjectStatus, Property};

// ============================================================================
// Endpoints
// ============================================================================

pub fn projects_endpoint() -> String {
  "/api/projects".to_string()
}

pub fn project_endpoint(project_id: &str) -> String {
  format!("/api/projects/{}", project_id)
}

pub fn gps_endpoint(project_id: &str) -> String {
  format!("/api/projects/{}/gps", project_id)
}

pub fn photo_endpoint(project_id: &str) -> String {
  format!("/api/projects/{}/photo", project_id)
}

pub fn export_endpoint(project_id: &str) -> String {
  format!("/api/projects/{}/export", project_id)
}

// ============================================================================
// Bodies
// ============================================================================

/// Body of `POST /api/projects/{id}/photo`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoUpload {
  pub id: String,
  /// Base64 image, optionally as a `data:` URL
  pub photo: String,
  pub label: String,
  pub timestamp: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub gps: Option<Reading>,
}

impl From<&Photo> for PhotoUpload {
  fn from(photo: &Photo) -> Self {
    Self {
      id: photo.id.clone(),
      photo: STANDARD.encode(&photo.data),
      label: photo.label.clone(),
      timestamp: photo.timestamp,
      gps: photo.gps.clone(),
    }
  }
}

/// Drop a `data:image/jpeg;base64,` style prefix if present.
pub fn strip_data_url(encoded: &str) -> &str {
  match encoded.split_once(',') {
    Some((prefix, rest)) if prefix.starts_with("data:") => rest,
    _ => encoded,
  }
}

/// Decode a base64 photo payload, accepting `data:` URLs.
pub fn decode_photo(encoded: &str) -> Result<Vec<u8>, SyncError> {
  STANDARD
    .decode(strip_data_url(encoded.trim()))
    .map_err(|e| SyncError::InvalidInput(format!("photo is not valid base64: {}", e)))
}

/// Entry of `GET /api/projects`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSummary {
  pub id: String,
  #[serde(default)]
  pub address: String,
  #[serde(default)]
  pub client: String,
  #[serde(default)]
  pub created: String,
  #[serde(default)]
  pub status: ProjectStatus,
}

impl From<&Project> for ProjectSummary {
  fn from(project: &Project) -> Self {
    Self {
      id: project.id.clone(),
      address: project.property.address.clone(),
      client: project.property.client.clone(),
      created: project.created.to_rfc3339(),
      status: project.status,
    }
  }
}

/// Response of `POST /api/projects`. The server may assign its own id.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreatedProject {
  #[serde(default)]
  pub project_id: Option<String>,
}

/// Parse a server timestamp. Offset-less values are read as UTC.
pub fn parse_server_timestamp(raw: &str) -> Option<DateTime<Utc>> {
  if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
    return Some(ts.with_timezone(&Utc));
  }
  ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
    .iter()
    .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
    .map(|naive| naive.and_utc())
}

/// Project document as stored by the server.
///
/// Server-written projects carry naive timestamps, no `last_modified`, and
/// GPS and photo entries without ids, so every field is optional here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiProject {
  #[serde(default)]
  pub id: String,
  #[serde(default)]
  pub created: Option<String>,
  #[serde(default)]
  pub updated: Option<String>,
  #[serde(default)]
  pub last_modified: Option<String>,
  #[serde(default)]
  pub status: ProjectStatus,
  #[serde(default)]
  pub property: Property,
  #[serde(default)]
  pub visit_data: BTreeMap<String, Value>,
  #[serde(default)]
  pub gps_points: Vec<ApiGpsPoint>,
  #[serde(default)]
  pub photos: Vec<ApiPhotoRef>,
  #[serde(default)]
  pub notes: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiGpsPoint {
  #[serde(default)]
  pub id: Option<String>,
  #[serde(default)]
  pub project_id: Option<String>,
  #[serde(default)]
  pub label: String,
  #[serde(default, rename = "type")]
  pub kind: String,
  #[serde(default)]
  pub lat: f64,
  #[serde(default)]
  pub lon: f64,
  #[serde(default)]
  pub altitude: Option<f64>,
  #[serde(default)]
  pub altitude_accuracy: Option<f64>,
  #[serde(default)]
  pub accuracy: f64,
  #[serde(default)]
  pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiPhotoRef {
  #[serde(default)]
  pub id: Option<String>,
  #[serde(default)]
  pub filename: Option<String>,
  #[serde(default)]
  pub label: String,
  #[serde(default)]
  pub timestamp: Option<String>,
  /// A reading, or `{}` when the photo had no fix
  #[serde(default)]
  pub gps: Option<Value>,
}

impl ApiProject {
  /// Convert to the domain type. The result counts as synced: it is the
  /// server's copy.
  pub fn into_project(self) -> Project {
    let fallback = Utc::now();
    let created = self
      .created
      .as_deref()
      .and_then(parse_server_timestamp)
      .unwrap_or(fallback);
    let last_modified = [&self.last_modified, &self.updated]
      .into_iter()
      .find_map(|raw| raw.as_deref().and_then(parse_server_timestamp))
      .unwrap_or(created);

    let id = self.id;
    let gps_points = self
      .gps_points
      .into_iter()
      .enumerate()
      .map(|(i, point)| GpsPoint {
        id: point.id.unwrap_or_else(|| format!("{}-gps-{}", id, i)),
        project_id: point.project_id.unwrap_or_else(|| id.clone()),
        label: point.label,
        kind: point.kind,
        lat: point.lat,
        lon: point.lon,
        altitude: point.altitude,
        altitude_accuracy: point.altitude_accuracy,
        accuracy: point.accuracy,
        timestamp: point
          .timestamp
          .as_deref()
          .and_then(parse_server_timestamp)
          .unwrap_or(created),
        synced: true,
      })
      .collect();
    let photos = self
      .photos
      .into_iter()
      .enumerate()
      .map(|(i, photo)| PhotoRef {
        id: photo
          .id
          .or(photo.filename)
          .unwrap_or_else(|| format!("{}-photo-{}", id, i)),
        label: photo.label,
        timestamp: photo
          .timestamp
          .as_deref()
          .and_then(parse_server_timestamp)
          .unwrap_or(created),
        gps: photo.gps.and_then(|gps| serde_json::from_value(gps).ok()),
      })
      .collect();

    Project {
      id,
      created,
      status: self.status,
      property: self.property,
      visit_data: self.visit_data,
      gps_points,
      photos,
      notes: self.notes,
      synced: true,
      last_modified,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn endpoints_are_keyed_by_project() {
    assert_eq!(gps_endpoint("abc"), "/api/projects/abc/gps");
    assert_eq!(photo_endpoint("abc"), "/api/projects/abc/photo");
    assert_eq!(export_endpoint("abc"), "/api/projects/abc/export");
  }

  #[test]
  fn data_url_prefix_is_stripped() {
    assert_eq!(strip_data_url("data:image/jpeg;base64,/9j/"), "/9j/");
    assert_eq!(strip_data_url("/9j/"), "/9j/");
    assert_eq!(decode_photo("data:image/jpeg;base64,/9j/").unwrap(), vec![0xff, 0xd8, 0xff]);
    assert!(decode_photo("not base64!").is_err());
  }

  #[test]
  fn summary_tolerates_legacy_status() {
    let summary: ProjectSummary = serde_json::from_str(
      r#"{"id": "rodrigo_boulder_lane", "address": "13910 Boulder Lane", "status": "pending"}"#,
    )
    .unwrap();
    assert_eq!(summary.status, ProjectStatus::Draft);
    assert_eq!(summary.client, "");
  }

  #[test]
  fn server_written_project_decodes() {
    let raw = r#"{
      "id": "20261016_083000",
      "created": "2026-10-16T08:30:00.123456",
      "status": "pending",
      "property": {"address": "13910 Boulder Lane", "client": "Rodrigo"},
      "visit_data": {},
      "gps_points": [
        {"label": "NE corner", "type": "corner", "lat": 39.1, "lon": -104.9,
         "accuracy": 4.0, "timestamp": "2026-10-16T08:41:12.000001"}
      ],
      "photos": [
        {"id": "20261016_084500_123456", "filename": "20261016_084500_123456.jpg",
         "label": "Driveway", "timestamp": "2026-10-16T08:45:00.123456", "gps": {}}
      ],
      "notes": "",
      "updated": "2026-10-16T09:00:00"
    }"#;
    let project = serde_json::from_str::<ApiProject>(raw).unwrap().into_project();

    assert_eq!(project.id, "20261016_083000");
    assert_eq!(project.status, ProjectStatus::Draft);
    assert_eq!(project.created.to_rfc3339(), "2026-10-16T08:30:00.123456+00:00");
    assert_eq!(project.last_modified.to_rfc3339(), "2026-10-16T09:00:00+00:00");
    assert_eq!(project.gps_points.len(), 1);
    assert_eq!(project.gps_points[0].project_id, "20261016_083000");
    assert_eq!(project.gps_points[0].kind, "corner");
    assert!(!project.gps_points[0].id.is_empty());
    assert_eq!(project.photos[0].id, "20261016_084500_123456");
    assert_eq!(project.photos[0].gps, None);
    assert!(project.synced);
  }

  #[test]
  fn engine_written_project_decodes_unchanged() {
    let mut property = Property::default();
    property.address = "13910 Boulder Lane".into();
    let mut project = Project::new(property);
    project.synced = true;
    project.last_modified = project.created;

    let json = serde_json::to_string(&project).unwrap();
    let back = serde_json::from_str::<ApiProject>(&json).unwrap().into_project();
    assert_eq!(back, project);
  }

  #[test]
  fn create_response_carries_server_id() {
    let created: CreatedProject =
      serde_json::from_str(r#"{"success": true, "project_id": "20261016_083000"}"#).unwrap();
    assert_eq!(created.project_id.as_deref(), Some("20261016_083000"));
    let created: CreatedProject = serde_json::from_str("{}").unwrap();
    assert_eq!(created.project_id, None);
  }
}
