//! Site-visit domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::geo::Reading;

/// Checklist sections every new project starts with.
pub const VISIT_SECTIONS: &[&str] = &[
  "arrival",
  "access",
  "build_site",
  "septic",
  "soils",
  "well",
  "utilities",
  "vegetation",
  "assessment",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
  #[default]
  #[serde(alias = "pending")]
  Draft,
  InProgress,
  Complete,
}

impl std::str::FromStr for ProjectStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().replace('-', "_").as_str() {
      "draft" | "pending" => Ok(Self::Draft),
      "in_progress" => Ok(Self::InProgress),
      "complete" => Ok(Self::Complete),
      other => Err(format!("unknown project status '{}'", other)),
    }
  }
}

/// Property under survey.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Property {
  #[serde(default)]
  pub address: String,
  #[serde(default)]
  pub parcel_id: String,
  #[serde(default)]
  pub client: String,
  #[serde(default)]
  pub acres: Option<f64>,
  #[serde(default)]
  pub center_lat: Option<f64>,
  #[serde(default)]
  pub center_lon: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub legal: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub owner: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub client_phone: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub client_email: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub elevation_range: Option<String>,
}

/// A site-visit project. The local copy is mutable; the server copy wins once
/// acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
  pub id: String,
  pub created: DateTime<Utc>,
  #[serde(default)]
  pub status: ProjectStatus,
  #[serde(default)]
  pub property: Property,
  /// Checklist state keyed by section name
  #[serde(default)]
  pub visit_data: BTreeMap<String, Value>,
  /// Append-only
  #[serde(default)]
  pub gps_points: Vec<GpsPoint>,
  /// Append-only
  #[serde(default)]
  pub photos: Vec<PhotoRef>,
  #[serde(default)]
  pub notes: String,
  #[serde(default)]
  pub synced: bool,
  pub last_modified: DateTime<Utc>,
}

impl Project {
  pub fn new(property: Property) -> Self {
    let now = Utc::now();
    Self {
      id: Uuid::new_v4().simple().to_string(),
      created: now,
      status: ProjectStatus::Draft,
      property,
      visit_data: VISIT_SECTIONS
        .iter()
        .map(|s| (s.to_string(), Value::Object(Default::default())))
        .collect(),
      gps_points: Vec::new(),
      photos: Vec::new(),
      notes: String::new(),
      synced: false,
      last_modified: now,
    }
  }
}

/// A captured GPS point. Never updated after capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
  pub id: String,
  pub project_id: String,
  pub label: String,
  /// Free-form tag such as "corner", "well" or "septic"
  #[serde(rename = "type")]
  pub kind: String,
  pub lat: f64,
  pub lon: f64,
  #[serde(default)]
  pub altitude: Option<f64>,
  #[serde(default)]
  pub altitude_accuracy: Option<f64>,
  pub accuracy: f64,
  pub timestamp: DateTime<Utc>,
  #[serde(default)]
  pub synced: bool,
}

impl GpsPoint {
  pub fn from_reading(project_id: &str, label: &str, kind: &str, reading: &Reading) -> Self {
    Self {
      id: Uuid::new_v4().simple().to_string(),
      project_id: project_id.to_string(),
      label: label.to_string(),
      kind: kind.to_string(),
      lat: reading.lat,
      lon: reading.lon,
      altitude: reading.altitude,
      altitude_accuracy: reading.altitude_accuracy,
      accuracy: reading.accuracy,
      timestamp: reading.timestamp,
      synced: false,
    }
  }
}

/// A compressed photo. Never updated after capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Photo {
  pub id: String,
  pub project_id: String,
  #[serde(with = "base64_bytes")]
  pub data: Vec<u8>,
  pub label: String,
  pub timestamp: DateTime<Utc>,
  #[serde(default)]
  pub gps: Option<Reading>,
  #[serde(default)]
  pub synced: bool,
}

impl Photo {
  pub fn reference(&self) -> PhotoRef {
    PhotoRef {
      id: self.id.clone(),
      label: self.label.clone(),
      timestamp: self.timestamp,
      gps: self.gps.clone(),
    }
  }
}

/// What a project keeps about each of its photos.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoRef {
  pub id: String,
  pub label: String,
  pub timestamp: DateTime<Utc>,
  #[serde(default)]
  pub gps: Option<Reading>,
}

/// Cached parcel geometry, refreshable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundaryEntry {
  pub parcel_id: String,
  /// GeoJSON geometry
  pub geometry: Value,
  pub cached_at: DateTime<Utc>,
  #[serde(default)]
  pub synced: bool,
}

pub(crate) mod base64_bytes {
  use base64::{engine::general_purpose::STANDARD, Engine};
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD
      .decode(encoded.as_bytes())
      .map_err(serde::de::Error::custom)
  }
}
