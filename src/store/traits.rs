//! Core traits and types for the local store.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Named collections held by the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
  Projects,
  GpsPoints,
  Photos,
  Boundaries,
}

impl Collection {
  pub const ALL: [Collection; 4] = [
    Collection::Projects,
    Collection::GpsPoints,
    Collection::Photos,
    Collection::Boundaries,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Projects => "projects",
      Self::GpsPoints => "gps_points",
      Self::Photos => "photos",
      Self::Boundaries => "boundaries",
    }
  }
}

impl std::str::FromStr for Collection {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::ALL
      .into_iter()
      .find(|c| c.as_str() == s)
      .ok_or_else(|| format!("unknown collection '{}'", s))
  }
}

impl std::fmt::Display for Collection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Secondary index lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Index<'a> {
  /// Records belonging to a parent (e.g. points of a project)
  Parent(&'a str),
  /// Records by sync status
  Synced(bool),
}

/// Trait for entities kept in the local store.
///
/// The store owns the sync flag and the modification time: it writes them on
/// every `put` and applies the stored values on every read.
pub trait Record: Clone + Send + Sync + Serialize + DeserializeOwned {
  /// Collection this record type lives in
  fn collection() -> Collection;

  /// Primary key within the collection
  fn key(&self) -> String;

  /// Parent id for the parent index, if the record has one
  fn parent_id(&self) -> Option<&str>;

  /// Apply the sync state recorded by the store.
  fn set_sync_state(&mut self, synced: bool, last_modified: DateTime<Utc>);
}
