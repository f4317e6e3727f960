//! Geolocation capability.
//!
//! Sensor acquisition lives outside the engine; the session only sees a
//! provider that yields immutable readings.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// One coordinate reading from the sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
  pub lat: f64,
  pub lon: f64,
  /// Meters above the ellipsoid, when the sensor reports it
  #[serde(default)]
  pub altitude: Option<f64>,
  #[serde(default)]
  pub altitude_accuracy: Option<f64>,
  /// Horizontal accuracy radius in meters
  pub accuracy: f64,
  pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait GeolocationProvider: Send + Sync {
  /// Latest reading, or `PermissionDenied` when the sensor is not accessible.
  async fn current_reading(&self) -> Result<Reading, SyncError>;
}

/// Provider used when no sensor is available.
pub struct NullGeolocation;

#[async_trait]
impl GeolocationProvider for NullGeolocation {
  async fn current_reading(&self) -> Result<Reading, SyncError> {
    Err(SyncError::PermissionDenied(
      "no geolocation provider available".to_string(),
    ))
  }
}

/// Provider returning a fixed position, stamped with the time of each read.
///
/// Used by the CLI where coordinates come from arguments.
pub struct FixedGeolocation {
  lat: f64,
  lon: f64,
  altitude: Option<f64>,
  accuracy: f64,
}

impl FixedGeolocation {
  pub fn new(lat: f64, lon: f64, accuracy: f64) -> Self {
    Self {
      lat,
      lon,
      altitude: None,
      accuracy,
    }
  }

  pub fn with_altitude(mut self, altitude: Option<f64>) -> Self {
    self.altitude = altitude;
    self
  }
}

#[async_trait]
impl GeolocationProvider for FixedGeolocation {
  async fn current_reading(&self) -> Result<Reading, SyncError> {
    if !(-90.0..=90.0).contains(&self.lat) || !(-180.0..=180.0).contains(&self.lon) {
      return Err(SyncError::InvalidInput(format!(
        "coordinates out of range: {}, {}",
        self.lat, self.lon
      )));
    }

    Ok(Reading {
      lat: self.lat,
      lon: self.lon,
      altitude: self.altitude,
      altitude_accuracy: self.altitude.map(|_| self.accuracy),
      accuracy: self.accuracy,
      timestamp: Utc::now(),
    })
  }
}
