//! Error taxonomy for the sync engine.
//!
//! Storage failures and network failures are kept apart because they degrade
//! differently: a network failure leaves the optimistic write in place and the
//! mutation queued, a storage failure means the write itself did not land.

use rusqlite::ErrorCode;
use thiserror::Error;

/// Failures raised by the local store and the sync queue.
#[derive(Debug, Error)]
pub enum StorageError {
  /// The database ran out of space (disk full or the configured page quota).
  #[error("storage quota exceeded")]
  QuotaExceeded,

  #[error("database error: {0}")]
  Database(rusqlite::Error),

  #[error("failed to (de)serialize record: {0}")]
  Serde(#[from] serde_json::Error),

  #[error("invalid stored value: {0}")]
  Corrupt(String),

  #[error("lock poisoned")]
  LockPoisoned,
}

impl From<rusqlite::Error> for StorageError {
  fn from(error: rusqlite::Error) -> Self {
    match error.sqlite_error_code() {
      Some(ErrorCode::DiskFull) => Self::QuotaExceeded,
      _ => Self::Database(error),
    }
  }
}

/// Failures surfaced by foreground operations and the reconciler.
#[derive(Debug, Error)]
pub enum SyncError {
  /// Connection refused, DNS failure, reset: anything that may succeed later.
  #[error("network unavailable: {0}")]
  Network(String),

  #[error("request timed out")]
  Timeout,

  /// The server answered with a 4xx status.
  #[error("server rejected request with status {status}")]
  Rejected { status: u16 },

  /// The server answered with a 5xx status.
  #[error("server error {status}")]
  Server { status: u16 },

  #[error(transparent)]
  Storage(#[from] StorageError),

  /// The geolocation sensor refused access.
  #[error("permission denied: {0}")]
  PermissionDenied(String),

  #[error("not found: {0}")]
  NotFound(String),

  #[error("invalid input: {0}")]
  InvalidInput(String),

  /// The interception worker is gone (its channel closed).
  #[error("interceptor unavailable")]
  WorkerGone,
}

impl SyncError {
  /// Classify an HTTP status. Returns `None` for success statuses.
  pub fn from_status(status: u16) -> Option<Self> {
    match status {
      200..=399 => None,
      400..=499 => Some(Self::Rejected { status }),
      _ => Some(Self::Server { status }),
    }
  }

  /// Whether retrying the same request later might succeed.
  pub fn is_transient(&self) -> bool {
    matches!(
      self,
      Self::Network(_) | Self::Timeout | Self::Server { .. } | Self::Rejected { status: 408 | 429 }
    )
  }
}

impl From<reqwest::Error> for SyncError {
  fn from(error: reqwest::Error) -> Self {
    if error.is_timeout() {
      Self::Timeout
    } else {
      Self::Network(error.to_string())
    }
  }
}

impl From<serde_json::Error> for SyncError {
  fn from(error: serde_json::Error) -> Self {
    Self::Storage(StorageError::Serde(error))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn status_classification() {
    assert!(SyncError::from_status(200).is_none());
    assert!(SyncError::from_status(204).is_none());
    assert!(matches!(
      SyncError::from_status(404),
      Some(SyncError::Rejected { status: 404 })
    ));
    assert!(matches!(
      SyncError::from_status(502),
      Some(SyncError::Server { status: 502 })
    ));
  }

  #[test]
  fn transient_errors() {
    assert!(SyncError::Network("refused".into()).is_transient());
    assert!(SyncError::Timeout.is_transient());
    assert!(SyncError::Server { status: 503 }.is_transient());
    assert!(SyncError::Rejected { status: 429 }.is_transient());
    assert!(!SyncError::Rejected { status: 422 }.is_transient());
    assert!(!SyncError::Storage(StorageError::QuotaExceeded).is_transient());
  }
}
