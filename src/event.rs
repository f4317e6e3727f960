use tokio::sync::broadcast;

use crate::connectivity::Connectivity;

/// Notifications for whatever is presenting engine state to the user.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
  /// Connectivity transition observed
  Connectivity(Connectivity),
  /// A drain finished
  Drained {
    synced: usize,
    failed: usize,
    rejected: usize,
  },
  /// Number of queued mutations changed
  PendingChanged(usize),
  /// Transient, non-blocking message
  Notice(String),
  /// A local write did not land; data only exists in memory until flushed
  StorageQuota(String),
  /// Sensor access was refused; shown once as a blocking prompt
  PermissionRequired(String),
}

/// Fan-out of engine events to any number of observers.
#[derive(Clone)]
pub struct EventBus {
  tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity);
    Self { tx }
  }

  /// Send an event. Having no observers is fine.
  pub fn emit(&self, event: SyncEvent) {
    tracing::trace!(?event, "event");
    let _ = self.tx.send(event);
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.tx.subscribe()
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new(64)
  }
}
