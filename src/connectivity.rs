//! Online/offline tracking.
//!
//! Signal sources report the current state through [`ConnectivityMonitor::set`];
//! the monitor reacts only to transitions. Going online drains the sync queue,
//! going offline just refreshes the pending count.

use tokio::sync::watch;
use url::Url;

use crate::error::StorageError;
use crate::event::{EventBus, SyncEvent};
use crate::sync::{DrainOutcome, HttpRequest, Reconciler, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
  Online,
  Offline,
}

impl Connectivity {
  pub fn from_online(online: bool) -> Self {
    if online {
      Self::Online
    } else {
      Self::Offline
    }
  }
}

pub struct ConnectivityMonitor {
  state: watch::Sender<Connectivity>,
  reconciler: Reconciler,
  events: EventBus,
}

impl ConnectivityMonitor {
  pub fn new(initial: Connectivity, reconciler: Reconciler, events: EventBus) -> Self {
    let (state, _rx) = watch::channel(initial);
    Self {
      state,
      reconciler,
      events,
    }
  }

  pub fn current(&self) -> Connectivity {
    *self.state.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.current() == Connectivity::Online
  }

  /// Receiver that observes every state change.
  pub fn watch(&self) -> watch::Receiver<Connectivity> {
    self.state.subscribe()
  }

  /// Apply a connectivity signal.
  ///
  /// Returns the drain outcome when this call moved the state to online.
  pub async fn set(&self, state: Connectivity) -> Result<Option<DrainOutcome>, StorageError> {
    let mut previous = state;
    let changed = self.state.send_if_modified(|current| {
      previous = *current;
      if *current == state {
        return false;
      }
      *current = state;
      true
    });
    if !changed {
      return Ok(None);
    }

    tracing::info!(?previous, current = ?state, "connectivity changed");
    self.events.emit(SyncEvent::Connectivity(state));

    match state {
      Connectivity::Online => {
        let outcome = self.reconciler.drain().await?;
        if let DrainOutcome::Completed(report) = outcome {
          self.events.emit(SyncEvent::Drained {
            synced: report.synced,
            failed: report.failed,
            rejected: report.rejected,
          });
        }
        self.emit_pending()?;
        Ok(Some(outcome))
      }
      Connectivity::Offline => {
        self.emit_pending()?;
        Ok(None)
      }
    }
  }

  pub async fn set_online(&self, online: bool) -> Result<Option<DrainOutcome>, StorageError> {
    self.set(Connectivity::from_online(online)).await
  }

  fn emit_pending(&self) -> Result<(), StorageError> {
    let pending = self.reconciler.queue().len()?;
    self.events.emit(SyncEvent::PendingChanged(pending));
    Ok(())
  }

  /// Decide reachability with one request. Any HTTP answer counts as online.
  pub async fn probe(transport: &dyn Transport, url: &Url) -> Connectivity {
    match transport.send(HttpRequest::get(url.clone())).await {
      Ok(_) => Connectivity::Online,
      Err(e) => {
        tracing::debug!(url = %url, error = %e, "probe failed");
        Connectivity::Offline
      }
    }
  }
}
