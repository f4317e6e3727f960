//! Background interception task and the handle the foreground talks to.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::policy::{CachePolicy, Served};
use crate::error::SyncError;
use crate::sync::HttpRequest;
use crate::tiles::{BoundingBox, PrefetchProgress, TilePrefetch, TilePrefetcher};

/// Commands accepted by the worker.
pub enum WorkerCommand {
  Fetch {
    request: HttpRequest,
    response_channel: oneshot::Sender<Result<Served, SyncError>>,
  },
  /// Precache the static asset list under a new version tag
  Install {
    version: String,
    response_channel: oneshot::Sender<usize>,
  },
  /// Switch to the installed version and drop every other generation
  Activate {
    response_channel: oneshot::Sender<Result<usize, SyncError>>,
  },
  Prefetch {
    area: BoundingBox,
    max_zoom: u8,
    progress: mpsc::UnboundedSender<PrefetchProgress>,
  },
}

pub struct InterceptorWorker {
  active: CachePolicy,
  installing: Option<CachePolicy>,
  prefetcher: TilePrefetcher,
  precache: Vec<String>,
  command_receiver: mpsc::UnboundedReceiver<WorkerCommand>,
}

impl InterceptorWorker {
  /// Start the worker on the current runtime.
  pub fn spawn(
    policy: CachePolicy,
    prefetcher: TilePrefetcher,
    precache: Vec<String>,
  ) -> InterceptorHandle {
    let (command_sender, command_receiver) = mpsc::unbounded_channel();
    let worker = Self {
      active: policy,
      installing: None,
      prefetcher,
      precache,
      command_receiver,
    };
    tokio::spawn(worker.run());
    InterceptorHandle { command_sender }
  }

  async fn run(mut self) {
    tracing::debug!(version = %self.active.version(), "interceptor worker started");

    while let Some(command) = self.command_receiver.recv().await {
      match command {
        WorkerCommand::Fetch {
          request,
          response_channel,
        } => {
          // Each fetch runs on its own task so a slow request never stalls the loop.
          let policy = self.active.clone();
          tokio::spawn(async move {
            let _ = response_channel.send(policy.handle(request).await);
          });
        }
        WorkerCommand::Install {
          version,
          response_channel,
        } => {
          let policy = self.active.clone().with_version(version);
          let cached = policy.precache(&self.precache).await;
          tracing::info!(version = %policy.version(), cached, "installed cache generation");
          self.installing = Some(policy);
          let _ = response_channel.send(cached);
        }
        WorkerCommand::Activate { response_channel } => {
          if let Some(policy) = self.installing.take() {
            self.active = policy;
          }
          let result = self.active.purge_stale();
          tracing::info!(version = %self.active.version(), "activated cache generation");
          let _ = response_channel.send(result);
        }
        WorkerCommand::Prefetch {
          area,
          max_zoom,
          progress,
        } => {
          let prefetcher = self.prefetcher.clone();
          let version = self.active.version().to_string();
          tokio::spawn(async move {
            prefetcher.run(&version, area, max_zoom, progress).await;
          });
        }
      }
    }

    tracing::debug!("interceptor worker stopped");
  }
}

/// Cloneable sender side of the worker.
#[derive(Clone)]
pub struct InterceptorHandle {
  command_sender: mpsc::UnboundedSender<WorkerCommand>,
}

impl InterceptorHandle {
  fn send(&self, command: WorkerCommand) -> Result<(), SyncError> {
    self
      .command_sender
      .send(command)
      .map_err(|_| SyncError::WorkerGone)
  }

  /// Route one request through the caching policy.
  pub async fn fetch(&self, request: HttpRequest) -> Result<Served, SyncError> {
    let (response_tx, response_rx) = oneshot::channel();
    self.send(WorkerCommand::Fetch {
      request,
      response_channel: response_tx,
    })?;
    response_rx.await.map_err(|_| SyncError::WorkerGone)?
  }

  /// Returns the number of static assets precached.
  pub async fn install(&self, version: impl Into<String>) -> Result<usize, SyncError> {
    let (response_tx, response_rx) = oneshot::channel();
    self.send(WorkerCommand::Install {
      version: version.into(),
      response_channel: response_tx,
    })?;
    response_rx.await.map_err(|_| SyncError::WorkerGone)
  }

  /// Returns the number of stale cache entries purged.
  pub async fn activate(&self) -> Result<usize, SyncError> {
    let (response_tx, response_rx) = oneshot::channel();
    self.send(WorkerCommand::Activate {
      response_channel: response_tx,
    })?;
    response_rx.await.map_err(|_| SyncError::WorkerGone)?
  }
}

#[async_trait]
impl TilePrefetch for InterceptorHandle {
  async fn prefetch(
    &self,
    area: BoundingBox,
    max_zoom: u8,
  ) -> Result<mpsc::UnboundedReceiver<PrefetchProgress>, SyncError> {
    let (progress, rx) = mpsc::unbounded_channel();
    self.send(WorkerCommand::Prefetch {
      area,
      max_zoom,
      progress,
    })?;
    Ok(rx)
  }
}
