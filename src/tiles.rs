//! Slippy-map tile math and the tile prefetcher.

use async_trait::async_trait;
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::Arc;
use tokio::sync::mpsc;
use url::Url;

use crate::error::SyncError;
use crate::intercept::{tile_generation, ResponseCache};
use crate::sync::{HttpRequest, Transport};

/// Web Mercator stops being defined at the poles; clamp to its square.
const MAX_LATITUDE: f64 = 85.051_128_78;

/// Deepest zoom level the tile math accepts. Higher levels are clamped.
pub const MAX_ZOOM: u8 = 24;

/// Geographic bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
  pub north: f64,
  pub south: f64,
  pub east: f64,
  pub west: f64,
}

impl BoundingBox {
  pub fn new(north: f64, south: f64, east: f64, west: f64) -> Result<Self, SyncError> {
    if north < south {
      return Err(SyncError::InvalidInput(format!(
        "north ({}) must not be below south ({})",
        north, south
      )));
    }
    if east < west {
      return Err(SyncError::InvalidInput(format!(
        "east ({}) must not be west of west ({})",
        east, west
      )));
    }
    Ok(Self {
      north,
      south,
      east,
      west,
    })
  }
}

/// Address of one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileId {
  pub z: u8,
  pub x: u32,
  pub y: u32,
}

impl TileId {
  pub fn url(&self, template: &str) -> String {
    template
      .replace("{z}", &self.z.to_string())
      .replace("{x}", &self.x.to_string())
      .replace("{y}", &self.y.to_string())
  }
}

fn tiles_per_side(zoom: u8) -> u32 {
  1u32 << zoom.min(MAX_ZOOM)
}

fn last_index(zoom: u8) -> u32 {
  tiles_per_side(zoom) - 1
}

/// Column containing `lon` at `zoom`.
pub fn lon_to_tile_x(lon: f64, zoom: u8) -> u32 {
  let n = f64::from(tiles_per_side(zoom));
  let x = ((lon + 180.0) / 360.0 * n).floor();
  (x.max(0.0) as u32).min(last_index(zoom))
}

/// Row containing `lat` at `zoom`; row 0 is the northern edge.
pub fn lat_to_tile_y(lat: f64, zoom: u8) -> u32 {
  let n = f64::from(tiles_per_side(zoom));
  let phi = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians();
  let y = ((1.0 - (phi.tan() + 1.0 / phi.cos()).ln() / PI) / 2.0 * n).floor();
  (y.max(0.0) as u32).min(last_index(zoom))
}

/// Every tile whose footprint intersects `area`, zoom by zoom, row-major.
/// Zooms above [`MAX_ZOOM`] are skipped.
pub fn tiles_for(area: &BoundingBox, min_zoom: u8, max_zoom: u8) -> Vec<TileId> {
  let mut tiles = Vec::new();
  for z in min_zoom..=max_zoom.min(MAX_ZOOM) {
    let x_min = lon_to_tile_x(area.west, z);
    let x_max = lon_to_tile_x(area.east, z);
    let y_min = lat_to_tile_y(area.north, z);
    let y_max = lat_to_tile_y(area.south, z);
    for y in y_min..=y_max {
      for x in x_min..=x_max {
        tiles.push(TileId { z, x, y });
      }
    }
  }
  tiles
}

/// Progress of a prefetch, sent as tiles complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchProgress {
  pub cached: usize,
  pub total: usize,
  pub done: bool,
}

/// Capability the foreground uses to request a prefetch.
#[async_trait]
pub trait TilePrefetch: Send + Sync {
  async fn prefetch(
    &self,
    area: BoundingBox,
    max_zoom: u8,
  ) -> Result<mpsc::UnboundedReceiver<PrefetchProgress>, SyncError>;
}

/// Prefetch capability for builds without map support.
pub struct NullTilePrefetcher;

#[async_trait]
impl TilePrefetch for NullTilePrefetcher {
  async fn prefetch(
    &self,
    _area: BoundingBox,
    _max_zoom: u8,
  ) -> Result<mpsc::UnboundedReceiver<PrefetchProgress>, SyncError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let _ = tx.send(PrefetchProgress {
      cached: 0,
      total: 0,
      done: true,
    });
    Ok(rx)
  }
}

/// Downloads tiles into the tile cache generation.
#[derive(Clone)]
pub struct TilePrefetcher {
  transport: Arc<dyn Transport>,
  cache: ResponseCache,
  url_template: String,
  min_zoom: u8,
  zoom_cap: u8,
  concurrency: usize,
}

impl TilePrefetcher {
  pub fn new(
    transport: Arc<dyn Transport>,
    cache: ResponseCache,
    url_template: impl Into<String>,
    min_zoom: u8,
    zoom_cap: u8,
  ) -> Self {
    Self {
      transport,
      cache,
      url_template: url_template.into(),
      min_zoom,
      zoom_cap: zoom_cap.min(MAX_ZOOM),
      concurrency: 4,
    }
  }

  pub fn with_concurrency(mut self, concurrency: usize) -> Self {
    self.concurrency = concurrency.max(1);
    self
  }

  /// Fetch and store every tile of `area` from the minimum zoom to
  /// `max_zoom`. Failed tiles are logged and skipped.
  ///
  /// Returns the final `(cached, total)` counts; intermediate progress goes
  /// to `progress`.
  pub async fn run(
    &self,
    version: &str,
    area: BoundingBox,
    max_zoom: u8,
    progress: mpsc::UnboundedSender<PrefetchProgress>,
  ) -> PrefetchProgress {
    let max_zoom = max_zoom.min(self.zoom_cap);
    let tiles = if max_zoom < self.min_zoom {
      Vec::new()
    } else {
      tiles_for(&area, self.min_zoom, max_zoom)
    };
    let total = tiles.len();
    let generation = tile_generation(version);

    tracing::info!(total, min_zoom = self.min_zoom, max_zoom, "prefetching tiles");

    let mut cached = 0;
    let mut results = stream::iter(tiles)
      .map(|tile| self.fetch_tile(&generation, tile))
      .buffer_unordered(self.concurrency);

    while let Some(ok) = results.next().await {
      if ok {
        cached += 1;
      }
      let _ = progress.send(PrefetchProgress {
        cached,
        total,
        done: false,
      });
    }

    let summary = PrefetchProgress {
      cached,
      total,
      done: true,
    };
    let _ = progress.send(summary);
    tracing::info!(cached, total, "tile prefetch finished");
    summary
  }

  async fn fetch_tile(&self, generation: &str, tile: TileId) -> bool {
    let url = match Url::parse(&tile.url(&self.url_template)) {
      Ok(url) => url,
      Err(e) => {
        tracing::warn!(?tile, error = %e, "bad tile url");
        return false;
      }
    };

    match self.cache.contains(generation, url.as_str()) {
      Ok(true) => return true,
      Ok(false) => {}
      Err(e) => tracing::warn!(error = %e, "tile cache lookup failed"),
    }

    match self.transport.send(HttpRequest::get(url.clone())).await {
      Ok(response) if response.is_success() => {
        match self.cache.put(generation, url.as_str(), &response) {
          Ok(()) => true,
          Err(e) => {
            tracing::warn!(url = %url, error = %e, "failed to store tile");
            false
          }
        }
      }
      Ok(response) => {
        tracing::warn!(url = %url, status = response.status, "tile fetch returned error status");
        false
      }
      Err(e) => {
        tracing::warn!(url = %url, error = %e, "tile fetch failed");
        false
      }
    }
  }
}
