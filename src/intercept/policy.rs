//! Per-class caching strategies.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use url::Url;

use super::cache::{CacheBucket, ResponseCache};
use super::classify::{Classifier, ResourceClass};
use crate::error::SyncError;
use crate::sync::{HttpRequest, HttpResponse, Transport};

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh from the network
  Network,
  /// From cache
  Cache,
  /// Offline tile stand-in
  Placeholder,
  /// Offline API read with nothing cached
  OfflineMarker,
  /// Cached fallback page for an offline navigation
  Fallback,
  /// Offline with nothing to serve
  Unavailable,
}

/// A response plus metadata about its source.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: HttpResponse,
  pub source: ResponseSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Served {
  pub fn from_network(response: HttpResponse) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
      cached_at: None,
    }
  }

  fn cached(response: HttpResponse, source: ResponseSource, cached_at: DateTime<Utc>) -> Self {
    Self {
      response,
      source,
      cached_at: Some(cached_at),
    }
  }

  fn synthetic(response: HttpResponse, source: ResponseSource) -> Self {
    Self {
      response,
      source,
      cached_at: None,
    }
  }
}

/// Applies the caching strategy of each resource class.
#[derive(Clone)]
pub struct CachePolicy {
  transport: Arc<dyn Transport>,
  cache: ResponseCache,
  classifier: Classifier,
  version: String,
  base_url: Url,
  offline_page: String,
}

impl CachePolicy {
  pub fn new(
    transport: Arc<dyn Transport>,
    cache: ResponseCache,
    classifier: Classifier,
    version: impl Into<String>,
    base_url: Url,
    offline_page: impl Into<String>,
  ) -> Self {
    Self {
      transport,
      cache,
      classifier,
      version: version.into(),
      base_url,
      offline_page: offline_page.into(),
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn with_version(mut self, version: impl Into<String>) -> Self {
    self.version = version.into();
    self
  }

  pub fn cache(&self) -> &ResponseCache {
    &self.cache
  }

  pub fn transport(&self) -> Arc<dyn Transport> {
    Arc::clone(&self.transport)
  }

  fn generation(&self, bucket: CacheBucket) -> String {
    bucket.generation(&self.version)
  }

  /// Serve one request.
  ///
  /// Only API mutations and passthrough requests can fail; every read
  /// degrades to a cached or synthetic response.
  pub async fn handle(&self, request: HttpRequest) -> Result<Served, SyncError> {
    let class = self.classifier.classify(&request);
    tracing::trace!(url = %request.url, ?class, "intercepted request");

    match class {
      ResourceClass::MapTile => Ok(self.cache_first_tile(request).await),
      ResourceClass::ApiMutation | ResourceClass::Passthrough => self.pass_through(request).await,
      ResourceClass::ApiRead => Ok(self.network_first(request).await),
      ResourceClass::Static => Ok(self.cache_first_refresh(request).await),
    }
  }

  /// Tiles: cache, then network; an empty placeholder when both miss.
  async fn cache_first_tile(&self, request: HttpRequest) -> Served {
    let generation = self.generation(CacheBucket::Tiles);
    let key = request.url.to_string();

    if let Some(hit) = self.lookup(&generation, &key) {
      return Served::cached(hit.response, ResponseSource::Cache, hit.cached_at);
    }

    match self.transport.send(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store(&generation, &key, &response);
        }
        Served::from_network(response)
      }
      Err(e) => {
        tracing::debug!(url = %key, error = %e, "tile unavailable, serving placeholder");
        Served::synthetic(HttpResponse::new(200, None, Vec::new()), ResponseSource::Placeholder)
      }
    }
  }

  /// Mutations are never cached; failures go back to the caller.
  async fn pass_through(&self, request: HttpRequest) -> Result<Served, SyncError> {
    let response = self.transport.send(request).await?;
    Ok(Served::from_network(response))
  }

  /// API reads: network, refreshing the cache; last cached copy when offline.
  async fn network_first(&self, request: HttpRequest) -> Served {
    let generation = self.generation(CacheBucket::Api);
    let key = request.url.to_string();

    match self.transport.send(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store(&generation, &key, &response);
        }
        Served::from_network(response)
      }
      Err(e) => {
        if let Some(hit) = self.lookup(&generation, &key) {
          tracing::debug!(url = %key, error = %e, "network failed, serving cached api response");
          return Served::cached(hit.response, ResponseSource::Cache, hit.cached_at);
        }

        let body = json!({
          "offline": true,
          "error": e.to_string(),
          "url": key,
        });
        Served::synthetic(
          HttpResponse::new(503, Some("application/json"), body.to_string().into_bytes()),
          ResponseSource::OfflineMarker,
        )
      }
    }
  }

  /// Static assets: cache first while refreshing in the background.
  async fn cache_first_refresh(&self, request: HttpRequest) -> Served {
    let generation = self.generation(CacheBucket::Static);
    let key = request.url.to_string();

    if let Some(hit) = self.lookup(&generation, &key) {
      self.spawn_refresh(generation, key, request);
      return Served::cached(hit.response, ResponseSource::Cache, hit.cached_at);
    }

    let navigation = request.navigation;
    match self.transport.send(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store(&generation, &key, &response);
        }
        Served::from_network(response)
      }
      Err(e) => {
        tracing::debug!(url = %key, error = %e, "static asset unavailable");
        if navigation {
          if let Some(fallback) = self.fallback_page(&generation) {
            return fallback;
          }
        }
        Served::synthetic(
          HttpResponse::new(503, Some("text/plain"), b"Service Unavailable".to_vec()),
          ResponseSource::Unavailable,
        )
      }
    }
  }

  fn fallback_page(&self, generation: &str) -> Option<Served> {
    let url = self.base_url.join(&self.offline_page).ok()?;
    self
      .lookup(generation, url.as_str())
      .map(|hit| Served::cached(hit.response, ResponseSource::Fallback, hit.cached_at))
  }

  fn spawn_refresh(&self, generation: String, key: String, request: HttpRequest) {
    let transport = Arc::clone(&self.transport);
    let cache = self.cache.clone();
    tokio::spawn(async move {
      match transport.send(request).await {
        Ok(response) if response.is_success() => {
          if let Err(e) = cache.put(&generation, &key, &response) {
            tracing::warn!(url = %key, error = %e, "failed to refresh cached asset");
          }
        }
        Ok(response) => {
          tracing::debug!(url = %key, status = response.status, "refresh returned error status")
        }
        Err(e) => tracing::debug!(url = %key, error = %e, "background refresh failed"),
      }
    });
  }

  /// Fetch the configured static assets into the current generation.
  pub async fn precache(&self, paths: &[String]) -> usize {
    let generation = self.generation(CacheBucket::Static);
    let mut cached = 0;

    for path in paths {
      let url = match self.base_url.join(path) {
        Ok(url) => url,
        Err(e) => {
          tracing::warn!(path = %path, error = %e, "skipping invalid precache path");
          continue;
        }
      };

      match self.transport.send(HttpRequest::get(url.clone())).await {
        Ok(response) if response.is_success() => {
          self.store(&generation, url.as_str(), &response);
          cached += 1;
        }
        Ok(response) => {
          tracing::warn!(url = %url, status = response.status, "precache fetch returned error status")
        }
        Err(e) => tracing::warn!(url = %url, error = %e, "precache fetch failed"),
      }
    }

    cached
  }

  /// Drop every cache generation that does not belong to the current version.
  pub fn purge_stale(&self) -> Result<usize, SyncError> {
    let keep: Vec<String> = CacheBucket::ALL
      .iter()
      .map(|b| b.generation(&self.version))
      .collect();
    Ok(self.cache.purge_except(&keep)?)
  }

  fn lookup(&self, generation: &str, key: &str) -> Option<super::cache::CachedResponse> {
    match self.cache.get(generation, key) {
      Ok(hit) => hit,
      Err(e) => {
        tracing::warn!(url = %key, error = %e, "cache lookup failed");
        None
      }
    }
  }

  fn store(&self, generation: &str, key: &str, response: &HttpResponse) {
    if let Err(e) = self.cache.put(generation, key, response) {
      tracing::warn!(url = %key, error = %e, "failed to cache response");
    }
  }
}
