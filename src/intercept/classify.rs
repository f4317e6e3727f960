//! Resource classification by URL.

use crate::sync::{HttpRequest, Method};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceClass {
  /// GET to a known tile host
  MapTile,
  /// GET under the API prefix
  ApiRead,
  /// Create, update or delete under the API prefix
  ApiMutation,
  /// Any other GET: app shell, scripts, styles, page navigations
  Static,
  /// Non-GET outside the API; never touched
  Passthrough,
}

#[derive(Debug, Clone)]
pub struct Classifier {
  tile_hosts: Vec<String>,
  api_prefix: String,
}

impl Classifier {
  pub fn new(tile_hosts: Vec<String>, api_prefix: impl Into<String>) -> Self {
    Self {
      tile_hosts: tile_hosts.into_iter().map(|h| h.to_lowercase()).collect(),
      api_prefix: api_prefix.into(),
    }
  }

  pub fn classify(&self, request: &HttpRequest) -> ResourceClass {
    let is_get = request.method == Method::Get;
    let host = request.url.host_str().unwrap_or_default().to_lowercase();

    if self.is_tile_host(&host) {
      return if is_get {
        ResourceClass::MapTile
      } else {
        ResourceClass::Passthrough
      };
    }

    if request.url.path().starts_with(&self.api_prefix) {
      return if is_get {
        ResourceClass::ApiRead
      } else {
        ResourceClass::ApiMutation
      };
    }

    if is_get {
      ResourceClass::Static
    } else {
      ResourceClass::Passthrough
    }
  }

  /// Exact host or any subdomain of it (`a.tile.openstreetmap.org`).
  fn is_tile_host(&self, host: &str) -> bool {
    self
      .tile_hosts
      .iter()
      .any(|h| host == h || host.ends_with(&format!(".{}", h)))
  }
}
