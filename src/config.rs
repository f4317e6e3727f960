use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::tiles::MAX_ZOOM;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub server: ServerConfig,
  pub storage: StorageConfig,
  pub tiles: TilesConfig,
  pub cache: CacheConfig,
  pub connectivity: ConnectivityConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  /// Base URL of the field API server
  pub url: String,
  /// Path prefix identifying API requests
  pub api_prefix: String,
  /// Transport timeout applied to every request
  pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      url: "http://localhost:5050".to_string(),
      api_prefix: "/api/".to_string(),
      request_timeout_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Directory holding the databases and logs (defaults to $XDG_DATA_HOME/fieldsync)
  pub data_dir: Option<PathBuf>,
  /// Upper bound on local store size, in SQLite pages
  pub max_pages: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TilesConfig {
  /// Tile URL with `{z}`, `{x}` and `{y}` placeholders
  pub url_template: String,
  /// Hosts whose requests are treated as map tiles
  pub hosts: Vec<String>,
  /// First zoom level fetched by the prefetcher
  pub min_zoom: u8,
  /// Highest zoom level the tile server provides
  pub max_zoom: u8,
  /// Number of tile downloads in flight during a prefetch
  pub concurrency: usize,
}

impl Default for TilesConfig {
  fn default() -> Self {
    Self {
      url_template: "https://tile.openstreetmap.org/{z}/{x}/{y}.png".to_string(),
      hosts: vec![
        "tile.openstreetmap.org".to_string(),
        "server.arcgisonline.com".to_string(),
      ],
      min_zoom: 10,
      max_zoom: 19,
      concurrency: 4,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Deployment version tag naming the current cache generation
  pub version: String,
  /// Static asset paths cached at install time
  pub precache: Vec<String>,
  /// Page served for navigations when both network and cache miss
  pub offline_page: String,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: format!("v{}", env!("CARGO_PKG_VERSION")),
      precache: vec!["/".to_string(), "/static/app.js".to_string()],
      offline_page: "/".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  /// Seconds between reachability probes in `watch` mode
  pub probe_interval_secs: u64,
  /// Path requested to decide whether the server is reachable
  pub probe_path: String,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_interval_secs: 15,
      probe_path: "/api/projects".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./fieldsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fieldsync/config.yaml
  ///
  /// Without any file the defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => {
        tracing::warn!("no configuration file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("fieldsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fieldsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    // An empty document deserializes as unit, not as an empty mapping.
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    let config: Self = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    let tiles = &self.tiles;
    if tiles.max_zoom > MAX_ZOOM {
      return Err(eyre!(
        "tiles.max_zoom {} is above the supported maximum {}",
        tiles.max_zoom,
        MAX_ZOOM
      ));
    }
    if tiles.min_zoom > tiles.max_zoom {
      return Err(eyre!(
        "tiles.min_zoom {} is above tiles.max_zoom {}",
        tiles.min_zoom,
        tiles.max_zoom
      ));
    }
    Ok(())
  }

  /// Parsed server base URL.
  pub fn base_url(&self) -> Result<Url> {
    Url::parse(&self.server.url)
      .map_err(|e| eyre!("Invalid server url '{}': {}", self.server.url, e))
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.server.request_timeout_secs)
  }

  /// Directory holding databases and logs.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.storage.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("fieldsync"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn empty_file_uses_defaults() {
    let config = Config::from_yaml("").unwrap();
    assert_eq!(config.server.url, "http://localhost:5050");
    assert_eq!(config.tiles.min_zoom, 10);
    assert!(config.cache.version.starts_with('v'));
  }

  #[test]
  fn partial_sections_keep_other_defaults() {
    let config = Config::from_yaml(
      r#"
server:
  url: https://field.example.com
tiles:
  min_zoom: 12
cache:
  version: v7
"#,
    )
    .unwrap();

    assert_eq!(config.server.url, "https://field.example.com");
    assert_eq!(config.server.api_prefix, "/api/");
    assert_eq!(config.tiles.min_zoom, 12);
    assert_eq!(config.tiles.max_zoom, 19);
    assert_eq!(config.cache.version, "v7");
    assert_eq!(config.connectivity.probe_interval_secs, 15);
  }

  #[test]
  fn out_of_range_zooms_are_rejected() {
    assert!(Config::from_yaml("tiles:\n  max_zoom: 32\n").is_err());
    assert!(Config::from_yaml("tiles:\n  min_zoom: 18\n  max_zoom: 12\n").is_err());
    let config = Config::from_yaml("tiles:\n  max_zoom: 24\n").unwrap();
    assert_eq!(config.tiles.max_zoom, 24);
  }

  #[test]
  fn explicit_missing_path_is_an_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/fieldsync.yaml"))).is_err());
  }

  #[test]
  fn explicit_data_dir_wins() {
    let config = Config::from_yaml("storage:\n  data_dir: /tmp/fs-data\n").unwrap();
    assert_eq!(config.data_dir().unwrap(), PathBuf::from("/tmp/fs-data"));
  }
}
