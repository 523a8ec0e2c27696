use chrono::Duration;
use color_eyre::{eyre::eyre, Report, Result};
use serde::Deserialize;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::cache::{CacheOptions, PayloadShape, SEPARATOR};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  /// Resources that views read and patch
  #[serde(default)]
  pub resources: Vec<ResourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL that resource paths are appended to
  pub base_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
  /// Maximum number of cached responses (unbounded if not set)
  pub max_entries: Option<NonZeroUsize>,
  /// Seconds before a cached response is treated as missing (never if not set)
  pub ttl_secs: Option<u64>,
}

impl CacheConfig {
  pub fn options(&self) -> CacheOptions {
    CacheOptions {
      max_entries: self.max_entries,
      // Out-of-range values are as good as no expiry
      ttl: self
        .ttl_secs
        .and_then(|secs| i64::try_from(secs).ok())
        .and_then(Duration::try_seconds),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceConfig {
  pub name: String,
  /// Where records live inside responses for this resource
  #[serde(default)]
  pub shape: PayloadShape,
  /// Field that identifies a record
  #[serde(default = "default_id_field")]
  pub id_field: String,
}

fn default_id_field() -> String {
  "id".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./reqcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/reqcache/config.yaml
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
      None => Err(Self::missing_config()),
    }
  }

  fn missing_config() -> Report {
    eyre!(
      "No configuration file found. Create one at ~/.config/reqcache/config.yaml \
       or pass --config."
    )
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("reqcache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("reqcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  /// Parse configuration from YAML text.
  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.check_resource_names();
    Ok(config)
  }

  /// Look up the declared settings for a resource.
  pub fn resource(&self, name: &str) -> Option<&ResourceConfig> {
    self.resources.iter().find(|r| r.name == name)
  }

  /// Record field used to identify items of `resource`.
  pub fn id_field(&self, resource: &str) -> &str {
    self
      .resource(resource)
      .map(|r| r.id_field.as_str())
      .unwrap_or("id")
  }

  /// Names containing the key separator can shadow each other during
  /// invalidation ("product" would also match "product:draft").
  fn check_resource_names(&self) {
    for resource in &self.resources {
      if resource.name.contains(SEPARATOR) {
        warn!(
          resource = %resource.name,
          "Resource name contains '{}'; invalidating a shorter name may also drop it",
          SEPARATOR
        );
      }
    }
  }

  /// Get the API bearer token from the environment, if set.
  ///
  /// Checks REQCACHE_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("REQCACHE_API_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}
