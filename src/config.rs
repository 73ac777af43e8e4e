use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub executor: ExecutorConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Directory holding the durable stores (default: $XDG_CACHE_HOME/rescache)
  pub dir: Option<PathBuf>,
  /// Disable the durable tier entirely; caches then live in memory only
  pub durable: bool,
  /// Stamped on every durable entry; bump it when cached shapes change
  pub schema_version: u32,
  /// Byte budget of each object store
  pub object_budget_bytes: u64,
  /// Byte budget of each collection (`_fetchAll`) store
  pub collection_budget_bytes: u64,
  /// Entries kept in each in-memory tier
  pub fast_entries: u64,
  /// Query parameters left out of cache keys, on top of `pageSize` and `noCache`
  pub ignored_params: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      dir: None,
      durable: true,
      schema_version: 1,
      object_budget_bytes: 50_000_000,
      collection_budget_bytes: 10_000_000,
      fast_entries: 1_000,
      ignored_params: Vec::new(),
    }
  }
}

impl CacheConfig {
  /// The configured directory, or the platform cache directory.
  pub fn resolved_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.dir {
      return Ok(dir.clone());
    }

    let cache_dir = dirs::cache_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".cache")))
      .ok_or_else(|| eyre!("Could not determine cache directory"))?;

    Ok(cache_dir.join("rescache"))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
  /// Provider work running at the same time
  pub workers: usize,
  pub thread_name: String,
}

impl Default for ExecutorConfig {
  fn default() -> Self {
    Self {
      workers: 20,
      thread_name: "rescache-worker".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./rescache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/rescache/config.yaml
  ///
  /// Falls back to defaults when no file is found.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("rescache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("rescache").join("config.yaml");
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
    Ok(serde_yaml::from_str(contents)?)
  }
}
