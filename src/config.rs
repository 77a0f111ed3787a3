use color_eyre::{eyre::eyre, Result};
use hubsync::cache::{Collection, ExpiryPolicy, SqliteStorage};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub server: ServerConfig,
  pub github: GithubConfig,
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  /// Base URL the client sends replay requests to
  pub url: String,
  /// Address `serve` binds to
  pub listen: String,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      url: "http://127.0.0.1:8787".to_string(),
      listen: "127.0.0.1:8787".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GithubConfig {
  pub api_url: String,
}

impl Default for GithubConfig {
  fn default() -> Self {
    Self {
      api_url: "https://api.github.com".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Database file (defaults to the user data directory)
  pub path: Option<PathBuf>,
  pub sweep_interval_secs: u64,
  pub probe_interval_secs: u64,
  /// Replay through the background dispatcher instead of draining in place
  pub background_sync: bool,
  /// Maximum age in seconds per collection; `null` means never expires
  pub expiry: BTreeMap<Collection, Option<u64>>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      path: None,
      sweep_interval_secs: 60 * 60,
      probe_interval_secs: 30,
      background_sync: true,
      expiry: BTreeMap::new(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./hubsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/hubsync/config.yaml
  ///
  /// Without a file every setting takes its default.
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
    let local = PathBuf::from("hubsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("hubsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    // An empty file is valid and means defaults.
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }

  /// Default expiry with the configured overrides applied.
  pub fn expiry_policy(&self) -> ExpiryPolicy {
    self
      .cache
      .expiry
      .iter()
      .fold(ExpiryPolicy::default(), |policy, (collection, secs)| {
        let max_age = secs.map(|s| chrono::Duration::seconds(s as i64));
        policy.with(*collection, max_age)
      })
  }

  pub fn db_path(&self) -> Result<PathBuf> {
    self
      .cache
      .path
      .clone()
      .or_else(SqliteStorage::default_path)
      .ok_or_else(|| eyre!("Could not determine a data directory; set cache.path"))
  }

  pub fn server_url(&self) -> Result<Url> {
    Url::parse(&self.server.url).map_err(|e| eyre!("Invalid server.url {}: {}", self.server.url, e))
  }

  pub fn github_api_url(&self) -> Result<Url> {
    Url::parse(&self.github.api_url)
      .map_err(|e| eyre!("Invalid github.api_url {}: {}", self.github.api_url, e))
  }

  pub fn sweep_interval(&self) -> Option<Duration> {
    match self.cache.sweep_interval_secs {
      0 => None,
      secs => Some(Duration::from_secs(secs)),
    }
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.cache.probe_interval_secs.max(1))
  }

  /// Get the GitHub token from environment variables.
  ///
  /// Checks HUBSYNC_GITHUB_TOKEN first, then GITHUB_TOKEN as fallback.
  pub fn get_github_token() -> Result<String> {
    std::env::var("HUBSYNC_GITHUB_TOKEN")
      .or_else(|_| std::env::var("GITHUB_TOKEN"))
      .map_err(|_| {
        eyre!("GitHub token not found. Set HUBSYNC_GITHUB_TOKEN or GITHUB_TOKEN environment variable.")
      })
  }
}
