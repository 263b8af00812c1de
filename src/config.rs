use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub log: LogConfig,
  /// Page size used by `list` when none is given
  pub default_page_size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Backend base URL (e.g., "https://codes.example.com")
  #[serde(default = "default_api_url")]
  pub url: String,
  /// Request timeout in seconds
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      url: default_api_url(),
      timeout_secs: default_timeout_secs(),
    }
  }
}

impl ApiConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Seconds before a cached query is refetched even without invalidation
  #[serde(default = "default_stale_secs")]
  pub stale_secs: u64,
  /// Quiet period before an autocomplete request fires
  #[serde(default = "default_autocomplete_delay_ms")]
  pub autocomplete_delay_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_secs: default_stale_secs(),
      autocomplete_delay_ms: default_autocomplete_delay_ms(),
    }
  }
}

impl CacheConfig {
  pub fn stale_time(&self) -> chrono::Duration {
    let secs = i64::try_from(self.stale_secs)
      .unwrap_or(i64::MAX)
      .min(i64::MAX / 1000);
    chrono::Duration::seconds(secs)
  }

  pub fn autocomplete_delay(&self) -> Duration {
    Duration::from_millis(self.autocomplete_delay_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// Default filter directive when RUST_LOG is unset
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Log file location (defaults to the data directory)
  pub file: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      file: None,
    }
  }
}

fn default_api_url() -> String {
  "http://localhost:8000".to_string()
}

fn default_timeout_secs() -> u64 {
  30
}

fn default_stale_secs() -> u64 {
  300
}

fn default_autocomplete_delay_ms() -> u64 {
  300
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./dxcodes.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/dxcodes/config.yaml
  ///
  /// Falls back to defaults when no file exists.
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
        info!("no configuration file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("dxcodes.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("dxcodes").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Page size for list commands.
  pub fn page_size(&self) -> u64 {
    self.default_page_size.unwrap_or(20)
  }

  /// Get the API bearer token from environment variables.
  ///
  /// Checks DXCODES_API_TOKEN first, then API_TOKEN as fallback. Requests go
  /// out unauthenticated when neither is set.
  pub fn get_api_token() -> Option<String> {
    std::env::var("DXCODES_API_TOKEN")
      .or_else(|_| std::env::var("API_TOKEN"))
      .ok()
      .filter(|t| !t.is_empty())
  }

  /// Directory for the log file and the saved-filter database.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("dxcodes"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_fill_missing_sections() {
    let config = Config::from_yaml("api:\n  url: https://codes.example.com\n").unwrap();
    assert_eq!(config.api.url, "https://codes.example.com");
    assert_eq!(config.api.timeout_secs, 30);
    assert_eq!(config.cache.stale_secs, 300);
    assert_eq!(config.log.level, "info");
    assert_eq!(config.page_size(), 20);
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
api:
  url: http://127.0.0.1:9000/
  timeout_secs: 5
cache:
  stale_secs: 60
  autocomplete_delay_ms: 150
log:
  level: debug
  file: /tmp/dxcodes.log
default_page_size: 12
"#;
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(config.api.timeout(), Duration::from_secs(5));
    assert_eq!(config.cache.stale_time(), chrono::Duration::seconds(60));
    assert_eq!(config.cache.autocomplete_delay(), Duration::from_millis(150));
    assert_eq!(config.log.file, Some(PathBuf::from("/tmp/dxcodes.log")));
    assert_eq!(config.page_size(), 12);
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/dxcodes.yaml"))).is_err());
  }
}
