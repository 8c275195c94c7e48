use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub auth: AuthConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub errors: ErrorsConfig,
  #[serde(default)]
  pub stream: StreamConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL that shape and mutation paths are appended to
  pub base_url: String,
  /// Token endpoint used by `HttpTokenSource`
  pub token_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
  /// How long a fetched access token is reused before asking again.
  /// Kept below the server's own staleness window.
  #[serde(default = "default_token_ttl_secs")]
  pub token_ttl_secs: u64,
}

impl Default for AuthConfig {
  fn default() -> Self {
    Self {
      token_ttl_secs: default_token_ttl_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Grace period before an unused collection is dropped
  #[serde(default = "default_gc_grace_secs")]
  pub gc_grace_secs: u64,
  #[serde(default = "default_sweep_interval_secs")]
  pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      gc_grace_secs: default_gc_grace_secs(),
      sweep_interval_secs: default_sweep_interval_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorsConfig {
  #[serde(default = "default_base_backoff_ms")]
  pub base_backoff_ms: u64,
  #[serde(default = "default_max_backoff_ms")]
  pub max_backoff_ms: u64,
}

impl Default for ErrorsConfig {
  fn default() -> Self {
    Self {
      base_backoff_ms: default_base_backoff_ms(),
      max_backoff_ms: default_max_backoff_ms(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
  #[serde(default = "default_reconnect_initial_ms")]
  pub reconnect_initial_ms: u64,
  #[serde(default = "default_reconnect_max_ms")]
  pub reconnect_max_ms: u64,
}

impl Default for StreamConfig {
  fn default() -> Self {
    Self {
      reconnect_initial_ms: default_reconnect_initial_ms(),
      reconnect_max_ms: default_reconnect_max_ms(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
  /// Filter directive, e.g. "info" or "shapesync=debug"
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Write logs to this file instead of stderr
  pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      file: None,
    }
  }
}

fn default_token_ttl_secs() -> u64 {
  125
}

fn default_gc_grace_secs() -> u64 {
  300
}

fn default_sweep_interval_secs() -> u64 {
  30
}

fn default_base_backoff_ms() -> u64 {
  1_000
}

fn default_max_backoff_ms() -> u64 {
  30_000
}

fn default_reconnect_initial_ms() -> u64 {
  1_000
}

fn default_reconnect_max_ms() -> u64 {
  30_000
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Config {
  /// Build a configuration with defaults for everything but the API base URL.
  pub fn new(base_url: impl Into<String>) -> Self {
    Self {
      api: ApiConfig {
        base_url: base_url.into(),
        token_url: None,
      },
      auth: AuthConfig::default(),
      cache: CacheConfig::default(),
      errors: ErrorsConfig::default(),
      stream: StreamConfig::default(),
      logging: LoggingConfig::default(),
    }
  }

  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shapesync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shapesync/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/shapesync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("shapesync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shapesync").join("config.yaml");
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

  /// Parse configuration from a YAML string.
  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.base_url()?;
    Ok(config)
  }

  /// The API base URL, parsed.
  pub fn base_url(&self) -> Result<Url> {
    Url::parse(&self.api.base_url)
      .map_err(|e| eyre!("Invalid api.base_url '{}': {}", self.api.base_url, e))
  }

  pub fn token_ttl(&self) -> Duration {
    Duration::from_secs(self.auth.token_ttl_secs)
  }

  pub fn gc_grace(&self) -> Duration {
    Duration::from_secs(self.cache.gc_grace_secs)
  }

  pub fn sweep_interval(&self) -> Duration {
    Duration::from_secs(self.cache.sweep_interval_secs.max(1))
  }

  /// Get the session credential presented to the token endpoint.
  ///
  /// Checks SHAPESYNC_SESSION_TOKEN first, then SESSION_TOKEN as fallback.
  pub fn get_session_token() -> Result<String> {
    std::env::var("SHAPESYNC_SESSION_TOKEN")
      .or_else(|_| std::env::var("SESSION_TOKEN"))
      .map_err(|_| {
        eyre!("Session token not found. Set SHAPESYNC_SESSION_TOKEN or SESSION_TOKEN environment variable.")
      })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_fill_missing_sections() {
    let config = Config::from_yaml("api:\n  base_url: https://sync.example.com\n").unwrap();

    assert_eq!(config.token_ttl(), Duration::from_secs(125));
    assert_eq!(config.gc_grace(), Duration::from_secs(300));
    assert_eq!(config.errors.base_backoff_ms, 1_000);
    assert_eq!(config.errors.max_backoff_ms, 30_000);
    assert_eq!(config.logging.level, "info");
    assert!(config.api.token_url.is_none());
  }

  #[test]
  fn test_overrides() {
    let yaml = r#"
api:
  base_url: https://sync.example.com
  token_url: https://auth.example.com/token
auth:
  token_ttl_secs: 60
stream:
  reconnect_initial_ms: 250
"#;
    let config = Config::from_yaml(yaml).unwrap();

    assert_eq!(config.token_ttl(), Duration::from_secs(60));
    assert_eq!(config.stream.reconnect_initial_ms, 250);
    assert_eq!(config.stream.reconnect_max_ms, 30_000);
    assert_eq!(
      config.api.token_url.as_deref(),
      Some("https://auth.example.com/token")
    );
  }

  #[test]
  fn test_invalid_base_url_is_rejected() {
    assert!(Config::from_yaml("api:\n  base_url: not a url\n").is_err());
  }

  #[test]
  fn test_missing_explicit_path() {
    let err = Config::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
