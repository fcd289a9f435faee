//! Configuration loader and validator for the bulk catalog pipeline.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub pipeline: Pipeline,
    pub push: Push,
    pub connector: Connector,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
}

/// Chunking and retry tunables. These are deliberately configuration, not
/// contract: the right values depend on row width and storage latency.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pipeline {
    pub chunk_size: u32,
    pub max_chunk_retries: u32,
    pub progress_buffer: u32,
}

/// Shared secret for the server-to-server progress push gateway. Distinct
/// from end-user auth.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Push {
    pub secret: String,
}

/// Integration source connector settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Connector {
    pub base_url: String,
    pub token: String,
    pub page_size: u32,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    // max_backoff_seconds is u64; it's inherently >= 0

    if cfg.pipeline.chunk_size == 0 {
        return Err(ConfigError::Invalid("pipeline.chunk_size must be > 0"));
    }
    if cfg.pipeline.chunk_size > 10_000 {
        return Err(ConfigError::Invalid("pipeline.chunk_size must be <= 10000"));
    }
    if cfg.pipeline.progress_buffer == 0 {
        return Err(ConfigError::Invalid("pipeline.progress_buffer must be > 0"));
    }

    if cfg.push.secret.trim().is_empty() {
        return Err(ConfigError::Invalid("push.secret must be non-empty"));
    }

    if cfg.connector.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("connector.base_url must be non-empty"));
    }
    if cfg.connector.token.trim().is_empty() {
        return Err(ConfigError::Invalid("connector.token must be non-empty"));
    }
    if cfg.connector.page_size == 0 {
        return Err(ConfigError::Invalid("connector.page_size must be > 0"));
    }

    Ok(())
}

/// Returns the canonical example YAML content.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  max_backoff_seconds: 60

pipeline:
  chunk_size: 250
  max_chunk_retries: 3
  progress_buffer: 32

push:
  secret: "CHANGE_ME_SHARED_SECRET"

connector:
  base_url: "https://connector.example.com/"
  token: "YOUR_CONNECTOR_TOKEN"
  page_size: 250
"#
}
