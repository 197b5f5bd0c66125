//! Dispatcher configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/sockethub/dispatcher.toml`.
//!
//! # Required fields
//! - `dispatcher.sockethub_id`
//! - `dispatcher.catalog_path`
//!
//! Everything else carries a default: empty platform allow-list, one-second
//! liveness scans with a budget of ten, bind on `0.0.0.0:10550`.

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub dispatcher: DispatcherConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Instance id; namespaces every queue channel this dispatcher touches.
    pub sockethub_id: String,
    /// Ordered allow-list of loaded platforms (`dispatcher` is implicit).
    pub platforms: Vec<String>,
    /// Milliseconds between liveness scans.
    pub listener_interval_ms: u64,
    /// Maximum liveness scans before readiness gives up.
    pub listener_interval_count: u32,
    /// Path of the JSON platform/verb catalog.
    pub catalog_path: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    dispatcher: Option<RawDispatcherConfig>,
    server: Option<RawServerConfig>,
}

#[derive(Debug, Deserialize)]
struct RawDispatcherConfig {
    sockethub_id: Option<String>,
    platforms: Option<Vec<String>>,
    listener_interval_ms: Option<u64>,
    listener_interval_count: Option<u32>,
    catalog_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    bind: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from the default path `/etc/sockethub/dispatcher.toml`.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from_path(Path::new("/etc/sockethub/dispatcher.toml"))
}

pub fn load_config_from_path(path: &Path) -> Result<Config, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let raw_dispatcher = raw
        .dispatcher
        .ok_or_else(|| ConfigError::MissingField("dispatcher".to_owned()))?;
    let sockethub_id = raw_dispatcher
        .sockethub_id
        .ok_or_else(|| ConfigError::MissingField("dispatcher.sockethub_id".to_owned()))?;
    if sockethub_id.is_empty() {
        return Err(ConfigError::InvalidValue(
            "dispatcher.sockethub_id must be non-empty".to_owned(),
        ));
    }
    let catalog_path = raw_dispatcher
        .catalog_path
        .ok_or_else(|| ConfigError::MissingField("dispatcher.catalog_path".to_owned()))?;

    let listener_interval_ms = raw_dispatcher.listener_interval_ms.unwrap_or(1000);
    if listener_interval_ms == 0 {
        return Err(ConfigError::InvalidValue(
            "dispatcher.listener_interval_ms must be greater than zero".to_owned(),
        ));
    }
    let listener_interval_count = raw_dispatcher.listener_interval_count.unwrap_or(10);
    if listener_interval_count == 0 {
        return Err(ConfigError::InvalidValue(
            "dispatcher.listener_interval_count must be greater than zero".to_owned(),
        ));
    }

    let server = match raw.server {
        Some(s) => ServerConfig {
            bind: s.bind.unwrap_or_else(|| "0.0.0.0:10550".to_owned()),
        },
        None => ServerConfig {
            bind: "0.0.0.0:10550".to_owned(),
        },
    };

    Ok(Config {
        dispatcher: DispatcherConfig {
            sockethub_id,
            platforms: raw_dispatcher.platforms.unwrap_or_default(),
            listener_interval_ms,
            listener_interval_count,
            catalog_path,
        },
        server,
    })
}
