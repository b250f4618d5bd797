//! Gateway configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;
use warden_types::GatewayPolicy;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Gateway policy: queue sizing, worker count, default thresholds,
    /// mitigation retry schedule.
    #[serde(default)]
    pub policy: GatewayPolicy,

    /// Upstream platform API settings for the action sink.
    #[serde(default)]
    pub platform: PlatformConfig,

    /// Bearer token required by the admin API. When unset, the admin API
    /// rejects every request.
    #[serde(default)]
    pub operator_token: Option<String>,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Busy timeout for SQLite connections, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled SQLite connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "warden_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Upstream platform API configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlatformConfig {
    /// Base URL of the platform API the action sink calls. When unset,
    /// actions are logged instead of executed (useful in development).
    #[serde(default)]
    pub api_base_url: Option<String>,

    /// Per-request timeout for platform API calls, in milliseconds.
    #[serde(default = "default_platform_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8080
}

fn default_db_path() -> String {
    "warden.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_platform_timeout_ms() -> u64 {
    10_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `WARDEN_HOST` overrides `server.host`
/// - `WARDEN_PORT` overrides `server.port`
/// - `WARDEN_DB_PATH` overrides `database.path`
/// - `WARDEN_LOG_LEVEL` overrides `logging.level`
/// - `WARDEN_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `WARDEN_OPERATOR_TOKEN` overrides `operator_token`
/// - `WARDEN_PLATFORM_API` overrides `platform.api_base_url`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    // Environment variable overrides
    if let Ok(host) = std::env::var("WARDEN_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Ok(port) = std::env::var("WARDEN_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Ok(db_path) = std::env::var("WARDEN_DB_PATH") {
        config.database.path = db_path;
    }
    if let Ok(level) = std::env::var("WARDEN_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("WARDEN_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Ok(token) = std::env::var("WARDEN_OPERATOR_TOKEN") {
        if !token.is_empty() {
            config.operator_token = Some(token);
        }
    }
    if let Ok(base) = std::env::var("WARDEN_PLATFORM_API") {
        if !base.is_empty() {
            config.platform.api_base_url = Some(base);
        }
    }

    Ok(config)
}
