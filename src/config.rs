//! Configuration management for the throttle gateway.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, ThrottleError};
use crate::throttle::{CategoryTable, Consistency};

/// Prefix for environment overrides, e.g. `RURALGURU__SERVER__UPSTREAM_URL`.
const ENV_PREFIX: &str = "RURALGURU";

/// Main configuration for the gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Throttle and store configuration
    #[serde(default)]
    pub throttle: ThrottleConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the gateway listens on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Marketplace application that allowed requests are forwarded to
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,

    /// Throttle paths outside `/api` under the default category
    #[serde(default)]
    pub protect_all_paths: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            upstream_url: default_upstream_url(),
            protect_all_paths: false,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_upstream_url() -> String {
    "http://127.0.0.1:3000".to_string()
}

/// Which shared store holds throttle records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

/// Throttle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL, used when `backend` is `redis`
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix for record keys in Redis
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Bound on each Redis connection attempt
    #[serde(default = "default_redis_connect_timeout_ms")]
    pub redis_connect_timeout_ms: u64,

    #[serde(default)]
    pub consistency: Consistency,

    /// Per-category limits
    #[serde(default)]
    pub categories: CategoryTable,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            redis_connect_timeout_ms: default_redis_connect_timeout_ms(),
            consistency: Consistency::default(),
            categories: CategoryTable::default(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1/".to_string()
}

fn default_key_prefix() -> String {
    "ruralguru:throttle:".to_string()
}

fn default_redis_connect_timeout_ms() -> u64 {
    1000
}

impl ThrottleConfig {
    pub fn redis_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.redis_connect_timeout_ms)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration. `RUST_LOG` takes precedence over `level`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GatewayConfig {
    /// Load configuration from an optional YAML file plus environment overrides.
    ///
    /// Values not set by either source keep their defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(ThrottleError::Config(format!(
                    "configuration file {} does not exist",
                    path.display()
                )));
            }
            builder = builder.add_source(
                ::config::File::from(path).format(::config::FileFormat::Yaml),
            );
        }

        let config = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ThrottleError::Config(format!("Failed to parse gateway config: {}", e)))
    }
}
