//! Configuration management for Quotaguard.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then environment variables prefixed with `QUOTAGUARD__` (nested keys are
//! separated by a double underscore, e.g. `QUOTAGUARD__STORE__REDIS_URL`).
//! The conventional `REDIS_URL` variable is honoured when no Redis URL was
//! configured otherwise.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{QuotaError, Result};
use crate::store::DEFAULT_MAX_ENTRIES;

/// Main configuration for the Quotaguard service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Quota policy configuration
    #[serde(default)]
    pub policies: PolicyConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Paths never subject to the global quota
    #[serde(default = "default_exempt_paths")]
    pub exempt_paths: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            exempt_paths: default_exempt_paths(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_exempt_paths() -> Vec<String> {
    ["/", "/health", "/docs", "/openapi.json"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL. When unset the in-process store is used.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Bound on connecting to Redis and the startup ping, in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Bound on each Redis operation, in milliseconds
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// Interval of the in-process expiry sweep, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Maximum number of keys held by the in-process store
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            connect_timeout_ms: default_connect_timeout(),
            operation_timeout_ms: default_operation_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            max_entries: default_max_entries(),
        }
    }
}

impl StoreConfig {
    /// Connect timeout as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Per-operation timeout as a `Duration`.
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Sweep interval as a `Duration`.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_operation_timeout() -> u64 {
    2000
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_max_entries() -> usize {
    DEFAULT_MAX_ENTRIES
}

/// Quota policy configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Path to a YAML policy table. Built-in policies are used when unset.
    #[serde(default)]
    pub path: Option<String>,
}

impl ServiceConfig {
    /// Load configuration from an optional file and the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("QUOTAGUARD").separator("__"),
        );

        let mut config: ServiceConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| QuotaError::Config(e.to_string()))?;

        if config.store.redis_url.is_none() {
            config.store.redis_url = std::env::var("REDIS_URL").ok().filter(|url| !url.is_empty());
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ServiceConfig =
            serde_yaml::from_str(yaml).map_err(|e| QuotaError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.store.connect_timeout_ms == 0 || self.store.operation_timeout_ms == 0 {
            return Err(QuotaError::Config(
                "store timeouts must be greater than zero".to_string(),
            ));
        }
        if self.store.sweep_interval_secs == 0 {
            return Err(QuotaError::Config(
                "store.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
