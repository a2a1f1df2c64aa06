//! # Configuration Module
//!
//! Configuration for the dispatcher host: listen address, route sources, global
//! middleware, the shared store backend and the upstream transport.
//!
//! ## Key Features
//! - YAML/JSON configuration parsing with serde, chosen by file extension
//! - Environment variable override support (`DISPATCHER_<FIELD>`)
//! - Validation with detailed error messages

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::core::error::{GatewayError, GatewayResult};

/// Main dispatcher configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Address the host binary listens on
    pub listen: String,

    /// Inline route descriptors
    pub routes: Vec<serde_json::Value>,

    /// Route files (JSON or YAML), each becoming one file loader
    pub route_files: Vec<PathBuf>,

    /// Middleware applied to every route, in any accepted spec shape
    pub global_middlewares: serde_json::Value,

    /// Shared key-value store backend
    pub store: StoreConfig,

    /// Upstream transport settings
    pub transport: TransportConfig,

    /// Default tracing filter when `RUST_LOG` is not set
    pub log_filter: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            routes: Vec::new(),
            route_files: Vec::new(),
            global_middlewares: serde_json::Value::Null,
            store: StoreConfig::default(),
            transport: TransportConfig::default(),
            log_filter: "route_dispatcher=info".to_string(),
        }
    }
}

/// Shared store backend selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Process-local store; only correct when a single process serves traffic
    Memory {
        /// How often expired entries are swept; zero disables the sweep
        #[serde(with = "humantime_serde", default = "default_cleanup_interval")]
        cleanup_interval: Duration,
    },
    /// Redis, shared by every dispatcher process
    Redis { url: String },
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Memory {
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(60)
}

/// Upstream transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Overall request timeout when no middleware supplies one
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// TCP connect timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// User agent sent when the client did not send one
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: format!("route-dispatcher/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl DispatcherConfig {
    /// Load configuration from a YAML or JSON file (by extension; YAML otherwise)
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::config(format!("Failed to read config file {}: {}", path.display(), e)))?;

        let mut config = Self::parse(&content, is_json_path(path))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration text
    pub fn parse(content: &str, json: bool) -> GatewayResult<Self> {
        if json {
            serde_json::from_str(content)
                .map_err(|e| GatewayError::config(format!("Failed to parse JSON config: {}", e)))
        } else {
            serde_yaml::from_str(content)
                .map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))
        }
    }

    /// Apply environment variable overrides to configuration
    ///
    /// - `DISPATCHER_LISTEN`: listen address
    /// - `DISPATCHER_REDIS_URL`: switch the store to Redis
    /// - `DISPATCHER_ROUTES`: extra route files, separated by `:`
    /// - `DISPATCHER_TRANSPORT_TIMEOUT`: humantime duration
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        use std::env;

        if let Ok(listen) = env::var("DISPATCHER_LISTEN") {
            self.listen = listen;
        }

        if let Ok(url) = env::var("DISPATCHER_REDIS_URL") {
            self.store = StoreConfig::Redis { url };
        }

        if let Ok(routes) = env::var("DISPATCHER_ROUTES") {
            self.route_files.extend(
                routes
                    .split(':')
                    .filter(|part| !part.is_empty())
                    .map(PathBuf::from),
            );
        }

        if let Ok(timeout) = env::var("DISPATCHER_TRANSPORT_TIMEOUT") {
            self.transport.timeout = humantime::parse_duration(&timeout)
                .map_err(|e| GatewayError::config(format!("Invalid DISPATCHER_TRANSPORT_TIMEOUT: {}", e)))?;
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> GatewayResult<()> {
        self.listen
            .parse::<std::net::SocketAddr>()
            .map_err(|e| GatewayError::config(format!("Invalid listen address '{}': {}", self.listen, e)))?;

        if let StoreConfig::Redis { url } = &self.store {
            let parsed = Url::parse(url)
                .map_err(|e| GatewayError::config(format!("Invalid Redis URL '{}': {}", url, e)))?;
            if !matches!(parsed.scheme(), "redis" | "rediss") {
                return Err(GatewayError::config(format!(
                    "Redis URL must use redis:// or rediss://, got '{}'",
                    url
                )));
            }
        }

        if self.transport.timeout.is_zero() {
            return Err(GatewayError::config("transport.timeout must be greater than zero"));
        }

        if self.routes.is_empty() && self.route_files.is_empty() {
            tracing::warn!("No routes configured; every request will be left to the host");
        }

        Ok(())
    }
}

/// Whether a path names a JSON document
pub(crate) fn is_json_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}
