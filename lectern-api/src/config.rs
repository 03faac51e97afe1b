//! Server Configuration
//!
//! Everything the server needs at startup, loaded from environment variables
//! with development defaults.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use lectern_core::{ConfigError, ModelCatalog};
use lectern_storage::{CacheConfig, CompressionConfig};

use crate::constants::{
    DEFAULT_BIND_HOST, DEFAULT_CACHE_ROOT, DEFAULT_CORS_MAX_AGE_SECS, DEFAULT_PORT,
    DEFAULT_RESULT_CHANNEL_CAPACITY, DEFAULT_WS_CAPACITY,
};

/// Top-level server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_host: String,
    pub port: u16,

    /// Allowed CORS origins. Empty means allow all (dev mode).
    pub cors_origins: Vec<String>,
    pub cors_max_age_secs: u64,

    /// Artifact cache settings.
    pub cache: CacheConfig,

    /// Model catalog TOML. `None` serves the builtin catalog.
    pub catalog_path: Option<PathBuf>,

    /// Per-document status buffer.
    pub ws_capacity: usize,

    /// Worker results buffered ahead of the consumer pool.
    pub result_channel_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: DEFAULT_BIND_HOST.to_string(),
            port: DEFAULT_PORT,
            cors_origins: Vec::new(),
            cors_max_age_secs: DEFAULT_CORS_MAX_AGE_SECS,
            cache: CacheConfig::new(DEFAULT_CACHE_ROOT),
            catalog_path: None,
            ws_capacity: DEFAULT_WS_CAPACITY,
            result_channel_capacity: DEFAULT_RESULT_CHANNEL_CAPACITY,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl ServerConfig {
    /// Create ServerConfig from environment variables.
    ///
    /// Environment variables:
    /// - `LECTERN_API_BIND`: Bind host (default: 0.0.0.0)
    /// - `PORT` / `LECTERN_API_PORT`: Port (default: 3000)
    /// - `LECTERN_CORS_ORIGINS`: Comma-separated allowed origins (empty = allow all)
    /// - `LECTERN_CACHE_ROOT`: Cache directory (default: ./lectern-cache)
    /// - `LECTERN_CACHE_MAX_BYTES`: Eviction threshold in bytes
    /// - `LECTERN_CACHE_MAP_SIZE_MB`: LMDB map size
    /// - `LECTERN_CACHE_WRITE_TIMEOUT_MS`: Cache write wait bound
    /// - `LECTERN_CACHE_FLUSH_INTERVAL_MS`: Access-time flush interval
    /// - `LECTERN_CACHE_COMPRESSION`: "false" disables payload compression
    /// - `LECTERN_CATALOG_PATH`: Model catalog TOML file
    /// - `LECTERN_WS_CAPACITY`: Per-document event buffer (default: 256)
    /// - `LECTERN_RESULT_CHANNEL_CAPACITY`: Result buffer (default: 1024)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let bind_host = std::env::var("LECTERN_API_BIND").unwrap_or(defaults.bind_host);
        let port = std::env::var("PORT")
            .ok()
            .or_else(|| std::env::var("LECTERN_API_PORT").ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.port);

        let cors_origins = std::env::var("LECTERN_CORS_ORIGINS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let cache_root = std::env::var("LECTERN_CACHE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CACHE_ROOT));
        let mut cache = CacheConfig::new(cache_root);
        if let Some(max_bytes) = env_parse("LECTERN_CACHE_MAX_BYTES") {
            cache = cache.with_max_bytes(max_bytes);
        }
        if let Some(map_size_mb) = env_parse("LECTERN_CACHE_MAP_SIZE_MB") {
            cache.map_size_mb = map_size_mb;
        }
        if let Some(ms) = env_parse("LECTERN_CACHE_WRITE_TIMEOUT_MS") {
            cache = cache.with_write_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = env_parse("LECTERN_CACHE_FLUSH_INTERVAL_MS") {
            cache = cache.with_flush_interval(Duration::from_millis(ms));
        }
        let compression_enabled = std::env::var("LECTERN_CACHE_COMPRESSION")
            .map(|s| s.to_lowercase() != "false")
            .unwrap_or(true);
        if !compression_enabled {
            cache = cache.with_compression(CompressionConfig::disabled());
        }

        Self {
            bind_host,
            port,
            cors_origins,
            cors_max_age_secs: env_parse("LECTERN_CORS_MAX_AGE_SECS")
                .unwrap_or(defaults.cors_max_age_secs),
            cache,
            catalog_path: std::env::var("LECTERN_CATALOG_PATH").ok().map(PathBuf::from),
            ws_capacity: env_parse("LECTERN_WS_CAPACITY").unwrap_or(defaults.ws_capacity),
            result_channel_capacity: env_parse("LECTERN_RESULT_CHANNEL_CAPACITY")
                .unwrap_or(defaults.result_channel_capacity),
        }
    }

    /// Socket address to bind.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.bind_host, self.port);
        addr.parse().map_err(|e: std::net::AddrParseError| ConfigError::InvalidValue {
            field: "bind_addr".to_string(),
            value: addr.clone(),
            reason: e.to_string(),
        })
    }

    /// Load the model catalog: the configured TOML file or the builtin one.
    pub fn load_catalog(&self) -> Result<ModelCatalog, ConfigError> {
        match &self.catalog_path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Parse {
                    reason: format!("{}: {}", path.display(), e),
                })?;
                ModelCatalog::from_toml_str(&raw)
            }
            None => ModelCatalog::builtin(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ws_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "ws_capacity".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.result_channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "result_channel_capacity".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        self.cache.validate()
    }

    pub fn is_production(&self) -> bool {
        !self.cors_origins.is_empty()
    }
}
