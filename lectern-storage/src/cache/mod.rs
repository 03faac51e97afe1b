//! Artifact cache: LRU + pinning + sharding + compression.
//!
//! # Layout
//!
//! ```text
//! <root>/
//!   meta/            LMDB environment, one `entries` database keyed by content key
//!   blobs/ab/cd/<k>  payload for content key `k` (65,536 buckets)
//! ```
//!
//! # Concurrency
//!
//! Every LMDB write transaction runs on a single writer thread
//! ([`writer`]). Callers submit a command and await a oneshot reply bounded
//! by `write_timeout`. Reads open their own MVCC read transaction and never
//! wait on the writer.
//!
//! Access times are not written on read. `retrieve` records the touch in an
//! in-memory map that the writer flushes in one transaction, either every
//! `flush_interval` or once `touch_flush_threshold` keys are pending.

pub mod codec;
pub mod layout;
pub mod lmdb_backend;
pub mod traits;
pub(crate) mod writer;

use std::path::{Path, PathBuf};
use std::time::Duration;

use lectern_core::ConfigError;

pub use codec::CompressionConfig;
pub use layout::BlobLayout;
pub use lmdb_backend::{LmdbArtifactCache, LmdbCacheError};
pub use traits::{ArtifactStore, CacheEntry, CacheStats, EvictionReport};

/// Tuning for [`LmdbArtifactCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding `meta/` and `blobs/`.
    pub root: PathBuf,
    /// LMDB map size for the metadata environment.
    pub map_size_mb: usize,
    /// Stored-bytes cap. A store that pushes the total above it triggers eviction.
    pub max_bytes: u64,
    /// Eviction stops once the total is at or below `max_bytes * evict_target_ratio`.
    pub evict_target_ratio: f64,
    /// Longest a caller waits for the writer before giving up.
    pub write_timeout: Duration,
    /// Period of the access-time flush.
    pub flush_interval: Duration,
    /// Pending touches that force an early flush.
    pub touch_flush_threshold: usize,
    pub compression: CompressionConfig,
}

impl CacheConfig {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            map_size_mb: 64,
            max_bytes: 2 * 1024 * 1024 * 1024,
            evict_target_ratio: 0.9,
            write_timeout: Duration::from_secs(5),
            flush_interval: Duration::from_secs(2),
            touch_flush_threshold: 512,
            compression: CompressionConfig::default(),
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_compression(mut self, compression: CompressionConfig) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Bytes the cache shrinks to once eviction kicks in.
    pub fn eviction_target(&self) -> u64 {
        (self.max_bytes as f64 * self.evict_target_ratio) as u64
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_bytes == 0 {
            return Err(invalid("cache.max_bytes", "0", "must be > 0"));
        }
        if !(self.evict_target_ratio > 0.0 && self.evict_target_ratio <= 1.0) {
            return Err(invalid(
                "cache.evict_target_ratio",
                &self.evict_target_ratio.to_string(),
                "must be in (0, 1]",
            ));
        }
        if self.map_size_mb == 0 {
            return Err(invalid("cache.map_size_mb", "0", "must be > 0"));
        }
        if self.write_timeout.is_zero() {
            return Err(invalid("cache.write_timeout", "0", "must be > 0"));
        }
        if self.flush_interval.is_zero() {
            return Err(invalid("cache.flush_interval", "0", "must be > 0"));
        }
        if self.touch_flush_threshold == 0 {
            return Err(invalid("cache.touch_flush_threshold", "0", "must be > 0"));
        }
        if self.compression.level > 9 {
            return Err(invalid(
                "cache.compression.level",
                &self.compression.level.to_string(),
                "must be 0-9",
            ));
        }
        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CacheConfig::new("/tmp/lectern").validate().is_ok());
    }

    #[test]
    fn test_eviction_target() {
        let config = CacheConfig::new("/tmp/x").with_max_bytes(1000);
        assert_eq!(config.eviction_target(), 900);
    }

    #[test]
    fn test_rejects_bad_ratio() {
        let mut config = CacheConfig::new("/tmp/x");
        config.evict_target_ratio = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
