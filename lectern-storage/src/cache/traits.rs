//! Artifact store trait and the records it traffics in.

use async_trait::async_trait;
use lectern_core::{ContentKey, LecternResult};
use serde::{Deserialize, Serialize};

/// Metadata for one cached payload. The payload itself lives in the blob tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: ContentKey,
    /// Bytes on disk (after compression).
    pub stored_size: u64,
    /// Bytes handed to `store`.
    pub original_size: u64,
    /// Last access, milliseconds since the Unix epoch.
    pub last_accessed_ms: i64,
    pub pinned: bool,
    pub compressed: bool,
}

/// Result of an eviction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    pub evicted: u64,
    pub freed_bytes: u64,
    pub remaining_bytes: u64,
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Stored bytes across all entries.
    pub stored_bytes: u64,
    /// Number of entries removed due to capacity.
    pub evictions: u64,
    /// Access-time updates waiting for the next flush.
    pub pending_touches: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Content-addressed payload store.
///
/// Stores are idempotent: writing the same key twice leaves one entry with
/// the latest payload. A pinned entry stays pinned across overwrites and is
/// never chosen for eviction.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Write `bytes` under `key`.
    async fn store(&self, key: &ContentKey, bytes: Vec<u8>, pinned: bool) -> LecternResult<()>;

    /// Read the payload for `key`, or `None` when absent.
    async fn retrieve(&self, key: &ContentKey) -> LecternResult<Option<Vec<u8>>>;

    /// Existence check. Does not count as an access.
    async fn contains(&self, key: &ContentKey) -> LecternResult<bool>;

    /// Exempt `key` from eviction. Returns false when the key is absent.
    async fn pin(&self, key: &ContentKey) -> LecternResult<bool>;

    /// Make `key` evictable again. Returns false when the key is absent.
    async fn unpin(&self, key: &ContentKey) -> LecternResult<bool>;

    /// Evict least-recently-used unpinned entries until at most `cap_bytes` remain.
    async fn evict_to(&self, cap_bytes: u64) -> LecternResult<EvictionReport>;

    /// Persist pending access-time updates. Returns how many were written.
    async fn flush(&self) -> LecternResult<u64>;

    /// Get cache statistics.
    async fn stats(&self) -> LecternResult<CacheStats>;
}
