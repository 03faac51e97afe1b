//! LECTERN Storage - Artifact Cache
//!
//! Content-addressed storage for synthesized audio. Metadata lives in LMDB,
//! payloads live in a sharded blob tree next to it.

pub mod cache;

pub use lectern_core::StorageError;

pub use cache::{
    ArtifactStore, CacheConfig, CacheEntry, CacheStats, CompressionConfig, EvictionReport,
    LmdbArtifactCache, LmdbCacheError,
};
