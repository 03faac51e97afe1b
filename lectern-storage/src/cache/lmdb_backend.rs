//! LMDB-backed artifact cache.
//!
//! Uses the heed crate (Rust bindings for LMDB) for entry metadata, an
//! access-ordered index of evictable entries and a sharded blob tree for
//! payloads.
//!
//! # Thread Safety
//!
//! - Read transactions for `retrieve` and `contains`, opened per call
//! - Write transactions only on the writer thread
//! - Statistics are tracked with atomic counters

use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use lectern_core::{ContentKey, LecternResult, StorageError};

use super::codec;
use super::layout::BlobLayout;
use super::traits::{ArtifactStore, CacheEntry, CacheStats, EvictionReport};
use super::writer::{
    decode_entry, index_entry, txn_err, CacheCounters, WriteCommand, WriterContext, WriterHandle,
};
use super::CacheConfig;

/// Error type for opening the LMDB cache.
#[derive(Debug, thiserror::Error)]
pub enum LmdbCacheError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Existing metadata could not be read back.
    #[error("Corrupt metadata: {0}")]
    Corrupt(String),

    /// Invalid configuration.
    #[error("Invalid cache configuration: {0}")]
    Config(#[from] lectern_core::ConfigError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbCacheError> for lectern_core::LecternError {
    fn from(e: LmdbCacheError) -> Self {
        lectern_core::LecternError::Storage(StorageError::TransactionFailed {
            reason: e.to_string(),
        })
    }
}

/// Artifact cache with LRU eviction, pinning, sharded blobs and compression.
///
/// # Example
///
/// ```ignore
/// let cache = LmdbArtifactCache::open(CacheConfig::new("/var/lib/lectern"))?;
/// cache.store(&key, audio, false).await?;
/// let bytes = cache.retrieve(&key).await?;
/// ```
pub struct LmdbArtifactCache {
    env: Env,
    db: Database<Bytes, Bytes>,
    layout: BlobLayout,
    config: CacheConfig,
    touches: Arc<DashMap<ContentKey, i64>>,
    counters: Arc<CacheCounters>,
    writer: WriterHandle,
}

impl LmdbArtifactCache {
    /// Open (or create) the cache under `config.root` and start its writer.
    pub fn open(config: CacheConfig) -> Result<Self, LmdbCacheError> {
        config.validate()?;

        let meta_dir = config.root.join("meta");
        std::fs::create_dir_all(&meta_dir)?;
        let layout = BlobLayout::new(&config.root);
        std::fs::create_dir_all(layout.blobs_dir())?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(config.map_size_mb * 1024 * 1024)
                .max_dbs(2)
                .open(&meta_dir)
        }
        .map_err(|e| LmdbCacheError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some("entries"))
            .map_err(|e| LmdbCacheError::DbOpen(e.to_string()))?;
        let lru: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some("lru"))
            .map_err(|e| LmdbCacheError::DbOpen(e.to_string()))?;
        Self::rebuild_access_index(&db, &lru, &mut wtxn)?;
        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let counters = Arc::new(CacheCounters::default());
        Self::load_totals(&env, &db, &counters)?;

        let touches = Arc::new(DashMap::new());
        let writer = WriterHandle::spawn(
            WriterContext {
                env: env.clone(),
                db,
                lru,
                layout: layout.clone(),
                touches: Arc::clone(&touches),
                counters: Arc::clone(&counters),
                max_bytes: config.max_bytes,
                eviction_target: config.eviction_target(),
                flush_interval: config.flush_interval,
            },
            config.write_timeout,
        )?;

        tracing::info!(
            root = %config.root.display(),
            entries = counters.entries.load(Ordering::Acquire),
            stored_bytes = counters.bytes.load(Ordering::Acquire),
            max_bytes = config.max_bytes,
            "artifact cache opened"
        );

        Ok(Self {
            env,
            db,
            layout,
            config,
            touches,
            counters,
            writer,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Fill an empty access index from the entries, for caches written
    /// before the index existed.
    fn rebuild_access_index(
        db: &Database<Bytes, Bytes>,
        lru: &Database<Bytes, Bytes>,
        wtxn: &mut heed::RwTxn<'_>,
    ) -> Result<(), LmdbCacheError> {
        let tx_err = |e: heed::Error| LmdbCacheError::Transaction(e.to_string());
        if !lru.is_empty(wtxn).map_err(tx_err)? || db.is_empty(wtxn).map_err(tx_err)? {
            return Ok(());
        }

        let mut entries = Vec::new();
        for item in db.iter(wtxn).map_err(tx_err)? {
            let (_, raw) = item.map_err(tx_err)?;
            let entry = decode_entry(raw).map_err(|e| LmdbCacheError::Corrupt(e.to_string()))?;
            if !entry.pinned {
                entries.push(entry);
            }
        }
        for entry in &entries {
            index_entry(lru, wtxn, entry).map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        }
        tracing::info!(indexed = entries.len(), "rebuilt cache access index");
        Ok(())
    }

    fn load_totals(
        env: &Env,
        db: &Database<Bytes, Bytes>,
        counters: &CacheCounters,
    ) -> Result<(), LmdbCacheError> {
        let rtxn = env
            .read_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        let iter = db
            .iter(&rtxn)
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        let (mut entries, mut bytes) = (0u64, 0u64);
        for item in iter {
            let (_, raw) = item.map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
            let entry = decode_entry(raw).map_err(|e| LmdbCacheError::Corrupt(e.to_string()))?;
            entries += 1;
            bytes += entry.stored_size;
        }
        counters.entries.store(entries, Ordering::Release);
        counters.bytes.store(bytes, Ordering::Release);
        Ok(())
    }

    /// Read one entry's metadata through a fresh read transaction.
    pub fn entry(&self, key: &ContentKey) -> Result<Option<CacheEntry>, StorageError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        match self.db.get(&rtxn, key.as_str().as_bytes()).map_err(txn_err)? {
            Some(raw) => decode_entry(raw).map(Some),
            None => Ok(None),
        }
    }

    fn record_touch(&self, key: &ContentKey) {
        self.touches
            .insert(key.clone(), Utc::now().timestamp_millis());
        if self.touches.len() >= self.config.touch_flush_threshold {
            self.writer.nudge_flush();
        }
    }
}

impl Drop for LmdbArtifactCache {
    fn drop(&mut self) {
        self.writer.shutdown();
    }
}

#[async_trait]
impl ArtifactStore for LmdbArtifactCache {
    async fn store(&self, key: &ContentKey, bytes: Vec<u8>, pinned: bool) -> LecternResult<()> {
        let original_size = bytes.len() as u64;
        let encoded =
            codec::encode(bytes, &self.config.compression).map_err(|e| StorageError::WriteFailed {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        self.writer
            .request(|reply| WriteCommand::Store {
                key: key.clone(),
                payload: encoded.bytes,
                original_size,
                compressed: encoded.compressed,
                pinned,
                reply,
            })
            .await?;
        Ok(())
    }

    async fn retrieve(&self, key: &ContentKey) -> LecternResult<Option<Vec<u8>>> {
        let Some(entry) = self.entry(key)? else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let raw = match tokio::fs::read(self.layout.path_for(key)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Evicted between the metadata read and the blob read.
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            Err(e) => {
                return Err(StorageError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                }
                .into())
            }
        };

        let bytes = codec::decode(raw, entry.compressed).map_err(|e| StorageError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        self.record_touch(key);
        Ok(Some(bytes))
    }

    async fn contains(&self, key: &ContentKey) -> LecternResult<bool> {
        Ok(self.entry(key)?.is_some())
    }

    async fn pin(&self, key: &ContentKey) -> LecternResult<bool> {
        let found = self
            .writer
            .request(|reply| WriteCommand::SetPinned {
                key: key.clone(),
                pinned: true,
                reply,
            })
            .await?;
        Ok(found)
    }

    async fn unpin(&self, key: &ContentKey) -> LecternResult<bool> {
        let found = self
            .writer
            .request(|reply| WriteCommand::SetPinned {
                key: key.clone(),
                pinned: false,
                reply,
            })
            .await?;
        Ok(found)
    }

    async fn evict_to(&self, cap_bytes: u64) -> LecternResult<EvictionReport> {
        let report = self
            .writer
            .request(|reply| WriteCommand::EvictTo { cap_bytes, reply })
            .await?;
        Ok(report)
    }

    async fn flush(&self) -> LecternResult<u64> {
        let written = self
            .writer
            .request(|reply| WriteCommand::Flush { reply: Some(reply) })
            .await?;
        Ok(written)
    }

    async fn stats(&self) -> LecternResult<CacheStats> {
        Ok(CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            entry_count: self.counters.entries.load(Ordering::Acquire),
            stored_bytes: self.counters.bytes.load(Ordering::Acquire),
            evictions: self.counters.evictions.load(Ordering::Acquire),
            pending_touches: self.touches.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CompressionConfig;
    use lectern_core::SynthesisParams;
    use std::time::Duration;
    use tempfile::TempDir;

    fn key(text: &str) -> ContentKey {
        ContentKey::derive(text, "kokoro", "af_heart", &SynthesisParams::default())
    }

    fn create_test_cache(max_bytes: u64) -> (LmdbArtifactCache, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let config = CacheConfig::new(temp_dir.path())
            .with_max_bytes(max_bytes)
            .with_compression(CompressionConfig::disabled())
            .with_flush_interval(Duration::from_secs(60));
        let cache = LmdbArtifactCache::open(config).expect("cache open should succeed");
        (cache, temp_dir)
    }

    #[tokio::test]
    async fn test_store_and_retrieve() {
        let (cache, _temp_dir) = create_test_cache(1 << 20);
        let k = key("hello");

        cache
            .store(&k, b"audio-bytes".to_vec(), false)
            .await
            .expect("store should succeed");

        let bytes = cache.retrieve(&k).await.expect("retrieve should succeed");
        assert_eq!(bytes.as_deref(), Some(&b"audio-bytes"[..]));
        assert!(cache.contains(&k).await.expect("contains should succeed"));
    }

    #[tokio::test]
    async fn test_retrieve_nonexistent() {
        let (cache, _temp_dir) = create_test_cache(1 << 20);
        let bytes = cache
            .retrieve(&key("missing"))
            .await
            .expect("retrieve should succeed");
        assert!(bytes.is_none());
        assert!(!cache
            .contains(&key("missing"))
            .await
            .expect("contains should succeed"));
    }

    #[tokio::test]
    async fn test_overwrite_is_idempotent() {
        let (cache, _temp_dir) = create_test_cache(1 << 20);
        let k = key("again");

        cache.store(&k, vec![1; 100], false).await.expect("store");
        cache.store(&k, vec![2; 100], false).await.expect("store");

        let stats = cache.stats().await.expect("stats");
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.stored_bytes, 100);
        assert_eq!(
            cache.retrieve(&k).await.expect("retrieve"),
            Some(vec![2; 100])
        );
    }

    #[tokio::test]
    async fn test_blob_lands_in_sharded_path() {
        let (cache, temp_dir) = create_test_cache(1 << 20);
        let k = key("sharded");
        cache.store(&k, vec![9; 10], false).await.expect("store");

        let hex = k.as_str();
        let path = temp_dir
            .path()
            .join("blobs")
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(hex);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_retrieve_is_a_pure_read_until_flush() {
        let (cache, _temp_dir) = create_test_cache(1 << 20);
        let k = key("touched");
        cache.store(&k, vec![1; 10], false).await.expect("store");
        let before = cache.entry(&k).expect("entry").expect("present");

        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.retrieve(&k).await.expect("retrieve");

        let unflushed = cache.entry(&k).expect("entry").expect("present");
        assert_eq!(unflushed.last_accessed_ms, before.last_accessed_ms);
        assert_eq!(cache.stats().await.expect("stats").pending_touches, 1);

        assert_eq!(cache.flush().await.expect("flush"), 1);
        let flushed = cache.entry(&k).expect("entry").expect("present");
        assert!(flushed.last_accessed_ms > before.last_accessed_ms);
        assert_eq!(cache.stats().await.expect("stats").pending_touches, 0);
    }

    #[tokio::test]
    async fn test_pin_survives_overwrite() {
        let (cache, _temp_dir) = create_test_cache(1 << 20);
        let k = key("pinned");
        cache.store(&k, vec![1; 10], true).await.expect("store");
        cache.store(&k, vec![1; 10], false).await.expect("store");
        assert!(cache.entry(&k).expect("entry").expect("present").pinned);

        assert!(cache.unpin(&k).await.expect("unpin"));
        assert!(!cache.entry(&k).expect("entry").expect("present").pinned);
        assert!(!cache.pin(&key("absent")).await.expect("pin"));
    }

    #[tokio::test]
    async fn test_stats() {
        let (cache, _temp_dir) = create_test_cache(1 << 20);
        let k = key("stats");

        let _ = cache.retrieve(&k).await;
        cache.store(&k, vec![0; 64], false).await.expect("store");
        let _ = cache.retrieve(&k).await;
        let _ = cache.retrieve(&k).await;

        let stats = cache.stats().await.expect("stats should succeed");
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.stored_bytes, 64);
    }

    #[tokio::test]
    async fn test_reopen_restores_totals() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let config = CacheConfig::new(temp_dir.path()).with_compression(CompressionConfig::disabled());
        {
            let cache = LmdbArtifactCache::open(config.clone()).expect("open");
            cache.store(&key("a"), vec![0; 30], false).await.expect("store");
            cache.store(&key("b"), vec![0; 20], false).await.expect("store");
        }
        let cache = LmdbArtifactCache::open(config).expect("reopen");
        let stats = cache.stats().await.expect("stats");
        assert_eq!(stats.entry_count, 2);
        assert_eq!(stats.stored_bytes, 50);
    }
}
