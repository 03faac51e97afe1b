//! The single cache writer.
//!
//! LMDB allows one write transaction at a time per environment. Rather than
//! letting request handlers queue on that lock, one thread owns every write
//! and callers talk to it over a channel. Blob files are written and removed
//! on the same thread so a store can never race an eviction of the same key.
//!
//! Unpinned entries are also indexed by `(last_accessed_ms, key)` in a second
//! database, so eviction walks the oldest entries first without reading the
//! rest of the cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use heed::types::Bytes;
use heed::{Database, Env, RwTxn};
use lectern_core::{ContentKey, StorageError};
use tokio::sync::oneshot;

use super::layout::BlobLayout;
use super::traits::{CacheEntry, EvictionReport};

type Reply<T> = oneshot::Sender<Result<T, StorageError>>;

pub(crate) enum WriteCommand {
    Store {
        key: ContentKey,
        payload: Vec<u8>,
        original_size: u64,
        compressed: bool,
        pinned: bool,
        reply: Reply<()>,
    },
    SetPinned {
        key: ContentKey,
        pinned: bool,
        reply: Reply<bool>,
    },
    /// `reply` is `None` for the fire-and-forget flush a reader triggers.
    Flush { reply: Option<Reply<u64>> },
    EvictTo { cap_bytes: u64, reply: Reply<EvictionReport> },
    Shutdown,
}

/// Counters shared between readers, the writer and `stats()`.
#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub entries: AtomicU64,
    pub bytes: AtomicU64,
}

pub(crate) struct WriterContext {
    pub env: Env,
    pub db: Database<Bytes, Bytes>,
    /// `last_accessed_ms` (big-endian) ++ key -> stored size, unpinned only.
    pub lru: Database<Bytes, Bytes>,
    pub layout: BlobLayout,
    pub touches: Arc<DashMap<ContentKey, i64>>,
    pub counters: Arc<CacheCounters>,
    pub max_bytes: u64,
    pub eviction_target: u64,
    pub flush_interval: Duration,
}

/// Caller side of the writer channel.
pub(crate) struct WriterHandle {
    tx: Sender<WriteCommand>,
    write_timeout: Duration,
    thread: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WriterHandle {
    pub fn spawn(ctx: WriterContext, write_timeout: Duration) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("lectern-cache-writer".to_string())
            .spawn(move || ctx.run(rx))?;
        Ok(Self {
            tx,
            write_timeout,
            thread: std::sync::Mutex::new(Some(thread)),
        })
    }

    #[cfg(test)]
    fn detached(tx: Sender<WriteCommand>, write_timeout: Duration) -> Self {
        Self {
            tx,
            write_timeout,
            thread: std::sync::Mutex::new(None),
        }
    }

    /// Submit a command and wait for its reply, at most `write_timeout`.
    pub async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> WriteCommand,
    ) -> Result<T, StorageError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .map_err(|_| StorageError::WriterClosed)?;

        match tokio::time::timeout(self.write_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StorageError::WriterClosed),
            Err(_) => Err(StorageError::WriteTimeout {
                waited_ms: self.write_timeout.as_millis() as u64,
            }),
        }
    }

    /// Ask for a flush without waiting for it.
    pub fn nudge_flush(&self) {
        let _ = self.tx.send(WriteCommand::Flush { reply: None });
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(WriteCommand::Shutdown);
        let handle = self.thread.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("cache writer thread panicked");
            }
        }
    }
}

impl WriterContext {
    fn run(self, rx: Receiver<WriteCommand>) {
        tracing::debug!("cache writer started");
        let mut last_flush = Instant::now();

        loop {
            match rx.recv_timeout(self.flush_interval) {
                Ok(WriteCommand::Shutdown) => break,
                Ok(command) => self.handle(command),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if last_flush.elapsed() >= self.flush_interval {
                if let Err(e) = self.flush_touches() {
                    tracing::warn!(error = %e, "periodic access-time flush failed");
                }
                last_flush = Instant::now();
            }
        }

        if let Err(e) = self.flush_touches() {
            tracing::warn!(error = %e, "final access-time flush failed");
        }
        tracing::debug!("cache writer stopped");
    }

    fn handle(&self, command: WriteCommand) {
        match command {
            WriteCommand::Store {
                key,
                payload,
                original_size,
                compressed,
                pinned,
                reply,
            } => {
                let result = self.store(&key, &payload, original_size, compressed, pinned);
                // The entry just written is never its own eviction victim.
                let keep = result.is_ok().then_some(&key);
                let _ = reply.send(result);
                if self.counters.bytes.load(Ordering::Acquire) > self.max_bytes {
                    if let Err(e) = self.evict_to(self.eviction_target, keep) {
                        tracing::error!(error = %e, "eviction after store failed");
                    }
                }
            }
            WriteCommand::SetPinned { key, pinned, reply } => {
                let _ = reply.send(self.set_pinned(&key, pinned));
            }
            WriteCommand::Flush { reply } => {
                let result = self.flush_touches();
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            tracing::warn!(error = %e, "access-time flush failed");
                        }
                    }
                }
            }
            WriteCommand::EvictTo { cap_bytes, reply } => {
                let _ = reply.send(self.evict_to(cap_bytes, None));
            }
            WriteCommand::Shutdown => {}
        }
    }

    fn store(
        &self,
        key: &ContentKey,
        payload: &[u8],
        original_size: u64,
        compressed: bool,
        pinned: bool,
    ) -> Result<(), StorageError> {
        self.layout
            .write_atomic(key, payload)
            .map_err(|e| StorageError::WriteFailed {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let previous = read_entry(&self.db, &wtxn, key)?;
        let entry = CacheEntry {
            key: key.clone(),
            stored_size: payload.len() as u64,
            original_size,
            last_accessed_ms: Utc::now().timestamp_millis(),
            pinned: pinned || previous.as_ref().is_some_and(|p| p.pinned),
            compressed,
        };
        if let Some(prev) = &previous {
            unindex_entry(&self.lru, &mut wtxn, prev)?;
        }
        write_entry(&self.db, &mut wtxn, &entry)?;
        index_entry(&self.lru, &mut wtxn, &entry)?;
        wtxn.commit().map_err(txn_err)?;

        match previous {
            Some(prev) => {
                self.counters.bytes.fetch_sub(prev.stored_size, Ordering::AcqRel);
                self.counters.bytes.fetch_add(entry.stored_size, Ordering::AcqRel);
            }
            None => {
                self.counters.entries.fetch_add(1, Ordering::AcqRel);
                self.counters.bytes.fetch_add(entry.stored_size, Ordering::AcqRel);
            }
        }
        tracing::trace!(key = %key, bytes = entry.stored_size, compressed, "stored artifact");
        Ok(())
    }

    fn set_pinned(&self, key: &ContentKey, pinned: bool) -> Result<bool, StorageError> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let Some(mut entry) = read_entry(&self.db, &wtxn, key)? else {
            return Ok(false);
        };
        if entry.pinned != pinned {
            unindex_entry(&self.lru, &mut wtxn, &entry)?;
            entry.pinned = pinned;
            write_entry(&self.db, &mut wtxn, &entry)?;
            index_entry(&self.lru, &mut wtxn, &entry)?;
            wtxn.commit().map_err(txn_err)?;
        }
        Ok(true)
    }

    /// Write pending access times in one transaction.
    fn flush_touches(&self) -> Result<u64, StorageError> {
        if self.touches.is_empty() {
            return Ok(0);
        }
        let pending: Vec<(ContentKey, i64)> = self
            .touches
            .iter()
            .map(|item| (item.key().clone(), *item.value()))
            .collect();

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let mut written = 0u64;
        for (key, accessed_ms) in &pending {
            if let Some(mut entry) = read_entry(&self.db, &wtxn, key)? {
                if *accessed_ms > entry.last_accessed_ms {
                    unindex_entry(&self.lru, &mut wtxn, &entry)?;
                    entry.last_accessed_ms = *accessed_ms;
                    write_entry(&self.db, &mut wtxn, &entry)?;
                    index_entry(&self.lru, &mut wtxn, &entry)?;
                    written += 1;
                }
            }
        }
        wtxn.commit().map_err(txn_err)?;

        // A reader may have touched a key again since the snapshot; keep that one.
        for (key, accessed_ms) in pending {
            self.touches.remove_if(&key, |_, current| *current == accessed_ms);
        }
        Ok(written)
    }

    /// Remove the least recently used unpinned entries, oldest first from
    /// the access index, in one transaction. `keep` is never removed.
    fn evict_to(
        &self,
        cap_bytes: u64,
        keep: Option<&ContentKey>,
    ) -> Result<EvictionReport, StorageError> {
        self.flush_touches()?;

        let total = self.counters.bytes.load(Ordering::Acquire);
        if total <= cap_bytes {
            return Ok(EvictionReport {
                remaining_bytes: total,
                ..EvictionReport::default()
            });
        }

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let mut remaining = total;
        let mut victims = Vec::new();
        {
            let iter = self.lru.iter(&wtxn).map_err(txn_err)?;
            for item in iter {
                if remaining <= cap_bytes {
                    break;
                }
                let (raw_key, raw_size) = item.map_err(txn_err)?;
                let key = index_key_content(raw_key)?;
                if keep == Some(&key) {
                    continue;
                }
                let stored_size = decode_size(raw_size)?;
                remaining = remaining.saturating_sub(stored_size);
                victims.push(Victim {
                    index_key: raw_key.to_vec(),
                    key,
                    stored_size,
                });
            }
        }
        for victim in &victims {
            self.db
                .delete(&mut wtxn, victim.key.as_str().as_bytes())
                .map_err(txn_err)?;
            self.lru
                .delete(&mut wtxn, &victim.index_key)
                .map_err(txn_err)?;
        }
        wtxn.commit().map_err(txn_err)?;

        let freed: u64 = victims.iter().map(|v| v.stored_size).sum();
        for victim in &victims {
            self.touches.remove(&victim.key);
            if let Err(e) = self.layout.remove(&victim.key) {
                tracing::warn!(key = %victim.key, error = %e, "failed to remove evicted blob");
            }
        }

        let evicted = victims.len() as u64;
        self.counters.entries.fetch_sub(evicted, Ordering::AcqRel);
        self.counters.bytes.fetch_sub(freed, Ordering::AcqRel);
        self.counters.evictions.fetch_add(evicted, Ordering::AcqRel);

        if remaining > cap_bytes {
            tracing::warn!(
                remaining_bytes = remaining,
                cap_bytes,
                "cache still above cap after eviction; remainder is pinned or just stored"
            );
        }
        tracing::info!(evicted, freed_bytes = freed, remaining_bytes = remaining, "cache eviction");

        Ok(EvictionReport {
            evicted,
            freed_bytes: freed,
            remaining_bytes: remaining,
        })
    }
}

struct Victim {
    index_key: Vec<u8>,
    key: ContentKey,
    stored_size: u64,
}

/// Access-index key: big-endian access time, so byte order is age order.
pub(crate) fn index_key(entry: &CacheEntry) -> Vec<u8> {
    let accessed = entry.last_accessed_ms.max(0) as u64;
    let mut raw = Vec::with_capacity(8 + entry.key.as_str().len());
    raw.extend_from_slice(&accessed.to_be_bytes());
    raw.extend_from_slice(entry.key.as_str().as_bytes());
    raw
}

fn index_key_content(raw: &[u8]) -> Result<ContentKey, StorageError> {
    let corrupt = |reason: String| StorageError::Corrupt {
        key: "<access-index>".to_string(),
        reason,
    };
    let tail = raw.get(8..).ok_or_else(|| corrupt("short index key".to_string()))?;
    let text = std::str::from_utf8(tail).map_err(|e| corrupt(e.to_string()))?;
    ContentKey::parse(text).map_err(|e| corrupt(e.to_string()))
}

fn decode_size(raw: &[u8]) -> Result<u64, StorageError> {
    let bytes: [u8; 8] = raw.try_into().map_err(|_| StorageError::Corrupt {
        key: "<access-index>".to_string(),
        reason: format!("expected 8 size bytes, got {}", raw.len()),
    })?;
    Ok(u64::from_be_bytes(bytes))
}

/// Add an unpinned entry to the access index. Pinned entries stay out.
pub(crate) fn index_entry(
    lru: &Database<Bytes, Bytes>,
    wtxn: &mut RwTxn<'_>,
    entry: &CacheEntry,
) -> Result<(), StorageError> {
    if entry.pinned {
        return Ok(());
    }
    lru.put(wtxn, &index_key(entry), &entry.stored_size.to_be_bytes())
        .map_err(txn_err)
}

fn unindex_entry(
    lru: &Database<Bytes, Bytes>,
    wtxn: &mut RwTxn<'_>,
    entry: &CacheEntry,
) -> Result<(), StorageError> {
    if !entry.pinned {
        lru.delete(wtxn, &index_key(entry)).map_err(txn_err)?;
    }
    Ok(())
}

pub(crate) fn txn_err(e: heed::Error) -> StorageError {
    StorageError::TransactionFailed {
        reason: e.to_string(),
    }
}

pub(crate) fn decode_entry(raw: &[u8]) -> Result<CacheEntry, StorageError> {
    serde_json::from_slice(raw).map_err(|e| StorageError::Corrupt {
        key: "<metadata>".to_string(),
        reason: e.to_string(),
    })
}

fn read_entry(
    db: &Database<Bytes, Bytes>,
    wtxn: &RwTxn<'_>,
    key: &ContentKey,
) -> Result<Option<CacheEntry>, StorageError> {
    match db.get(wtxn, key.as_str().as_bytes()).map_err(txn_err)? {
        Some(raw) => decode_entry(raw).map(Some),
        None => Ok(None),
    }
}

fn write_entry(
    db: &Database<Bytes, Bytes>,
    wtxn: &mut RwTxn<'_>,
    entry: &CacheEntry,
) -> Result<(), StorageError> {
    let raw = serde_json::to_vec(entry).map_err(|e| StorageError::WriteFailed {
        key: entry.key.to_string(),
        reason: e.to_string(),
    })?;
    db.put(wtxn, entry.key.as_str().as_bytes(), &raw)
        .map_err(txn_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stuck_writer_times_out() {
        // Nobody serves this receiver.
        let (tx, _rx) = mpsc::channel();
        let handle = WriterHandle::detached(tx, Duration::from_millis(20));
        let result = handle
            .request::<u64>(|reply| WriteCommand::Flush { reply: Some(reply) })
            .await;
        assert_eq!(result, Err(StorageError::WriteTimeout { waited_ms: 20 }));
    }

    #[tokio::test]
    async fn test_closed_writer_is_reported() {
        let (tx, rx) = mpsc::channel::<WriteCommand>();
        drop(rx);
        let handle = WriterHandle::detached(tx, Duration::from_millis(20));
        let result = handle
            .request::<u64>(|reply| WriteCommand::Flush { reply: Some(reply) })
            .await;
        assert_eq!(result, Err(StorageError::WriterClosed));
    }
}
