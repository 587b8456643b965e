//! Hot cache for parsed descriptors and decrypted chunks
//!
//! Two in-memory LRU tiers in front of the disk store and the reflector:
//!
//! - **SD tier**: parsed stream descriptors, bounded by entry count.
//! - **Chunk tier**: decrypted plaintext chunks, bounded by aggregate
//!   bytes, keyed by `"{blob_hash}:{iv_hex}"` so repeated-content blobs
//!   that share ciphertext but differ by IV cache independently.
//!
//! Both tiers sit behind a single-flight gate: concurrent requests for the
//! same key collapse into one fetch+decode, and a failed fetch is never
//! cached. The fill itself runs detached from the requesting task, so an
//! aborted request still populates the cache for the next one.
//!
//! Chunk values are `Bytes`: shared immutable views, so eviction never
//! frees memory an in-flight read is still borrowing.

pub mod single_flight;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::{PlayerError, Result};
use crate::reflector::BlobReflector;
use crate::store::DiskBlobStore;
use crate::stream::chunk::decrypt_chunk;
use crate::stream::descriptor::StreamDescriptor;
use single_flight::{await_flight, Flight, SingleFlight};

/// Configuration for the hot cache
#[derive(Debug, Clone)]
pub struct HotCacheConfig {
    /// Aggregate plaintext bytes kept in the chunk tier
    pub chunk_max_bytes: u64,
    /// Parsed descriptors kept in the SD tier
    pub sd_max_entries: usize,
}

impl Default for HotCacheConfig {
    fn default() -> Self {
        Self {
            chunk_max_bytes: 1024 * 1024 * 1024,
            sd_max_entries: 4096,
        }
    }
}

struct SdEntry {
    descriptor: Arc<StreamDescriptor>,
    last_access: AtomicU64,
}

struct ChunkEntry {
    data: Bytes,
    last_access: AtomicU64,
}

/// Statistics for one cache tier
#[derive(Debug, Clone, Default)]
pub struct TierStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Combined statistics for both tiers
#[derive(Debug, Clone)]
pub struct HotCacheStats {
    pub sd: TierStats,
    pub chunk: TierStats,
}

fn chunk_key(hash: &str, iv: &[u8]) -> String {
    format!("{hash}:{}", hex::encode(iv))
}

/// Two-tier hot cache with single-flight fills. Cheap to share: state
/// lives behind one inner Arc so fill tasks can outlive their requester.
pub struct HotCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    config: HotCacheConfig,
    store: Arc<DiskBlobStore>,
    reflector: Arc<BlobReflector>,

    sd: DashMap<String, SdEntry>,
    sd_flight: SingleFlight<Arc<StreamDescriptor>>,
    sd_hits: AtomicU64,
    sd_misses: AtomicU64,
    sd_evictions: AtomicU64,

    chunks: DashMap<String, ChunkEntry>,
    chunk_flight: SingleFlight<Bytes>,
    chunk_total_bytes: AtomicU64,
    chunk_hits: AtomicU64,
    chunk_misses: AtomicU64,
    chunk_evictions: AtomicU64,

    clock: AtomicU64,
}

impl HotCache {
    pub fn new(
        config: HotCacheConfig,
        store: Arc<DiskBlobStore>,
        reflector: Arc<BlobReflector>,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                config,
                store,
                reflector,
                sd: DashMap::new(),
                sd_flight: SingleFlight::new(),
                sd_hits: AtomicU64::new(0),
                sd_misses: AtomicU64::new(0),
                sd_evictions: AtomicU64::new(0),
                chunks: DashMap::new(),
                chunk_flight: SingleFlight::new(),
                chunk_total_bytes: AtomicU64::new(0),
                chunk_hits: AtomicU64::new(0),
                chunk_misses: AtomicU64::new(0),
                chunk_evictions: AtomicU64::new(0),
                clock: AtomicU64::new(0),
            }),
        }
    }

    /// Fetch and parse a stream descriptor, serving from the hot tier when
    /// possible.
    pub async fn sd_blob(&self, hash: &str) -> Result<Arc<StreamDescriptor>> {
        let inner = &self.inner;
        if let Some(entry) = inner.sd.get(hash) {
            entry.last_access.store(inner.tick(), Ordering::Relaxed);
            inner.sd_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(entry.descriptor.clone());
        }
        inner.sd_misses.fetch_add(1, Ordering::Relaxed);

        match inner.sd_flight.join(hash).await {
            Flight::Waiter(rx) => await_flight(rx).await,
            Flight::Leader(tx) => {
                let rx = tx.subscribe();
                let inner = Arc::clone(inner);
                let hash = hash.to_string();
                tokio::spawn(async move {
                    let result = inner.fill_sd(&hash).await;
                    inner.sd_flight.complete(&hash, result).await;
                });
                await_flight(rx).await
            }
        }
    }

    /// Fetch a decrypted chunk, filling through disk and reflector on miss.
    pub async fn chunk(&self, hash: &str, key: &[u8], iv: &[u8]) -> Result<Bytes> {
        let inner = &self.inner;
        let cache_key = chunk_key(hash, iv);

        if let Some(entry) = inner.chunks.get(&cache_key) {
            entry.last_access.store(inner.tick(), Ordering::Relaxed);
            inner.chunk_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(entry.data.clone());
        }
        inner.chunk_misses.fetch_add(1, Ordering::Relaxed);

        match inner.chunk_flight.join(&cache_key).await {
            Flight::Waiter(rx) => await_flight(rx).await,
            Flight::Leader(tx) => {
                let rx = tx.subscribe();
                let inner = Arc::clone(inner);
                let hash = hash.to_string();
                let key = key.to_vec();
                let iv = iv.to_vec();
                tokio::spawn(async move {
                    let result = inner.fill_chunk(&cache_key, &hash, &key, &iv).await;
                    inner.chunk_flight.complete(&cache_key, result).await;
                });
                await_flight(rx).await
            }
        }
    }

    /// Whether the plaintext for `(hash, iv)` is already hot.
    pub fn is_chunk_cached(&self, hash: &str, iv: &[u8]) -> bool {
        self.inner.chunks.contains_key(&chunk_key(hash, iv))
    }

    /// Remove a chunk from the hot tier (every IV variant) and from the
    /// disk store underneath.
    pub async fn clear_chunk(&self, hash: &str) {
        self.inner.clear_chunk(hash).await;
    }

    pub fn stats(&self) -> HotCacheStats {
        let inner = &self.inner;
        HotCacheStats {
            sd: TierStats {
                entries: inner.sd.len(),
                total_bytes: 0,
                hits: inner.sd_hits.load(Ordering::Relaxed),
                misses: inner.sd_misses.load(Ordering::Relaxed),
                evictions: inner.sd_evictions.load(Ordering::Relaxed),
            },
            chunk: TierStats {
                entries: inner.chunks.len(),
                total_bytes: inner.chunk_total_bytes.load(Ordering::Relaxed),
                hits: inner.chunk_hits.load(Ordering::Relaxed),
                misses: inner.chunk_misses.load(Ordering::Relaxed),
                evictions: inner.chunk_evictions.load(Ordering::Relaxed),
            },
        }
    }
}

impl CacheInner {
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Raw blob bytes from the disk tier, falling through to the origin
    /// with a write-through on success.
    async fn raw_blob(&self, hash: &str) -> Result<Bytes> {
        match self.store.get(hash).await {
            Ok(bytes) => Ok(bytes),
            Err(PlayerError::BlobNotFound(_)) => {
                let bytes = self.reflector.fetch(hash).await?;
                self.store.put(hash, &bytes).await?;
                Ok(bytes)
            }
            Err(e) => Err(e),
        }
    }

    async fn fill_sd(&self, hash: &str) -> Result<Arc<StreamDescriptor>> {
        let raw = self.raw_blob(hash).await?;
        let descriptor = Arc::new(StreamDescriptor::from_json(&raw)?);
        self.insert_sd(hash, descriptor.clone());
        debug!(hash = %hash, chunks = descriptor.chunk_count(), "cached stream descriptor");
        Ok(descriptor)
    }

    fn insert_sd(&self, hash: &str, descriptor: Arc<StreamDescriptor>) {
        while self.sd.len() >= self.config.sd_max_entries {
            let oldest = self
                .sd
                .iter()
                .min_by_key(|e| e.value().last_access.load(Ordering::Relaxed))
                .map(|e| e.key().clone());
            match oldest {
                Some(key) => {
                    if self.sd.remove(&key).is_some() {
                        self.sd_evictions.fetch_add(1, Ordering::Relaxed);
                    }
                }
                None => break,
            }
        }
        self.sd.insert(
            hash.to_string(),
            SdEntry {
                descriptor,
                last_access: AtomicU64::new(self.tick()),
            },
        );
    }

    async fn fill_chunk(
        &self,
        cache_key: &str,
        hash: &str,
        key: &[u8],
        iv: &[u8],
    ) -> Result<Bytes> {
        let raw = self.raw_blob(hash).await?;

        let plaintext = match decrypt_chunk(key, iv, &raw) {
            Ok(p) => p,
            Err(e) => {
                warn!(hash = %hash, error = %e, "purging undecryptable blob");
                self.clear_chunk(hash).await;
                return Err(e);
            }
        };
        if plaintext.is_empty() {
            warn!(hash = %hash, "blob decrypted to an empty chunk, purging");
            self.clear_chunk(hash).await;
            return Err(PlayerError::CorruptChunk(format!(
                "blob {hash} decrypted to an empty chunk"
            )));
        }

        self.insert_chunk(cache_key, plaintext.clone());
        Ok(plaintext)
    }

    fn insert_chunk(&self, cache_key: &str, data: Bytes) {
        let size = data.len() as u64;
        self.evict_chunks_until_fits(size);

        if let Some((_, old)) = self.chunks.remove(cache_key) {
            self.chunk_total_bytes
                .fetch_sub(old.data.len() as u64, Ordering::Relaxed);
        }
        self.chunks.insert(
            cache_key.to_string(),
            ChunkEntry {
                data,
                last_access: AtomicU64::new(self.tick()),
            },
        );
        self.chunk_total_bytes.fetch_add(size, Ordering::Relaxed);
    }

    fn evict_chunks_until_fits(&self, new_size: u64) {
        let current = self.chunk_total_bytes.load(Ordering::Relaxed);
        if current + new_size <= self.config.chunk_max_bytes {
            return;
        }
        let to_free = (current + new_size).saturating_sub(self.config.chunk_max_bytes);

        let mut entries: Vec<(String, u64, u64)> = self
            .chunks
            .iter()
            .map(|e| {
                (
                    e.key().clone(),
                    e.value().last_access.load(Ordering::Relaxed),
                    e.value().data.len() as u64,
                )
            })
            .collect();
        entries.sort_by_key(|(_, last_access, _)| *last_access);

        let mut freed = 0u64;
        for (key, _, size) in entries {
            if freed >= to_free {
                break;
            }
            if self.chunks.remove(&key).is_some() {
                self.chunk_total_bytes.fetch_sub(size, Ordering::Relaxed);
                self.chunk_evictions.fetch_add(1, Ordering::Relaxed);
                freed += size;
            }
        }
        debug!(freed = freed, "evicted chunks to make space");
    }

    async fn clear_chunk(&self, hash: &str) {
        let prefix = format!("{hash}:");
        let keys: Vec<String> = self
            .chunks
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            if let Some((_, entry)) = self.chunks.remove(&key) {
                self.chunk_total_bytes
                    .fetch_sub(entry.data.len() as u64, Ordering::Relaxed);
            }
        }
        let _ = self.store.delete(hash).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::chunk::encrypt_chunk;
    use crate::stream::descriptor::blob_hash_hex;
    use std::time::Duration;
    use tempfile::TempDir;

    const KEY: [u8; 32] = [1u8; 32];
    const IV: [u8; 16] = [2u8; 16];

    async fn cache_over(dir: &TempDir, chunk_max_bytes: u64) -> (Arc<HotCache>, Arc<DiskBlobStore>) {
        let store = Arc::new(DiskBlobStore::open(dir.path(), 1 << 30).await.unwrap());
        // port 1 never answers, so these tests only exercise disk fills
        let reflector = Arc::new(BlobReflector::new("127.0.0.1:1", Duration::from_millis(200)));
        let cache = Arc::new(HotCache::new(
            HotCacheConfig {
                chunk_max_bytes,
                sd_max_entries: 2,
            },
            Arc::clone(&store),
            reflector,
        ));
        (cache, store)
    }

    async fn seed_chunk(store: &DiskBlobStore, plaintext: &[u8], iv: &[u8; 16]) -> String {
        let ciphertext = encrypt_chunk(&KEY, iv, plaintext);
        let hash = blob_hash_hex(&ciphertext);
        store.put(&hash, &ciphertext).await.unwrap();
        hash
    }

    #[tokio::test]
    async fn fills_a_chunk_from_disk_then_serves_hot() {
        let dir = TempDir::new().unwrap();
        let (cache, store) = cache_over(&dir, 1 << 20).await;
        let hash = seed_chunk(&store, b"plaintext chunk", &IV).await;

        let first = cache.chunk(&hash, &KEY, &IV).await.unwrap();
        assert_eq!(&first[..], b"plaintext chunk");

        let second = cache.chunk(&hash, &KEY, &IV).await.unwrap();
        assert_eq!(first, second);

        let stats = cache.stats();
        assert_eq!(stats.chunk.hits, 1);
        assert_eq!(stats.chunk.misses, 1);
    }

    #[tokio::test]
    async fn eviction_is_lru_and_respects_the_byte_cap() {
        let dir = TempDir::new().unwrap();
        // room for roughly two of the three chunks below
        let (cache, store) = cache_over(&dir, 220).await;

        let ivs = [[10u8; 16], [11u8; 16], [12u8; 16]];
        let mut hashes = Vec::new();
        for iv in &ivs {
            hashes.push(seed_chunk(&store, &[0x42u8; 100], iv).await);
        }

        cache.chunk(&hashes[0], &KEY, &ivs[0]).await.unwrap();
        cache.chunk(&hashes[1], &KEY, &ivs[1]).await.unwrap();
        // freshen the first so the second is the LRU victim
        cache.chunk(&hashes[0], &KEY, &ivs[0]).await.unwrap();
        cache.chunk(&hashes[2], &KEY, &ivs[2]).await.unwrap();

        assert!(cache.stats().chunk.total_bytes <= 220);
        assert!(cache.is_chunk_cached(&hashes[0], &ivs[0]));
        assert!(!cache.is_chunk_cached(&hashes[1], &ivs[1]));
        assert!(cache.is_chunk_cached(&hashes[2], &ivs[2]));
    }

    #[tokio::test]
    async fn undecryptable_blob_is_purged_from_both_tiers() {
        let dir = TempDir::new().unwrap();
        let (cache, store) = cache_over(&dir, 1 << 20).await;

        // well-formed frame, garbage content: padding check must fail
        let garbage = vec![0xA5u8; 160];
        let hash = blob_hash_hex(&garbage);
        store.put(&hash, &garbage).await.unwrap();

        assert!(matches!(
            cache.chunk(&hash, &KEY, &IV).await,
            Err(PlayerError::Decryption(_))
        ));
        assert!(!store.has(&hash), "purge must reach the disk tier");
        assert!(!cache.is_chunk_cached(&hash, &IV));
    }

    #[tokio::test]
    async fn empty_plaintext_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let (cache, store) = cache_over(&dir, 1 << 20).await;
        let hash = seed_chunk(&store, b"", &IV).await;

        assert!(matches!(
            cache.chunk(&hash, &KEY, &IV).await,
            Err(PlayerError::CorruptChunk(_))
        ));
        assert!(!store.has(&hash));
    }

    #[tokio::test]
    async fn clear_chunk_removes_every_iv_variant() {
        let dir = TempDir::new().unwrap();
        let (cache, store) = cache_over(&dir, 1 << 20).await;
        let hash = seed_chunk(&store, b"shared ciphertext", &IV).await;

        cache.chunk(&hash, &KEY, &IV).await.unwrap();
        assert!(cache.is_chunk_cached(&hash, &IV));

        cache.clear_chunk(&hash).await;
        assert!(!cache.is_chunk_cached(&hash, &IV));
        assert!(!store.has(&hash));
        assert_eq!(cache.stats().chunk.total_bytes, 0);
    }

    #[tokio::test]
    async fn sd_tier_parses_and_bounds_entries() {
        let dir = TempDir::new().unwrap();
        let (cache, store) = cache_over(&dir, 1 << 20).await;

        let mut hashes = Vec::new();
        for i in 0u8..3 {
            let sd = serde_json::json!({
                "stream_name": hex::encode([i]),
                "key": hex::encode([0u8; 32]),
                "stream_type": "lbryfile",
                "blobs": [{ "blob_num": 0, "iv": hex::encode([0u8; 16]), "length": 0 }],
            });
            let raw = serde_json::to_vec(&sd).unwrap();
            let hash = blob_hash_hex(&raw);
            store.put(&hash, &raw).await.unwrap();
            hashes.push(hash);
        }

        for hash in &hashes {
            let descriptor = cache.sd_blob(hash).await.unwrap();
            assert_eq!(descriptor.chunk_count(), 0);
        }

        // sd_max_entries is 2, so the first descriptor was evicted
        let stats = cache.stats();
        assert_eq!(stats.sd.entries, 2);
        assert_eq!(stats.sd.evictions, 1);
    }
}
