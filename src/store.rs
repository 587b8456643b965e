//! On-disk blob store
//!
//! Raw encrypted blobs persisted in a single directory, filename = hash.
//! The filesystem is the index: there is no WAL and no manifest. LRU
//! bookkeeping lives in memory and is rebuilt on startup from a directory
//! scan, seeding recency from file mtimes.
//!
//! Writes are atomic (temp file + rename). A background sweep evicts the
//! oldest-accessed entries whenever the total size exceeds the cap; entries
//! with a live retention count are never deleted mid-read.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::fs;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::{PlayerError, Result};
use crate::stream::descriptor::is_valid_blob_hash;

struct DiskEntry {
    size: u64,
    last_access: AtomicU64,
    retained: AtomicU32,
}

/// Size-bounded directory of blobs with in-memory LRU metadata.
pub struct DiskBlobStore {
    dir: PathBuf,
    max_bytes: u64,
    entries: DashMap<String, DiskEntry>,
    total_bytes: AtomicU64,
    clock: AtomicU64,
    sweep_kick: Notify,
}

impl DiskBlobStore {
    /// Open a store, creating the directory if needed and rebuilding the
    /// LRU index from what is already on disk.
    pub async fn open(dir: impl AsRef<Path>, max_bytes: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;

        let mut found: Vec<(String, u64, std::time::SystemTime)> = Vec::new();
        let mut scan = fs::read_dir(&dir).await?;
        while let Some(entry) = scan.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_valid_blob_hash(&name) {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let mtime = meta.modified().unwrap_or(std::time::UNIX_EPOCH);
            found.push((name, meta.len(), mtime));
        }
        found.sort_by_key(|(_, _, mtime)| *mtime);

        let entries = DashMap::new();
        let mut total = 0u64;
        for (tick, (name, size, _)) in found.iter().enumerate() {
            entries.insert(
                name.clone(),
                DiskEntry {
                    size: *size,
                    last_access: AtomicU64::new(tick as u64 + 1),
                    retained: AtomicU32::new(0),
                },
            );
            total += size;
        }

        info!(
            path = %dir.display(),
            blobs = found.len(),
            bytes = total,
            max_bytes = max_bytes,
            "opened disk blob store"
        );

        Ok(Self {
            dir,
            max_bytes,
            entries,
            total_bytes: AtomicU64::new(total),
            clock: AtomicU64::new(found.len() as u64 + 1),
            sweep_kick: Notify::new(),
        })
    }

    fn blob_path(&self, hash: &str) -> PathBuf {
        self.dir.join(hash)
    }

    fn touch(&self, hash: &str) {
        if let Some(entry) = self.entries.get(hash) {
            let tick = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
            entry.last_access.store(tick, Ordering::Relaxed);
        }
    }

    /// Mark an entry in use so the sweep will not delete it. Returns false
    /// when the hash is not in the store.
    fn retain(&self, hash: &str) -> bool {
        match self.entries.get(hash) {
            Some(entry) => {
                entry.retained.fetch_add(1, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    fn release(&self, hash: &str) {
        if let Some(entry) = self.entries.get(hash) {
            entry.retained.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Drop an entry from the index without touching the file (used when
    /// the file turned out to be gone).
    fn forget(&self, hash: &str) {
        if let Some((_, entry)) = self.entries.remove(hash) {
            self.total_bytes.fetch_sub(entry.size, Ordering::Relaxed);
        }
    }

    /// Read a blob, bumping its LRU position.
    pub async fn get(&self, hash: &str) -> Result<Bytes> {
        if !self.retain(hash) {
            return Err(PlayerError::BlobNotFound(hash.to_string()));
        }
        let read = fs::read(self.blob_path(hash)).await;
        self.release(hash);

        match read {
            Ok(data) => {
                self.touch(hash);
                Ok(Bytes::from(data))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(hash = %hash, "indexed blob missing on disk");
                self.forget(hash);
                Err(PlayerError::BlobNotFound(hash.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persist a blob. Content is immutable per hash, so a second put of
    /// the same hash only refreshes its LRU position.
    pub async fn put(&self, hash: &str, data: &[u8]) -> Result<()> {
        if self.entries.contains_key(hash) {
            self.touch(hash);
            return Ok(());
        }

        let tmp = self.dir.join(format!("{hash}.tmp"));
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, self.blob_path(hash)).await?;

        let tick = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        let size = data.len() as u64;
        if self
            .entries
            .insert(
                hash.to_string(),
                DiskEntry {
                    size,
                    last_access: AtomicU64::new(tick),
                    retained: AtomicU32::new(0),
                },
            )
            .is_none()
        {
            self.total_bytes.fetch_add(size, Ordering::Relaxed);
        }
        debug!(hash = %hash, size = size, "stored blob");

        if self.total_bytes.load(Ordering::Relaxed) > self.max_bytes {
            self.sweep_kick.notify_one();
        }
        Ok(())
    }

    pub fn has(&self, hash: &str) -> bool {
        self.entries.contains_key(hash)
    }

    /// Best-effort delete: a missing file never fails the caller.
    pub async fn delete(&self, hash: &str) -> Result<()> {
        self.forget(hash);
        let _ = fs::remove_file(self.blob_path(hash)).await;
        Ok(())
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evict oldest-accessed, unretained entries until the total size fits
    /// under the cap.
    pub async fn sweep(&self) {
        if self.total_bytes.load(Ordering::Relaxed) <= self.max_bytes {
            return;
        }

        let mut candidates: Vec<(String, u64, u64)> = self
            .entries
            .iter()
            .map(|e| {
                (
                    e.key().clone(),
                    e.value().last_access.load(Ordering::Relaxed),
                    e.value().size,
                )
            })
            .collect();
        candidates.sort_by_key(|(_, last_access, _)| *last_access);

        let mut evicted = 0usize;
        let mut freed = 0u64;
        for (hash, _, size) in candidates {
            if self.total_bytes.load(Ordering::Relaxed) <= self.max_bytes {
                break;
            }
            let removed = self
                .entries
                .remove_if(&hash, |_, entry| entry.retained.load(Ordering::SeqCst) == 0)
                .is_some();
            if removed {
                self.total_bytes.fetch_sub(size, Ordering::Relaxed);
                let _ = fs::remove_file(self.blob_path(&hash)).await;
                evicted += 1;
                freed += size;
            }
        }

        if evicted > 0 {
            debug!(evicted = evicted, freed = freed, "swept disk blob cache");
        }
    }
}

/// Spawn the low-priority maintenance task: sweeps on an interval, and
/// immediately when a put pushes the store over its cap.
pub fn spawn_sweep_task(store: Arc<DiskBlobStore>, interval: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = store.sweep_kick.notified() => {}
            }
            store.sweep().await;
        }
    });
}
