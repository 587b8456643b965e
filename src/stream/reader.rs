//! Random-access byte stream over a chunked, encrypted stream
//!
//! One reader serves exactly one HTTP response. Reads map byte ranges onto
//! chunk indices, pull plaintext through the hot cache, and stitch the
//! slices into the caller's buffer. Each successful foreground fetch kicks
//! a bounded prefetch of the chunks ahead; prefetch tasks observe a
//! cancellation flag raised when the reader is dropped and never affect
//! the foreground read.

use std::collections::HashSet;
use std::io::SeekFrom;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cache::HotCache;
use crate::error::{PlayerError, Result};
use crate::stream::chunk::ReadableChunk;
use crate::stream::descriptor::MAX_CHUNK_SIZE;
use crate::stream::Stream;

/// Prefetch behavior for one reader
#[derive(Debug, Clone, Copy)]
pub struct PrefetchConfig {
    pub enabled: bool,
    pub window: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: 5,
        }
    }
}

/// The chunk window covered by a read of `len` bytes at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRange {
    pub first_chunk: u64,
    pub last_chunk: u64,
    pub first_chunk_offset: u64,
    pub last_chunk_read_len: u64,
}

impl StreamRange {
    /// Requires `len > 0`.
    pub fn compute(offset: u64, len: u64) -> Self {
        let chunk = MAX_CHUNK_SIZE as u64;
        let first_chunk = offset / chunk;
        let last_chunk = (offset + len - 1) / chunk;
        Self {
            first_chunk,
            last_chunk,
            first_chunk_offset: offset % chunk,
            last_chunk_read_len: (offset + len) - last_chunk * chunk,
        }
    }
}

enum Attempt {
    Done(usize),
    Corrupt { index: usize, hash: String },
}

/// Sequentially-seekable, randomly-readable view of one stream.
pub struct StreamReader {
    stream: Arc<Stream>,
    cache: Arc<HotCache>,
    prefetch: PrefetchConfig,
    offset: u64,
    scheduled: HashSet<usize>,
    out_bytes: Arc<AtomicU64>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl StreamReader {
    pub fn new(
        stream: Arc<Stream>,
        cache: Arc<HotCache>,
        prefetch: PrefetchConfig,
        out_bytes: Arc<AtomicU64>,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            stream,
            cache,
            prefetch,
            offset: 0,
            scheduled: HashSet::new(),
            out_bytes,
            cancel_tx,
            cancel_rx,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.stream.size()
    }

    /// Move the read position.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let size = self.stream.size();
        if size == 0 {
            return Err(PlayerError::StreamSizeZero);
        }

        let resolved: i64 = match pos {
            SeekFrom::Start(n) => {
                if n > size {
                    return Err(PlayerError::OutOfBounds);
                }
                n as i64
            }
            SeekFrom::Current(d) => {
                if d.unsigned_abs() > size {
                    return Err(PlayerError::OutOfBounds);
                }
                self.offset as i64 + d
            }
            SeekFrom::End(d) => {
                if d.unsigned_abs() > size {
                    return Err(PlayerError::OutOfBounds);
                }
                size as i64 + d
            }
        };

        if resolved < 0 {
            return Err(PlayerError::SeekingBeforeStart);
        }
        self.offset = resolved as u64;
        Ok(self.offset)
    }

    /// Read up to `dest.len()` bytes at the current offset. Returns 0 at
    /// end of stream. A chunk that comes back empty or undecryptable is
    /// purged from both cache tiers and the read retried once.
    pub async fn read(&mut self, dest: &mut [u8]) -> Result<usize> {
        let size = self.stream.size();
        if dest.is_empty() || self.offset >= size {
            return Ok(0);
        }
        let want = dest.len().min((size - self.offset) as usize);

        for attempt in 0..2 {
            match self.read_attempt(&mut dest[..want]).await? {
                Attempt::Done(n) => {
                    self.offset += n as u64;
                    self.out_bytes.fetch_add(n as u64, Ordering::Relaxed);
                    return Ok(n);
                }
                Attempt::Corrupt { index, hash } => {
                    if attempt == 0 {
                        warn!(
                            chunk = index,
                            hash = %hash,
                            "suspect chunk, purging both cache tiers and retrying"
                        );
                        self.cache.clear_chunk(&hash).await;
                        continue;
                    }
                    return Err(PlayerError::CorruptChunk(format!(
                        "chunk {index} still unreadable after purge"
                    )));
                }
            }
        }
        unreachable!("read retries are bounded")
    }

    async fn read_attempt(&mut self, dest: &mut [u8]) -> Result<Attempt> {
        let range = StreamRange::compute(self.offset, dest.len() as u64);
        let mut written = 0usize;

        for index in range.first_chunk..=range.last_chunk {
            let index = index as usize;
            let chunk = match self.fetch_chunk(index).await {
                Ok(chunk) => chunk,
                Err(e) if e.is_retryable_corruption() => {
                    return Ok(Attempt::Corrupt {
                        index,
                        hash: self.chunk_hash(index)?,
                    });
                }
                Err(e) => return Err(e),
            };
            if chunk.is_empty() {
                return Ok(Attempt::Corrupt {
                    index,
                    hash: self.chunk_hash(index)?,
                });
            }

            let offset_in_chunk = if index as u64 == range.first_chunk {
                range.first_chunk_offset as usize
            } else {
                0
            };
            let n = chunk.read(offset_in_chunk, dest.len() - written, &mut dest[written..])?;
            written += n;

            if written == dest.len() {
                break;
            }
            // a short chunk before the last one means the stream ends
            // earlier than its size suggested
            if offset_in_chunk + n == chunk.len() && chunk.len() < MAX_CHUNK_SIZE {
                break;
            }
        }

        Ok(Attempt::Done(written))
    }

    async fn fetch_chunk(&mut self, index: usize) -> Result<ReadableChunk> {
        let descriptor = Arc::clone(self.stream.descriptor());
        let info = descriptor.content_blob(index)?;
        let hash = self.chunk_hash(index)?;
        let iv = info.iv_bytes()?;
        let key = descriptor.key_bytes()?;

        let data = self.cache.chunk(&hash, &key, &iv).await?;
        self.schedule_prefetch(index + 1);
        Ok(ReadableChunk::new(data))
    }

    fn chunk_hash(&self, index: usize) -> Result<String> {
        self.stream
            .descriptor()
            .content_blob(index)?
            .blob_hash
            .clone()
            .ok_or_else(|| PlayerError::Internal(format!("content blob {index} has no hash")))
    }

    /// Launch one background task walking the prefetch window starting at
    /// `next`, unless that index was already scheduled by this reader.
    fn schedule_prefetch(&mut self, next: usize) {
        if !self.prefetch.enabled || self.prefetch.window == 0 {
            return;
        }
        let total = self.stream.descriptor().chunk_count();
        if next >= total || self.scheduled.contains(&next) {
            return;
        }
        let end = (next + self.prefetch.window).min(total);
        for index in next..end {
            self.scheduled.insert(index);
        }

        let cache = Arc::clone(&self.cache);
        let descriptor = Arc::clone(self.stream.descriptor());
        let cancel = self.cancel_rx.clone();
        tokio::spawn(async move {
            let Ok(key) = descriptor.key_bytes() else {
                return;
            };
            for index in next..end {
                if *cancel.borrow() {
                    break;
                }
                let Ok(info) = descriptor.content_blob(index) else {
                    break;
                };
                let Some(hash) = info.blob_hash.clone() else {
                    break;
                };
                let Ok(iv) = info.iv_bytes() else {
                    break;
                };
                if cache.is_chunk_cached(&hash, &iv) {
                    continue;
                }
                debug!(index = index, hash = %hash, "prefetching chunk");
                if let Err(e) = cache.chunk(&hash, &key, &iv).await {
                    debug!(index = index, error = %e, "prefetch stopped");
                    break;
                }
            }
        });
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        let _ = self.cancel_tx.send(true);
    }
}
