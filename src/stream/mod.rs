//! Streams: claim metadata plus descriptor plus a fixed byte size
//!
//! A `Stream` is the per-request view of one logical media object. It holds
//! references into the shared caches and lives only as long as the HTTP
//! request that created it.

pub mod chunk;
pub mod descriptor;
pub mod reader;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::cache::HotCache;
use crate::error::Result;
use crate::resolve::ResolvedClaim;
use descriptor::{StreamDescriptor, MAX_BLOB_SIZE, MAX_CHUNK_SIZE};

/// One resolvable, readable media stream.
pub struct Stream {
    uri: String,
    claim: ResolvedClaim,
    descriptor: Arc<StreamDescriptor>,
    size: u64,
}

impl Stream {
    /// Resolve the claim's SD blob into a descriptor and fix the stream
    /// size. Size is immutable from here on.
    pub async fn prepare(cache: &Arc<HotCache>, uri: &str, claim: ResolvedClaim) -> Result<Self> {
        let descriptor = cache.sd_blob(&claim.sd_hash).await?;
        let size = Self::determine_size(cache, &claim, &descriptor).await;
        info!(
            uri = %uri,
            size = size,
            chunks = descriptor.chunk_count(),
            content_type = %claim.content_type,
            "prepared stream"
        );
        Ok(Self {
            uri: uri.to_string(),
            claim,
            descriptor,
            size,
        })
    }

    /// Size precedence: explicit claim size, then the decrypted length of
    /// the last chunk, then the summed estimate.
    async fn determine_size(
        cache: &Arc<HotCache>,
        claim: &ResolvedClaim,
        descriptor: &Arc<StreamDescriptor>,
    ) -> u64 {
        if let Some(size) = claim.source_size {
            return size;
        }
        match Self::size_from_last_chunk(cache, descriptor).await {
            Ok(size) => size,
            Err(e) => {
                debug!(error = %e, "falling back to estimated stream size");
                Self::estimated_size(descriptor)
            }
        }
    }

    /// Exact size for legacy streams: every chunk before the last is full,
    /// so only the last chunk's plaintext length is unknown.
    async fn size_from_last_chunk(
        cache: &Arc<HotCache>,
        descriptor: &Arc<StreamDescriptor>,
    ) -> Result<u64> {
        let chunks = descriptor.chunk_count();
        if chunks == 0 {
            return Ok(0);
        }
        let info = descriptor.content_blob(chunks - 1)?;
        let hash = info.blob_hash.as_deref().ok_or_else(|| {
            crate::error::PlayerError::Internal("content blob without a hash".into())
        })?;
        let iv = info.iv_bytes()?;
        let key = descriptor.key_bytes()?;
        let last = cache.chunk(hash, &key, &iv).await?;
        Ok(MAX_CHUNK_SIZE as u64 * (chunks as u64 - 1) + last.len() as u64)
    }

    /// Heuristic estimate for streams whose last chunk cannot be examined:
    /// each full blob contributes a full chunk, each short blob its length
    /// minus one, and the final padding block is subtracted once.
    fn estimated_size(descriptor: &StreamDescriptor) -> u64 {
        let mut total = 0u64;
        for info in &descriptor.blobs[..descriptor.chunk_count()] {
            if info.length == MAX_BLOB_SIZE {
                total += MAX_CHUNK_SIZE as u64;
            } else {
                total += info.length as u64 - 1;
            }
        }
        total.saturating_sub(16)
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn claim(&self) -> &ResolvedClaim {
        &self.claim
    }

    pub fn descriptor(&self) -> &Arc<StreamDescriptor> {
        &self.descriptor
    }

    pub fn content_type(&self) -> &str {
        &self.claim.content_type
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.claim.timestamp
    }

    /// Filename for Content-Disposition: the claim's filename when present,
    /// otherwise the descriptor's suggestion, otherwise the claim name.
    pub fn file_name(&self) -> String {
        if !self.claim.file_name.is_empty() {
            return self.claim.file_name.clone();
        }
        self.descriptor
            .suggested_file_name()
            .unwrap_or_else(|| self.claim.name.clone())
    }
}
