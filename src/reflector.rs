//! Origin blob client
//!
//! Fetches blobs by hash from an upstream reflector over its framed TCP
//! protocol: a u32 big-endian length prefix followed by the payload, in
//! both directions. The request payload is the hash string; the response
//! payload is the blob bytes, with a zero-length frame meaning the
//! reflector has no such blob.
//!
//! Every fetched blob is re-hashed before it is handed to the caller;
//! content that does not hash to the requested key never leaves this
//! module. Transient network errors are not retried here.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{PlayerError, Result};
use crate::stream::descriptor::{blob_hash_hex, MAX_BLOB_SIZE};

/// Client for a single configured reflector.
#[derive(Debug, Clone)]
pub struct BlobReflector {
    address: String,
    timeout: Duration,
}

impl BlobReflector {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Fetch a blob by hash, verifying its content address.
    ///
    /// The whole exchange runs under one deadline so a hung reflector
    /// cannot stall the caller.
    pub async fn fetch(&self, hash: &str) -> Result<Bytes> {
        match tokio::time::timeout(self.timeout, self.fetch_inner(hash)).await {
            Ok(result) => result,
            Err(_) => Err(PlayerError::Timeout(format!(
                "fetching {hash} from {}",
                self.address
            ))),
        }
    }

    async fn fetch_inner(&self, hash: &str) -> Result<Bytes> {
        let mut stream = TcpStream::connect(&self.address).await.map_err(|e| {
            PlayerError::Upstream(format!("connect to {}: {e}", self.address))
        })?;

        stream
            .write_u32(hash.len() as u32)
            .await
            .map_err(|e| PlayerError::Upstream(format!("send request: {e}")))?;
        stream
            .write_all(hash.as_bytes())
            .await
            .map_err(|e| PlayerError::Upstream(format!("send request: {e}")))?;
        stream
            .flush()
            .await
            .map_err(|e| PlayerError::Upstream(format!("send request: {e}")))?;

        let len = stream
            .read_u32()
            .await
            .map_err(|e| PlayerError::Upstream(format!("read response header: {e}")))?
            as usize;

        if len == 0 {
            return Err(PlayerError::BlobNotFound(hash.to_string()));
        }
        if len > MAX_BLOB_SIZE {
            return Err(PlayerError::Upstream(format!(
                "oversized blob frame: {len} bytes"
            )));
        }

        let mut payload = vec![0u8; len];
        stream
            .read_exact(&mut payload)
            .await
            .map_err(|e| PlayerError::Upstream(format!("read response body: {e}")))?;

        let actual = blob_hash_hex(&payload);
        if actual != hash {
            return Err(PlayerError::HashMismatch {
                expected: hash.to_string(),
                actual,
            });
        }

        debug!(hash = %hash, size = len, "fetched blob from reflector");
        Ok(Bytes::from(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn frame_server(payload_for_any_request: Vec<u8>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let payload = payload_for_any_request.clone();
                tokio::spawn(async move {
                    let len = sock.read_u32().await.unwrap() as usize;
                    let mut hash = vec![0u8; len];
                    sock.read_exact(&mut hash).await.unwrap();
                    sock.write_u32(payload.len() as u32).await.unwrap();
                    sock.write_all(&payload).await.unwrap();
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn fetches_and_verifies_a_blob() {
        let blob = b"some blob bytes".to_vec();
        let hash = blob_hash_hex(&blob);
        let addr = frame_server(blob.clone()).await;

        let reflector = BlobReflector::new(addr.to_string(), Duration::from_secs(2));
        let fetched = reflector.fetch(&hash).await.unwrap();
        assert_eq!(&fetched[..], &blob[..]);
    }

    #[tokio::test]
    async fn rejects_content_with_wrong_hash() {
        let addr = frame_server(b"not what you asked for".to_vec()).await;
        let reflector = BlobReflector::new(addr.to_string(), Duration::from_secs(2));

        let wanted = blob_hash_hex(b"the real content");
        match reflector.fetch(&wanted).await {
            Err(PlayerError::HashMismatch { expected, .. }) => assert_eq!(expected, wanted),
            other => panic!("expected hash mismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_frame_means_not_found() {
        let addr = frame_server(Vec::new()).await;
        let reflector = BlobReflector::new(addr.to_string(), Duration::from_secs(2));
        assert!(matches!(
            reflector.fetch(&blob_hash_hex(b"missing")).await,
            Err(PlayerError::BlobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_reflector_is_upstream_error() {
        let reflector = BlobReflector::new("127.0.0.1:1", Duration::from_secs(2));
        assert!(matches!(
            reflector.fetch(&blob_hash_hex(b"x")).await,
            Err(PlayerError::Upstream(_))
        ));
    }
}
