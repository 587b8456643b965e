//! Error types for streamgate
//!
//! One taxonomy for the whole pipeline. The HTTP layer is the only place
//! that maps these kinds to status codes; cache layers never swallow them.
//!
//! The enum is `Clone` so a single-flight result can be broadcast to every
//! coalesced waiter; non-clonable sources are wrapped in `Arc`.

use std::sync::Arc;
use thiserror::Error;

pub type Result<T, E = PlayerError> = std::result::Result<T, E>;

#[derive(Error, Debug, Clone)]
pub enum PlayerError {
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("stream requires payment")]
    PaidStream,

    #[error("invalid access token: {0}")]
    InvalidToken(String),

    #[error("expired access token")]
    ExpiredToken,

    #[error("blob not found: {0}")]
    BlobNotFound(String),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("corrupt chunk: {0}")]
    CorruptChunk(String),

    #[error("stream size is zero")]
    StreamSizeZero,

    #[error("read out of bounds")]
    OutOfBounds,

    #[error("seeking before the start of the stream")]
    SeekingBeforeStart,

    #[error("invalid stream descriptor: {0}")]
    Descriptor(String),

    #[error("upstream timeout: {0}")]
    Timeout(String),

    #[error("upstream unavailable: {0}")]
    Upstream(String),

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for PlayerError {
    fn from(e: std::io::Error) -> Self {
        PlayerError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for PlayerError {
    fn from(e: serde_json::Error) -> Self {
        PlayerError::Json(Arc::new(e))
    }
}

impl PlayerError {
    /// Whether a chunk-level failure warrants purging the cached entry and
    /// retrying the read once before giving up.
    pub fn is_retryable_corruption(&self) -> bool {
        matches!(
            self,
            PlayerError::CorruptChunk(_) | PlayerError::Decryption(_)
        )
    }
}
