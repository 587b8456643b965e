//! streamgate - HTTP media-delivery edge for a content-addressed blob network
//!
//! Clients request a media stream by symbolic URI; streamgate resolves the
//! URI to a stream manifest, pulls the constituent encrypted blobs from an
//! upstream reflector, decrypts them into plaintext chunks, and serves the
//! bytes with full HTTP range-request semantics.
//!
//! ## Services
//!
//! - **Reflector client**: framed-TCP origin fetches with content-hash
//!   verification
//! - **Disk store**: size-bounded directory of raw encrypted blobs, LRU
//! - **Hot cache**: in-memory LRU tiers for parsed descriptors and
//!   decrypted chunks, with single-flight fills
//! - **Stream reader**: random-access byte stream over the chunked
//!   ciphertext, with prefetch
//! - **HTTP surface**: claims/speech/api-v4 routes, range serving, and the
//!   transcoded-rendition redirect

pub mod access;
pub mod cache;
pub mod config;
pub mod error;
pub mod reflector;
pub mod resolve;
pub mod routes;
pub mod server;
pub mod store;
pub mod stream;
pub mod transcode;

pub use config::Args;
pub use error::{PlayerError, Result};
pub use server::{run, AppState};
