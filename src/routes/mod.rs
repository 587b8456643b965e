//! HTTP route handlers

pub mod health;
pub mod streams;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};

/// Response body type shared by every route: boxed so small `Full` bodies
/// and chunked stream bodies go through the same plumbing.
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, std::io::Error>;

pub(crate) fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub(crate) fn empty_body() -> BoxBody {
    full_body(Bytes::new())
}
