//! Liveness and version endpoints

use std::sync::atomic::Ordering;
use std::sync::Arc;

use hyper::{header, Response, StatusCode};

use crate::routes::{full_body, BoxBody};
use crate::server::AppState;

/// GET /health - liveness probe with cache counters
pub fn health_check(state: &Arc<AppState>) -> Response<BoxBody> {
    let stats = state.cache.stats();
    let body = serde_json::json!({
        "status": "ok",
        "out_bytes": state.out_bytes.load(Ordering::Relaxed),
        "cache": {
            "sd_entries": stats.sd.entries,
            "chunk_entries": stats.chunk.entries,
            "chunk_bytes": stats.chunk.total_bytes,
            "disk_blobs": state.store.len(),
            "disk_bytes": state.store.total_bytes(),
        },
    });
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(full_body(body.to_string()))
        .unwrap()
}

/// GET /version - deployment verification
pub fn version_info() -> Response<BoxBody> {
    let body = serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    });
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(full_body(body.to_string()))
        .unwrap()
}
