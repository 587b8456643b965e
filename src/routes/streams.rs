//! Stream-serving routes with HTTP 206 Range request support
//!
//! Three surfaces resolve to the same pipeline:
//! - `GET|HEAD /claims/{name}/{id}[/{token}]` - URI is `name#id`
//! - `GET|HEAD /speech/{rest}` - trailing extension stripped
//! - `GET|HEAD /api/v4/streams/free/{name}/{id}[/{token}]` - additionally
//!   consults the transcoder registry and redirects to an HLS rendition
//!   with `308 Permanent Redirect` when one exists
//!
//! This module is the single policy point mapping error kinds to status
//! codes; everything below it only produces `PlayerError` kinds.

use std::io::SeekFrom;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::{header, Method, Request, Response, StatusCode};
use tracing::{debug, error, info, warn};

use crate::error::{PlayerError, Result};
use crate::routes::{empty_body, full_body, BoxBody};
use crate::server::AppState;
use crate::stream::reader::{PrefetchConfig, StreamReader};
use crate::stream::Stream;

/// Read granularity when feeding a response body
const STREAM_BUF_SIZE: usize = 256 * 1024;

// ============================================================================
// Entry points
// ============================================================================

/// GET|HEAD /claims/{name}/{id}[/{token}]
pub async fn handle_claims(
    state: &Arc<AppState>,
    req: &Request<Incoming>,
) -> Result<Response<BoxBody>> {
    let rest = req.uri().path().strip_prefix("/claims/").unwrap_or("");
    let (name, claim_id, token) = split_claim_path(rest)
        .ok_or_else(|| PlayerError::StreamNotFound(req.uri().path().to_string()))?;
    let uri = format!("{name}#{claim_id}");
    serve_stream(state, req, &uri, token.as_deref(), false).await
}

/// GET|HEAD /speech/{rest}
pub async fn handle_speech(
    state: &Arc<AppState>,
    req: &Request<Incoming>,
) -> Result<Response<BoxBody>> {
    let rest = req.uri().path().strip_prefix("/speech/").unwrap_or("");
    let uri = speech_uri(rest)
        .ok_or_else(|| PlayerError::StreamNotFound(req.uri().path().to_string()))?;
    serve_stream(state, req, &uri, None, false).await
}

/// GET|HEAD /api/v4/streams/free/{name}/{id}[/{token}]
pub async fn handle_api_streams(
    state: &Arc<AppState>,
    req: &Request<Incoming>,
) -> Result<Response<BoxBody>> {
    let rest = req
        .uri()
        .path()
        .strip_prefix("/api/v4/streams/free/")
        .unwrap_or("");
    let (name, claim_id, token) = split_claim_path(rest)
        .ok_or_else(|| PlayerError::StreamNotFound(req.uri().path().to_string()))?;
    let uri = format!("{name}#{claim_id}");
    serve_stream(state, req, &uri, token.as_deref(), true).await
}

// ============================================================================
// Path parsing
// ============================================================================

fn split_claim_path(rest: &str) -> Option<(String, String, Option<String>)> {
    let mut parts = rest.trim_matches('/').split('/');
    let name = parts.next().filter(|s| !s.is_empty())?;
    let claim_id = parts.next().filter(|s| !s.is_empty())?;
    let token = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
    if parts.next().is_some() {
        return None;
    }
    let name = urlencoding::decode(name).ok()?.into_owned();
    Some((name, claim_id.to_string(), token))
}

/// Strip the trailing extension from a speech path; an empty residue is no
/// stream at all.
fn speech_uri(rest: &str) -> Option<String> {
    let trimmed = rest.trim_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let decoded = urlencoding::decode(trimmed).ok()?.into_owned();
    let residue = match decoded.rfind('.') {
        Some(dot) if dot > decoded.rfind('/').map_or(0, |s| s + 1) => &decoded[..dot],
        Some(_) if !decoded.contains('/') && decoded.starts_with('.') => "",
        _ => decoded.as_str(),
    };
    (!residue.is_empty()).then(|| residue.to_string())
}

// ============================================================================
// Serving
// ============================================================================

async fn serve_stream(
    state: &Arc<AppState>,
    req: &Request<Incoming>,
    uri: &str,
    token: Option<&str>,
    consult_transcoder: bool,
) -> Result<Response<BoxBody>> {
    let claim = state.resolver.resolve(uri).await?;

    match (token, &state.token_verifier) {
        (Some(token), Some(verifier)) => verifier.verify(token, &claim.claim_id)?,
        (Some(_), None) => {
            return Err(PlayerError::InvalidToken(
                "token verification is not configured".into(),
            ))
        }
        (None, _) => {
            if claim.is_paid {
                return Err(PlayerError::PaidStream);
            }
        }
    }

    if consult_transcoder {
        if let Some(transcoder) = &state.transcoder {
            if let Some(playlist) = transcoder.variant(&claim.sd_hash).await {
                info!(uri = %uri, playlist = %playlist, "redirecting to transcoded rendition");
                return Ok(Response::builder()
                    .status(StatusCode::PERMANENT_REDIRECT)
                    .header(header::LOCATION, playlist)
                    .body(empty_body())
                    .unwrap());
            }
            transcoder.enqueue(uri);
        }
    }

    let stream = Arc::new(Stream::prepare(&state.cache, uri, claim).await?);
    respond(state, req, stream).await
}

async fn respond(
    state: &Arc<AppState>,
    req: &Request<Incoming>,
    stream: Arc<Stream>,
) -> Result<Response<BoxBody>> {
    let size = stream.size();

    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, patch_media_type(stream.content_type()))
        .header(header::CACHE_CONTROL, "public, max-age=31536000")
        .header(header::LAST_MODIFIED, http_date(&stream.timestamp()))
        .header(header::ACCEPT_RANGES, "bytes")
        .header("X-Powered-By", state.player_name.as_str())
        .header(header::ACCESS_CONTROL_EXPOSE_HEADERS, "X-Powered-By");

    if wants_download(req.uri().query()) {
        builder = builder.header(
            header::CONTENT_DISPOSITION,
            content_disposition(&stream.file_name()),
        );
    }

    if req.method() == Method::HEAD {
        return Ok(builder
            .header(header::CONTENT_LENGTH, size)
            .body(empty_body())
            .unwrap());
    }

    let range = match req.headers().get(header::RANGE) {
        Some(value) => {
            let value = value.to_str().map_err(|_| PlayerError::OutOfBounds)?;
            let parsed = parse_range_header(value, size).ok_or_else(|| {
                warn!(uri = %stream.uri(), range = %value, "unusable range header");
                PlayerError::OutOfBounds
            })?;
            Some(parsed)
        }
        None => None,
    };

    let (start, len) = match range {
        Some((start, end)) => {
            builder = builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", start, end - 1, size),
                )
                .header(header::CONTENT_LENGTH, end - start);
            (start, end - start)
        }
        None => {
            builder = builder
                .status(StatusCode::OK)
                .header(header::CONTENT_LENGTH, size);
            (0, size)
        }
    };

    debug!(
        uri = %stream.uri(),
        start = start,
        len = len,
        size = size,
        "serving stream bytes"
    );

    let mut reader = StreamReader::new(
        stream,
        Arc::clone(&state.cache),
        PrefetchConfig {
            enabled: state.args.prefetch,
            window: state.args.prefetch_window,
        },
        Arc::clone(&state.out_bytes),
    );
    if start > 0 {
        reader.seek(SeekFrom::Start(start))?;
    }

    let body = stream_body(reader, len).await?;
    Ok(builder.body(body).unwrap())
}

/// Build the response body for `len` bytes at the reader's position.
///
/// The first buffer is read before any headers go out, so a blob that
/// cannot be fetched or verified still maps to a status code instead of a
/// truncated 200.
async fn stream_body(mut reader: StreamReader, len: u64) -> Result<BoxBody> {
    if len == 0 {
        return Ok(empty_body());
    }

    let mut first = vec![0u8; len.min(STREAM_BUF_SIZE as u64) as usize];
    let n = reader.read(&mut first).await?;
    first.truncate(n);
    let remaining = len - n as u64;

    if n == 0 || remaining == 0 {
        return Ok(full_body(first));
    }

    // the writer task owns the reader; a dropped response body shows up as
    // a failed send and stops it, while any in-flight origin fetch still
    // completes inside the cache
    let (mut tx, rx) =
        futures::channel::mpsc::channel::<std::io::Result<Frame<Bytes>>>(2);
    tokio::spawn(async move {
        let mut remaining = remaining;
        while remaining > 0 {
            let mut buf = vec![0u8; remaining.min(STREAM_BUF_SIZE as u64) as usize];
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    buf.truncate(n);
                    remaining -= n as u64;
                    if tx.send(Ok(Frame::data(Bytes::from(buf)))).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "stream read failed mid-response");
                    let _ = tx.send(Err(std::io::Error::other(e.to_string()))).await;
                    break;
                }
            }
        }
    });

    let head = futures::stream::iter([Ok(Frame::data(Bytes::from(first)))]);
    Ok(BodyExt::boxed(StreamBody::new(head.chain(rx))))
}

// ============================================================================
// Header helpers
// ============================================================================

/// Parse an HTTP Range header against the stream size.
/// Supports `bytes=start-end`, `bytes=start-`, `bytes=-suffix`.
///
/// Returns (start, end) with an exclusive end.
fn parse_range_header(range_header: &str, total_size: u64) -> Option<(u64, u64)> {
    let range_str = range_header.strip_prefix("bytes=")?;

    if let Some(suffix) = range_str.strip_prefix('-') {
        // suffix range: bytes=-500 means the last 500 bytes
        let suffix: u64 = suffix.parse().ok()?;
        if suffix == 0 {
            return None;
        }
        return Some((total_size.saturating_sub(suffix), total_size));
    }

    let (start_str, end_str) = range_str.split_once('-')?;
    let start: u64 = start_str.parse().ok()?;

    let end = if end_str.is_empty() {
        // open-ended range: bytes=1000-
        total_size
    } else {
        // closed range with an inclusive end on the wire
        let end: u64 = end_str.parse().ok()?;
        end + 1
    };

    if start >= total_size || end > total_size || start >= end {
        return None;
    }
    Some((start, end))
}

/// Normalize legacy media types recorded by old publishing tools.
fn patch_media_type(media_type: &str) -> &str {
    match media_type {
        "video/m4v" | "video/x-m4v" => "video/mp4",
        "audio/mp3" | "audio/mpeg3" => "audio/mpeg",
        "audio/m4a" | "audio/x-m4a" => "audio/mp4",
        "text/markdown; charset=UTF-8" => "text/markdown",
        other => other,
    }
}

/// Keep letters, digits, `-`, `.`, `_` and spaces; everything else is
/// dropped from the quoted filename.
fn sanitize_filename(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | ' '))
        .collect::<String>()
        .trim()
        .to_string()
}

fn content_disposition(file_name: &str) -> String {
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        sanitize_filename(file_name),
        urlencoding::encode(file_name)
    )
}

fn wants_download(query: Option<&str>) -> bool {
    query
        .unwrap_or("")
        .split('&')
        .any(|kv| kv == "download" || kv.starts_with("download="))
}

/// IMF-fixdate for the Last-Modified header
fn http_date(timestamp: &chrono::DateTime<chrono::Utc>) -> String {
    timestamp.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

// ============================================================================
// Error policy
// ============================================================================

/// Map an error kind to its HTTP response.
pub fn error_response(err: &PlayerError) -> Response<BoxBody> {
    let status = match err {
        PlayerError::StreamNotFound(_) => StatusCode::NOT_FOUND,
        PlayerError::PaidStream => StatusCode::PAYMENT_REQUIRED,
        PlayerError::InvalidToken(_) => StatusCode::UNAUTHORIZED,
        PlayerError::ExpiredToken => StatusCode::GONE,
        PlayerError::BlobNotFound(_)
        | PlayerError::HashMismatch { .. }
        | PlayerError::Decryption(_)
        | PlayerError::CorruptChunk(_)
        | PlayerError::Timeout(_)
        | PlayerError::Upstream(_) => StatusCode::SERVICE_UNAVAILABLE,
        PlayerError::OutOfBounds | PlayerError::SeekingBeforeStart => StatusCode::BAD_REQUEST,
        PlayerError::StreamSizeZero
        | PlayerError::Descriptor(_)
        | PlayerError::Io(_)
        | PlayerError::Json(_)
        | PlayerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        error!(error = %err, status = %status, "request failed");
    } else {
        debug!(error = %err, status = %status, "request rejected");
    }

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(full_body(err.to_string()))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_ranges() {
        let total = 1000;
        assert_eq!(parse_range_header("bytes=0-499", total), Some((0, 500)));
        assert_eq!(parse_range_header("bytes=500-999", total), Some((500, 1000)));
        assert_eq!(parse_range_header("bytes=500-", total), Some((500, 1000)));
        assert_eq!(parse_range_header("bytes=-200", total), Some((800, 1000)));
    }

    #[test]
    fn rejects_malformed_and_unsatisfiable_ranges() {
        let total = 1000;
        assert_eq!(parse_range_header("bytes=1000-1500", total), None);
        assert_eq!(parse_range_header("bytes=500-499", total), None);
        assert_eq!(parse_range_header("bytes=-0", total), None);
        assert_eq!(parse_range_header("invalid", total), None);
        assert_eq!(parse_range_header("bytes=a-b", total), None);
    }

    #[test]
    fn range_edge_cases() {
        assert_eq!(parse_range_header("bytes=0-0", 100), Some((0, 1)));
        assert_eq!(parse_range_header("bytes=99-99", 100), Some((99, 100)));
        assert_eq!(parse_range_header("bytes=0-99", 100), Some((0, 100)));
        // suffix larger than the stream clamps to the whole stream
        assert_eq!(parse_range_header("bytes=-200", 100), Some((0, 100)));
    }

    #[test]
    fn claim_paths_split_into_parts() {
        assert_eq!(
            split_claim_path("what/6769855a/tok123"),
            Some(("what".into(), "6769855a".into(), Some("tok123".into())))
        );
        assert_eq!(
            split_claim_path("what/6769855a"),
            Some(("what".into(), "6769855a".into(), None))
        );
        assert_eq!(
            split_claim_path("My%20Movie/abc"),
            Some(("My Movie".into(), "abc".into(), None))
        );
        assert_eq!(split_claim_path("onlyname"), None);
        assert_eq!(split_claim_path(""), None);
        assert_eq!(split_claim_path("a/b/c/d"), None);
    }

    #[test]
    fn speech_paths_strip_the_extension() {
        assert_eq!(speech_uri("foo.mp4"), Some("foo".into()));
        assert_eq!(speech_uri("foo"), Some("foo".into()));
        assert_eq!(speech_uri("some/video.webm"), Some("some/video".into()));
        assert_eq!(speech_uri(".mp4"), None);
        assert_eq!(speech_uri(""), None);
        assert_eq!(speech_uri("/"), None);
    }

    #[test]
    fn filenames_are_sanitized_for_disposition() {
        assert_eq!(sanitize_filename("My Movie!"), "My Movie");
        assert_eq!(sanitize_filename("weird/..\\name?.mp4"), "weird...name.mp4");
        assert_eq!(sanitize_filename("тест.mp4"), ".mp4");
    }

    #[test]
    fn disposition_carries_both_filename_forms() {
        let header = content_disposition("My Movie!.mp4");
        assert!(header.starts_with("attachment; filename=\"My Movie.mp4\""));
        assert!(header.contains("filename*=UTF-8''My%20Movie%21.mp4"));
    }

    #[test]
    fn download_query_detection() {
        assert!(wants_download(Some("download")));
        assert!(wants_download(Some("download=1")));
        assert!(wants_download(Some("a=b&download=true")));
        assert!(!wants_download(Some("downloading=1")));
        assert!(!wants_download(None));
    }

    #[test]
    fn legacy_media_types_are_patched() {
        assert_eq!(patch_media_type("video/m4v"), "video/mp4");
        assert_eq!(patch_media_type("audio/mp3"), "audio/mpeg");
        assert_eq!(patch_media_type("video/mp4"), "video/mp4");
        assert_eq!(patch_media_type("application/pdf"), "application/pdf");
    }

    #[test]
    fn http_dates_are_imf_fixdate() {
        use chrono::TimeZone;
        let ts = chrono::Utc.with_ymd_and_hms(2020, 1, 1, 12, 30, 0).unwrap();
        assert_eq!(http_date(&ts), "Wed, 01 Jan 2020 12:30:00 GMT");
    }

    #[test]
    fn status_mapping_follows_the_taxonomy() {
        let cases = [
            (PlayerError::StreamNotFound("u".into()), 404),
            (PlayerError::PaidStream, 402),
            (PlayerError::InvalidToken("t".into()), 401),
            (PlayerError::ExpiredToken, 410),
            (PlayerError::BlobNotFound("h".into()), 503),
            (
                PlayerError::HashMismatch {
                    expected: "a".into(),
                    actual: "b".into(),
                },
                503,
            ),
            (PlayerError::CorruptChunk("c".into()), 503),
            (PlayerError::Timeout("t".into()), 503),
            (PlayerError::OutOfBounds, 400),
            (PlayerError::SeekingBeforeStart, 400),
            (PlayerError::Internal("i".into()), 500),
        ];
        for (err, expected) in cases {
            assert_eq!(error_response(&err).status().as_u16(), expected, "{err}");
        }
    }
}
