//! HTTP server implementation
//!
//! Uses hyper http1 with TokioIo for async handling: a plain accept loop,
//! one task per connection, and a `(method, path)` match for routing.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::access::TokenVerifier;
use crate::cache::HotCache;
use crate::config::Args;
use crate::error::Result;
use crate::resolve::Resolver;
use crate::routes::{self, full_body, BoxBody};
use crate::store::DiskBlobStore;
use crate::transcode::TranscoderClient;

/// Shared application state
pub struct AppState {
    pub args: Args,
    /// Hot cache over the disk store and reflector
    pub cache: Arc<HotCache>,
    /// Disk tier, exposed for maintenance and health reporting
    pub store: Arc<DiskBlobStore>,
    /// URI resolution collaborator
    pub resolver: Arc<dyn Resolver>,
    /// Access-token verification, absent when no secret is configured
    pub token_verifier: Option<Arc<dyn TokenVerifier>>,
    /// Transcoded-rendition registry, absent when not configured
    pub transcoder: Option<TranscoderClient>,
    /// Effective X-Powered-By value
    pub player_name: String,
    /// Total bytes delivered to clients
    pub out_bytes: Arc<AtomicU64>,
}

/// Start the HTTP server
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(state.args.listen).await?;
    info!("streamgate listening on {}", state.args.listen);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        debug!("error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("error accepting connection: {:?}", e);
            }
        }
    }
}

/// Route incoming HTTP requests
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<BoxBody>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    info!("[{}] {} {}", addr, method, path);

    let is_read = method == Method::GET || method == Method::HEAD;
    let result = match path.as_str() {
        "/health" | "/healthz" if is_read => Ok(routes::health::health_check(&state)),
        "/version" if method == Method::GET => Ok(routes::health::version_info()),
        _ if is_read && path.starts_with("/claims/") => {
            routes::streams::handle_claims(&state, &req).await
        }
        _ if is_read && path.starts_with("/speech/") => {
            routes::streams::handle_speech(&state, &req).await
        }
        _ if is_read && path.starts_with("/api/v4/streams/free/") => {
            routes::streams::handle_api_streams(&state, &req).await
        }
        _ => return Ok(not_found_response(&path)),
    };

    Ok(result.unwrap_or_else(|err| routes::streams::error_response(&err)))
}

fn not_found_response(path: &str) -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(full_body(format!("no route for {path}")))
        .unwrap()
}
