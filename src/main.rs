//! streamgate - HTTP media-delivery edge for a content-addressed blob network

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use streamgate::access::{JwtVerifier, TokenVerifier};
use streamgate::cache::{HotCache, HotCacheConfig};
use streamgate::config::Args;
use streamgate::reflector::BlobReflector;
use streamgate::resolve::HttpResolver;
use streamgate::store::{spawn_sweep_task, DiskBlobStore};
use streamgate::transcode;
use streamgate::{server, AppState};

/// How often the disk sweep runs when no put kicks it sooner
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("streamgate={log_level},info").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("configuration error: {}", e);
        std::process::exit(1);
    }

    let player_name = args.effective_player_name();

    info!("======================================");
    info!("  streamgate - blob to bytes edge");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Reflector: {}", args.reflector);
    info!(
        "Disk cache: {} (max {} bytes)",
        args.blob_cache_dir.display(),
        args.blob_cache_size
    );
    info!("Hot cache: {} bytes", args.hot_cache_size);
    info!("SD cache: {} entries", args.sd_cache_entries);
    info!(
        "Prefetch: {} (window {})",
        if args.prefetch { "on" } else { "off" },
        args.prefetch_window
    );
    info!("Resolver: {}", args.resolver_url);
    info!(
        "Transcoder: {}",
        args.transcoder_url.as_deref().unwrap_or("(disabled)")
    );
    info!("Player name: {}", player_name);
    info!("======================================");

    let store = Arc::new(DiskBlobStore::open(&args.blob_cache_dir, args.blob_cache_size).await?);
    spawn_sweep_task(Arc::clone(&store), SWEEP_INTERVAL);

    let reflector = Arc::new(BlobReflector::new(
        args.reflector.clone(),
        Duration::from_millis(args.fetch_timeout_ms),
    ));

    let cache = Arc::new(HotCache::new(
        HotCacheConfig {
            chunk_max_bytes: args.hot_cache_size,
            sd_max_entries: args.sd_cache_entries,
        },
        Arc::clone(&store),
        reflector,
    ));

    let resolver = Arc::new(HttpResolver::new(args.resolver_url.clone()));

    let token_verifier: Option<Arc<dyn TokenVerifier>> = args
        .token_secret
        .as_deref()
        .map(|secret| Arc::new(JwtVerifier::new(secret)) as Arc<dyn TokenVerifier>);

    let transcoder = transcode::client_from_config(
        args.transcoder_url.clone(),
        args.transcoded_cache_dir.clone(),
        args.transcoded_cache_size,
    );

    let state = Arc::new(AppState {
        args,
        cache,
        store,
        resolver,
        token_verifier,
        transcoder,
        player_name,
        out_bytes: Arc::new(AtomicU64::new(0)),
    });

    server::run(state).await?;
    Ok(())
}
