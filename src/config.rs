//! Configuration for streamgate
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// streamgate - media-delivery edge for a content-addressed blob network
#[derive(Parser, Debug, Clone)]
#[command(name = "streamgate")]
#[command(about = "HTTP edge server that turns encrypted blobs into playable byte streams")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Upstream reflector host:port for blob fetches
    #[arg(long, env = "REFLECTOR_ADDR", default_value = "reflector.lbry.com:5567")]
    pub reflector: String,

    /// Directory for the on-disk blob cache
    #[arg(long, env = "BLOB_CACHE_DIR", default_value = "./blob_cache")]
    pub blob_cache_dir: PathBuf,

    /// On-disk blob cache cap (bytes or human-readable, e.g. "16GB")
    #[arg(long, env = "BLOB_CACHE_SIZE", default_value = "16GB", value_parser = parse_byte_size)]
    pub blob_cache_size: u64,

    /// In-memory chunk cache cap (bytes or human-readable, e.g. "1GB")
    #[arg(long, env = "HOT_CACHE_SIZE", default_value = "1GB", value_parser = parse_byte_size)]
    pub hot_cache_size: u64,

    /// Maximum number of parsed stream descriptors kept in memory
    #[arg(long, env = "SD_CACHE_ENTRIES", default_value = "4096")]
    pub sd_cache_entries: usize,

    /// Enable chunk prefetching ahead of the current read position
    #[arg(long, env = "PREFETCH", default_value_t = true, action = clap::ArgAction::Set)]
    pub prefetch: bool,

    /// How many chunks ahead of the current read to fetch speculatively
    #[arg(long, env = "PREFETCH_WINDOW", default_value = "5")]
    pub prefetch_window: usize,

    /// Name reported in the X-Powered-By header
    #[arg(long, env = "PLAYER_NAME")]
    pub player_name: Option<String>,

    /// Wallet/name-service endpoint for URI resolution
    #[arg(long, env = "RESOLVER_URL", default_value = "http://localhost:5279")]
    pub resolver_url: String,

    /// Shared secret for access-token verification (token paths 401 without it)
    #[arg(long, env = "TOKEN_SECRET")]
    pub token_secret: Option<String>,

    /// Transcoder service URL (enables the HLS redirect surface)
    #[arg(long, env = "TRANSCODER_URL")]
    pub transcoder_url: Option<String>,

    /// Directory for transcoded-video caching (forwarded to the transcoder client)
    #[arg(long, env = "TRANSCODED_CACHE_DIR")]
    pub transcoded_cache_dir: Option<PathBuf>,

    /// Transcoded-video cache cap (bytes or human-readable)
    #[arg(long, env = "TRANSCODED_CACHE_SIZE", value_parser = parse_byte_size)]
    pub transcoded_cache_size: Option<u64>,

    /// Deadline for a single reflector fetch in milliseconds
    #[arg(long, env = "FETCH_TIMEOUT_MS", default_value = "30000")]
    pub fetch_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Effective name for the X-Powered-By header.
    ///
    /// The PLAYER_NAME environment variable overrides a configured name;
    /// the HOSTNAME environment variable is the fallback before the crate
    /// name.
    pub fn effective_player_name(&self) -> String {
        std::env::var("PLAYER_NAME")
            .ok()
            .filter(|s| !s.is_empty())
            .or_else(|| self.player_name.clone().filter(|s| !s.is_empty()))
            .or_else(|| std::env::var("HOSTNAME").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.blob_cache_size == 0 {
            return Err("BLOB_CACHE_SIZE must be greater than zero".to_string());
        }
        if self.hot_cache_size == 0 {
            return Err("HOT_CACHE_SIZE must be greater than zero".to_string());
        }
        if self.sd_cache_entries == 0 {
            return Err("SD_CACHE_ENTRIES must be greater than zero".to_string());
        }
        if self.reflector.split(':').count() != 2 {
            return Err(format!(
                "REFLECTOR_ADDR must be host:port, got {}",
                self.reflector
            ));
        }
        Ok(())
    }
}

/// Parse a byte size such as "123", "512KB", "16GB" (1024-based suffixes).
pub fn parse_byte_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let upper = s.to_ascii_uppercase();
    let (digits, multiplier) = if let Some(prefix) = upper.strip_suffix("TB") {
        (prefix, 1u64 << 40)
    } else if let Some(prefix) = upper.strip_suffix("GB") {
        (prefix, 1u64 << 30)
    } else if let Some(prefix) = upper.strip_suffix("MB") {
        (prefix, 1u64 << 20)
    } else if let Some(prefix) = upper.strip_suffix("KB") {
        (prefix, 1u64 << 10)
    } else if let Some(prefix) = upper.strip_suffix('B') {
        (prefix, 1)
    } else {
        (upper.as_str(), 1)
    };

    let digits = digits.trim();
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid byte size: {s}"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("byte size overflows: {s}"))
}
