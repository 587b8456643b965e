//! Transcoder registry client
//!
//! Streams that have an HLS rendition are served by redirect instead of the
//! blob pipeline. The registry is consulted before a stream is prepared;
//! registry failures never block playback, the blob pipeline is always the
//! fallback.

use std::path::PathBuf;

use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct TranscoderConfig {
    pub base_url: String,
    /// Local rendition cache settings, forwarded to the transcoding service
    pub cache_dir: Option<PathBuf>,
    pub cache_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct VariantResponse {
    /// Master playlist URL for the transcoded rendition
    url: String,
}

pub struct TranscoderClient {
    config: TranscoderConfig,
    client: reqwest::Client,
}

impl TranscoderClient {
    pub fn new(config: TranscoderConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(5))
                .build()
                .expect("reqwest client"),
        }
    }

    fn video_url(&self, sd_hash: &str) -> String {
        format!(
            "{}/api/v1/video/{sd_hash}",
            self.config.base_url.trim_end_matches('/')
        )
    }

    /// Master playlist URL for an already-transcoded stream, if one exists.
    pub async fn variant(&self, sd_hash: &str) -> Option<String> {
        let response = self.client.get(self.video_url(sd_hash)).send().await.ok()?;
        if response.status() != reqwest::StatusCode::OK {
            // 202 means queued, 404 means unknown; neither is playable yet
            return None;
        }
        response
            .json::<VariantResponse>()
            .await
            .ok()
            .map(|v| v.url)
    }

    /// Ask the transcoder to pick up a stream, without waiting for it.
    pub fn enqueue(&self, uri: &str) {
        let client = self.client.clone();
        let url = format!(
            "{}/api/v1/video",
            self.config.base_url.trim_end_matches('/')
        );
        let uri = uri.to_string();
        tokio::spawn(async move {
            let body = serde_json::json!({ "uri": uri });
            match client.post(&url).json(&body).send().await {
                Ok(response) => {
                    debug!(uri = %uri, status = %response.status(), "transcode download requested")
                }
                Err(e) => debug!(uri = %uri, error = %e, "transcode enqueue failed"),
            }
        });
    }
}

/// Build a client when a transcoder URL is configured.
pub fn client_from_config(
    base_url: Option<String>,
    cache_dir: Option<PathBuf>,
    cache_size: Option<u64>,
) -> Option<TranscoderClient> {
    base_url.map(|base_url| {
        TranscoderClient::new(TranscoderConfig {
            base_url,
            cache_dir,
            cache_size,
        })
    })
}
