//! URI resolution against the wallet/name-service daemon
//!
//! Resolution is an external collaborator: the core only needs a claim's
//! stream metadata back. The daemon speaks a JSON-RPC style POST API; a
//! stream claim carries its SD hash, media type, filename, optional exact
//! source size, and fee information.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::error::{PlayerError, Result};

/// Stream metadata resolved from a claim.
#[derive(Debug, Clone)]
pub struct ResolvedClaim {
    pub uri: String,
    pub name: String,
    pub claim_id: String,
    pub sd_hash: String,
    pub content_type: String,
    pub file_name: String,
    /// Exact stream size when the claim carries one
    pub source_size: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub is_paid: bool,
}

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, uri: &str) -> Result<ResolvedClaim>;
}

/// Resolver backed by an HTTP JSON-RPC endpoint.
pub struct HttpResolver {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpResolver {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("reqwest client"),
        }
    }
}

#[async_trait]
impl Resolver for HttpResolver {
    async fn resolve(&self, uri: &str) -> Result<ResolvedClaim> {
        let body = serde_json::json!({
            "method": "resolve",
            "params": { "urls": [uri] },
        });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| PlayerError::Upstream(format!("resolver request: {e}")))?;
        if !response.status().is_success() {
            return Err(PlayerError::Upstream(format!(
                "resolver returned {}",
                response.status()
            )));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|e| PlayerError::Upstream(format!("resolver body: {e}")))?;

        let entry = payload
            .get("result")
            .and_then(|r| r.get(uri))
            .ok_or_else(|| PlayerError::StreamNotFound(uri.to_string()))?;
        claim_from_value(uri, entry)
    }
}

/// Turn one resolver result entry into a `ResolvedClaim`.
fn claim_from_value(uri: &str, claim: &Value) -> Result<ResolvedClaim> {
    if claim.get("error").is_some() {
        return Err(PlayerError::StreamNotFound(uri.to_string()));
    }

    let source = &claim["value"]["source"];
    let sd_hash = source["sd_hash"]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PlayerError::StreamNotFound(uri.to_string()))?
        .to_string();

    // size arrives as a decimal string on the wire, but tolerate a number
    let source_size = match &source["size"] {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    };

    let fee_amount = match &claim["value"]["fee"]["amount"] {
        Value::String(s) => s.parse::<f64>().unwrap_or(0.0),
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    };

    let timestamp = claim["timestamp"]
        .as_i64()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(Utc::now);

    Ok(ResolvedClaim {
        uri: uri.to_string(),
        name: claim["name"].as_str().unwrap_or_default().to_string(),
        claim_id: claim["claim_id"].as_str().unwrap_or_default().to_string(),
        sd_hash,
        content_type: source["media_type"]
            .as_str()
            .filter(|s| !s.is_empty())
            .unwrap_or("application/octet-stream")
            .to_string(),
        file_name: source["name"].as_str().unwrap_or_default().to_string(),
        source_size,
        timestamp,
        is_paid: fee_amount > 0.0,
    })
}
