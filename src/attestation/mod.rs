//! Attestation fetching
//!
//! Signed attestations are obtained from the guardian network's REST
//! endpoint. A missing attestation is reported as pending and left to the
//! next poll cycle; network failures are retried under a [`RetryPolicy`].

use crate::config::AttestationConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::retry::RetryPolicy;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AttestationClient: Send + Sync {
    /// Fetch the signed attestation for `(emitter, chain_id, sequence)`.
    ///
    /// `chain_id` is the chain id known to the attestation network.
    async fn fetch(&self, emitter: &str, chain_id: u16, sequence: u64) -> RelayerResult<Vec<u8>>;
}

/// Fetch an attestation, retrying only network failures
pub async fn fetch_with_policy(
    client: &dyn AttestationClient,
    policy: &RetryPolicy,
    emitter: &str,
    chain_id: u16,
    sequence: u64,
) -> RelayerResult<Vec<u8>> {
    let result = policy
        .run("attestation fetch", move || client.fetch(emitter, chain_id, sequence))
        .await;
    crate::metrics::record_attestation_fetch(&result);
    result
}

#[derive(Debug, Deserialize)]
struct SignedVaaResponse {
    #[serde(rename = "vaaBytes")]
    vaa_bytes: Option<String>,
}

/// Client for the guardian REST endpoint
/// `GET {base}/v1/signed_vaa/{chain}/{emitter}/{sequence}`
pub struct GuardianClient {
    client: reqwest::Client,
    base_url: String,
}

impl GuardianClient {
    pub fn new(config: &AttestationConfig) -> RelayerResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| RelayerError::Config(format!("attestation client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, emitter: &str, chain_id: u16, sequence: u64) -> String {
        format!(
            "{}/v1/signed_vaa/{}/{}/{}",
            self.base_url,
            chain_id,
            format_emitter(emitter),
            sequence
        )
    }
}

#[async_trait]
impl AttestationClient for GuardianClient {
    async fn fetch(&self, emitter: &str, chain_id: u16, sequence: u64) -> RelayerResult<Vec<u8>> {
        let url = self.url(emitter, chain_id, sequence);
        debug!("Fetching attestation from {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RelayerError::AttestationUnreachable(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RelayerError::AttestationUnreachable(e.to_string()))?;

        decode_response(status, &body, chain_id, sequence)
    }
}

/// Left-pad an emitter address to 32 bytes of lowercase hex without `0x`
pub fn format_emitter(emitter: &str) -> String {
    let raw = emitter.trim_start_matches("0x").to_lowercase();
    format!("{:0>64}", raw)
}

fn decode_response(
    status: StatusCode,
    body: &str,
    chain_id: u16,
    sequence: u64,
) -> RelayerResult<Vec<u8>> {
    let pending = || RelayerError::AttestationPending { chain_id, sequence };

    if status == StatusCode::NOT_FOUND {
        return Err(pending());
    }
    if status.is_server_error() {
        return Err(RelayerError::AttestationUnreachable(format!(
            "guardian returned {}",
            status
        )));
    }

    // Non-2xx client errors carry no attestation either
    let parsed: SignedVaaResponse = match serde_json::from_str(body) {
        Ok(parsed) if status.is_success() => parsed,
        _ => return Err(pending()),
    };
    let encoded = parsed.vaa_bytes.ok_or_else(pending)?;

    STANDARD.decode(encoded.as_bytes()).map_err(|e| {
        RelayerError::AttestationUnreachable(format!("malformed attestation payload: {}", e))
    })
}
