//! HTTP client for an attestation relay service.
//!
//! The relay signs and broadcasts attestation transactions on the target
//! chain and exposes JSON endpoints:
//! - `POST /attestations` submit (body: [`AttestationRequest`])
//! - `GET /tx/{hash}` receipt lookup (404 while unmined)
//! - `GET /attestations/by-key/{key}` lookup by mint key (404 if unknown)
//!
//! This client performs exactly one HTTP request per call. Retries belong to
//! the minter, which needs to count broadcasts.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{AttestationChain, AttestationRequest, ChainError, SubmitReceipt, TxReceipt};
use crate::model::MintKey;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpChainConfig {
    pub base_url: String,
    /// Sent as a bearer token when set.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    10_000
}

impl HttpChainConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Clone)]
pub struct HttpAttestationChain {
    cfg: HttpChainConfig,
    client: reqwest::Client,
}

impl HttpAttestationChain {
    pub fn new(cfg: HttpChainConfig) -> Result<Self, ChainError> {
        if cfg.base_url.trim().is_empty() {
            return Err(ChainError::Config("base_url is empty".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| ChainError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self { cfg, client })
    }

    fn join(&self, path: &str) -> String {
        let base = self.cfg.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }

    fn auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.cfg.api_key {
            Some(key) if !key.is_empty() => builder.bearer_auth(key),
            _ => builder,
        }
    }

    async fn get_optional<T>(&self, op: &'static str, url: &str) -> Result<Option<T>, ChainError>
    where
        T: for<'de> Deserialize<'de>,
    {
        debug!(operation = op, url = %url, "sending request");
        let resp = self
            .auth(self.client.get(url))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        map_response(op, resp).await.map(Some)
    }
}

#[async_trait]
impl AttestationChain for HttpAttestationChain {
    async fn submit_attestation(
        &self,
        request: &AttestationRequest,
    ) -> Result<SubmitReceipt, ChainError> {
        let url = self.join("/attestations");
        info!(
            operation = "submit_attestation",
            mint_key = %request.mint_key,
            url = %url,
            "broadcasting attestation"
        );
        let resp = self
            .auth(self.client.post(&url).json(request))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        map_response("submit_attestation", resp).await
    }

    async fn get_receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>, ChainError> {
        let url = self.join(&format!("/tx/{tx_hash}"));
        self.get_optional("get_receipt", &url).await
    }

    async fn find_attestation(&self, mint_key: &MintKey) -> Result<Option<TxReceipt>, ChainError> {
        let url = self.join(&format!("/attestations/by-key/{}", mint_key.to_hex()));
        self.get_optional("find_attestation", &url).await
    }
}

async fn map_response<T>(op: &'static str, resp: reqwest::Response) -> Result<T, ChainError>
where
    T: for<'de> Deserialize<'de>,
{
    let status = resp.status();
    let body = resp.text().await.map_err(map_reqwest_error)?;
    if status == StatusCode::CONFLICT || status == StatusCode::UNPROCESSABLE_ENTITY {
        warn!(operation = op, status = status.as_u16(), body = %body, "rejected by relay");
        return Err(ChainError::Rejected(body));
    }
    if !status.is_success() {
        warn!(operation = op, status = status.as_u16(), body = %body, "non-success status");
        return Err(ChainError::HttpStatus {
            status: status.as_u16(),
            body,
        });
    }
    serde_json::from_str(&body).map_err(|e| ChainError::Decode(e.to_string()))
}

fn map_reqwest_error(err: reqwest::Error) -> ChainError {
    if err.is_timeout() {
        return ChainError::Timeout;
    }
    if err.is_body() || err.is_decode() {
        return ChainError::Decode(err.to_string());
    }
    ChainError::Network(err.to_string())
}
