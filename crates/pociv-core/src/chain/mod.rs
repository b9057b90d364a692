//! Attestation chain client contract.
//!
//! This module defines a transport-agnostic client used by the minter to
//! broadcast attestations and to observe their outcome. Implementations:
//! - [`mock_client::MockAttestationChain`]: deterministic in-process chain with failure injection
//! - [`http_client::HttpAttestationChain`]: JSON relay client (feature `chain-http`)
//!
//! ## Ambiguity
//!
//! A `Timeout` or `Network` error after a submit does not mean the
//! transaction was not sent. Callers must re-check with
//! [`AttestationChain::find_attestation`] before broadcasting again.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::canonical::Hash32;
use crate::model::{MintKey, WalletAddress};

#[cfg(feature = "chain-http")]
pub mod http_client;
pub mod mock_client;

/// One attestation to broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationRequest {
    pub schema_uid: Hash32,
    pub chain_id: u64,
    pub recipient: WalletAddress,
    /// ABI-encoded schema payload.
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
    /// Idempotency key; the chain service dedups submissions by it.
    pub mint_key: MintKey,
}

/// Result of a broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub tx_hash: String,
    /// True if the service had already seen this mint key.
    #[serde(default)]
    pub already_known: bool,
}

/// Mined transaction outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_hash: String,
    pub success: bool,
    /// Attestation uid, present when `success` is true.
    #[serde(default)]
    pub attestation_uid: Option<Hash32>,
    #[serde(default)]
    pub block_number: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("config error: {0}")]
    Config(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("rejected by chain: {0}")]
    Rejected(String),
    #[error("decode error: {0}")]
    Decode(String),
}

impl ChainError {
    /// The request may or may not have taken effect.
    pub fn is_ambiguous(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout => true,
            Self::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Network(_) => "network",
            Self::Timeout => "timeout",
            Self::HttpStatus { .. } => "http_status",
            Self::Rejected(_) => "rejected",
            Self::Decode(_) => "decode",
        }
    }
}

/// Client for the attestation service on the target chain.
#[async_trait]
pub trait AttestationChain: Send + Sync {
    /// Broadcast an attestation transaction.
    async fn submit_attestation(
        &self,
        request: &AttestationRequest,
    ) -> Result<SubmitReceipt, ChainError>;

    /// Receipt for a transaction, or `None` while it is not yet mined.
    async fn get_receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>, ChainError>;

    /// Look up a landed attestation by mint key.
    async fn find_attestation(&self, mint_key: &MintKey) -> Result<Option<TxReceipt>, ChainError>;
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        let trimmed = s.strip_prefix("0x").unwrap_or(&s);
        hex::decode(trimmed).map_err(serde::de::Error::custom)
    }
}
