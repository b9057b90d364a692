//! Persistent domain records: users, validations and the identifiers that bind them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::canonical::{CanonicalError, Hash32};
use crate::scoring::MetricRatings;

const RUN_ID_DOMAIN: &[u8] = b"pociv.run.v1";
const VALIDATION_ID_DOMAIN: &[u8] = b"pociv.validation.v1";
const MINT_KEY_DOMAIN: &[u8] = b"pociv.mint.v1";

/// Platform user id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub u64);

/// Channel (conversation context) id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub u64);

/// Rated message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub u64);

macro_rules! impl_display_u64 {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        })*
    };
}

impl_display_u64!(UserId, ChannelId, MessageId);

macro_rules! impl_display_hash {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0.to_hex())
            }
        })*
    };
}

/// Identifier of one pipeline run. One run exists per rated message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub Hash32);

impl RunId {
    pub fn derive(channel: ChannelId, message: MessageId) -> Self {
        Self(Hash32::derive(
            RUN_ID_DOMAIN,
            &[&channel.0.to_le_bytes(), &message.0.to_le_bytes()],
        ))
    }

    pub fn from_hex(s: &str) -> Result<Self, CanonicalError> {
        Hash32::from_hex(s).map(Self)
    }

    pub fn to_hex(self) -> String {
        self.0.to_hex()
    }
}

/// Identifier of one scoring event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValidationId(pub Hash32);

impl ValidationId {
    /// Stable across re-executions of the scoring step for the same run.
    pub fn derive(run_id: RunId) -> Self {
        Self(Hash32::derive(VALIDATION_ID_DOMAIN, &[&run_id.0 .0]))
    }

    pub fn to_hex(self) -> String {
        self.0.to_hex()
    }
}

/// Chain-side idempotency key for one mint generation of a validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MintKey(pub Hash32);

impl MintKey {
    pub fn derive(validation_id: ValidationId, generation: u32) -> Self {
        Self(Hash32::derive(
            MINT_KEY_DOMAIN,
            &[&validation_id.0 .0, &generation.to_le_bytes()],
        ))
    }

    pub fn to_hex(self) -> String {
        self.0.to_hex()
    }
}

impl_display_hash!(RunId, ValidationId, MintKey);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WalletParseError {
    #[error("wallet address must start with 0x")]
    MissingPrefix,
    #[error("wallet address must have 40 hex digits, got {0}")]
    BadLength(usize),
    #[error("wallet address contains non-hex characters")]
    NotHex,
}

/// EVM wallet address. Parsed case-insensitively, stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WalletAddress(String);

impl WalletAddress {
    pub fn parse(raw: &str) -> Result<Self, WalletParseError> {
        let raw = raw.trim();
        let digits = raw
            .strip_prefix("0x")
            .or_else(|| raw.strip_prefix("0X"))
            .ok_or(WalletParseError::MissingPrefix)?;
        if digits.len() != 40 {
            return Err(WalletParseError::BadLength(digits.len()));
        }
        if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(WalletParseError::NotHex);
        }
        Ok(Self(format!("0x{}", digits.to_ascii_lowercase())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_address(&self) -> ethers::types::Address {
        let mut bytes = [0u8; 20];
        // Validated in `parse`: exactly 40 hex digits after the prefix.
        if hex::decode_to_slice(&self.0[2..], &mut bytes).is_err() {
            return ethers::types::Address::zero();
        }
        ethers::types::Address::from(bytes)
    }
}

impl FromStr for WalletAddress {
    type Err = WalletParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A platform user as seen by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub wallet: Option<WalletAddress>,
    pub created_at_ms: u64,
}

impl User {
    pub fn new(id: UserId, created_at_ms: u64) -> Self {
        Self {
            id,
            wallet: None,
            created_at_ms,
        }
    }
}

/// A validated "submit rating" request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingRequest {
    pub validator: UserId,
    pub target: UserId,
    pub channel: ChannelId,
    pub message: MessageId,
    pub metrics: MetricRatings,
}

impl RatingRequest {
    pub fn run_id(&self) -> RunId {
        RunId::derive(self.channel, self.message)
    }
}

/// One immutable scoring event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    pub id: ValidationId,
    pub run_id: RunId,
    pub validator: UserId,
    pub target: UserId,
    pub channel: ChannelId,
    pub message: MessageId,
    pub metrics: MetricRatings,
    pub score: f64,
    pub created_at_ms: u64,
}

impl Validation {
    pub fn from_request(run_id: RunId, request: &RatingRequest, created_at_ms: u64) -> Self {
        Self {
            id: ValidationId::derive(run_id),
            run_id,
            validator: request.validator,
            target: request.target,
            channel: request.channel,
            message: request.message,
            metrics: request.metrics,
            score: request.metrics.score(),
            created_at_ms,
        }
    }
}
