//! Attestation payload encoding.
//!
//! The payload is ABI-encoded as the tuple
//! `(uint16 scaledScore, uint8[5] metricRatings, string sourceRef, string communityContext)`.
//! Encoding is a pure function of the validation and the deployment settings,
//! so re-encoding a validation always yields identical bytes.

use ethers::abi::{self, ParamType, Token};
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::canonical::Hash32;
use crate::model::{ChannelId, MessageId, Validation, WalletAddress};
use crate::scoring::{MetricRatings, METRIC_COUNT};

/// Schema string registered with the attestation service.
pub const SCHEMA_DEFINITION: &str =
    "uint16 scaledScore, uint8[5] metricRatings, string sourceRef, string communityContext";

pub const DEFAULT_CHAIN_ID: u64 = 11_155_420;
pub const DEFAULT_EAS_CONTRACT: &str = "0x4200000000000000000000000000000000000021";
pub const DEFAULT_SOURCE_PLATFORM: &str = "discord";
pub const DEFAULT_COMMUNITY_CONTEXT: &str = "mvp_pilot_v1";
pub const DEFAULT_EXPLORER_URL_TEMPLATE: &str =
    "https://optimism-sepolia.easscan.org/attestation/view/{uid}";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("stored score {stored} does not match metrics {metrics}")]
    ScoreMismatch { stored: String, metrics: String },
    #[error("source platform must be non-empty and contain no ':'")]
    InvalidPlatform,
    #[error("community context must be non-empty")]
    EmptyCommunityContext,
    #[error("payload decode error: {0}")]
    Decode(String),
}

/// Deployment-level attestation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationSettings {
    pub schema_uid: Hash32,
    pub chain_id: u64,
    pub eas_contract: WalletAddress,
    pub source_platform: String,
    pub community_context: String,
    pub explorer_url_template: String,
}

impl AttestationSettings {
    pub fn new(schema_uid: Hash32, eas_contract: WalletAddress) -> Self {
        Self {
            schema_uid,
            chain_id: DEFAULT_CHAIN_ID,
            eas_contract,
            source_platform: DEFAULT_SOURCE_PLATFORM.to_string(),
            community_context: DEFAULT_COMMUNITY_CONTEXT.to_string(),
            explorer_url_template: DEFAULT_EXPLORER_URL_TEMPLATE.to_string(),
        }
    }

    pub fn validate(&self) -> Result<(), PayloadError> {
        if self.source_platform.is_empty() || self.source_platform.contains(':') {
            return Err(PayloadError::InvalidPlatform);
        }
        if self.community_context.is_empty() {
            return Err(PayloadError::EmptyCommunityContext);
        }
        Ok(())
    }

    pub fn explorer_url(&self, attestation_uid: &Hash32) -> String {
        self.explorer_url_template
            .replace("{uid}", &format!("0x{}", attestation_uid.to_hex()))
    }
}

/// `platform:{channelId}:{messageId}`
pub fn source_ref(platform: &str, channel: ChannelId, message: MessageId) -> String {
    format!("{platform}:{channel}:{message}")
}

/// The four schema fields of one attestation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationPayload {
    pub scaled_score: u16,
    pub metric_ratings: [u8; METRIC_COUNT],
    pub source_ref: String,
    pub community_context: String,
}

impl AttestationPayload {
    pub fn from_validation(
        validation: &Validation,
        settings: &AttestationSettings,
    ) -> Result<Self, PayloadError> {
        settings.validate()?;
        let derived = validation.metrics.score();
        if derived.to_bits() != validation.score.to_bits() {
            return Err(PayloadError::ScoreMismatch {
                stored: validation.score.to_string(),
                metrics: validation.metrics.to_string(),
            });
        }
        Ok(Self::from_parts(
            &validation.metrics,
            source_ref(
                &settings.source_platform,
                validation.channel,
                validation.message,
            ),
            settings.community_context.clone(),
        ))
    }

    pub fn from_parts(
        metrics: &MetricRatings,
        source_ref: String,
        community_context: String,
    ) -> Self {
        Self {
            scaled_score: metrics.scaled_score(),
            metric_ratings: metrics.as_array(),
            source_ref,
            community_context,
        }
    }

    fn tokens(&self) -> Vec<Token> {
        vec![
            Token::Uint(U256::from(self.scaled_score)),
            Token::FixedArray(
                self.metric_ratings
                    .iter()
                    .map(|m| Token::Uint(U256::from(*m)))
                    .collect(),
            ),
            Token::String(self.source_ref.clone()),
            Token::String(self.community_context.clone()),
        ]
    }

    fn param_types() -> [ParamType; 4] {
        [
            ParamType::Uint(16),
            ParamType::FixedArray(Box::new(ParamType::Uint(8)), METRIC_COUNT),
            ParamType::String,
            ParamType::String,
        ]
    }

    /// ABI-encode the payload.
    pub fn encode(&self) -> Vec<u8> {
        abi::encode(&self.tokens())
    }

    /// Decode ABI bytes back into a payload, rejecting values that do not fit the schema.
    pub fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        let tokens = abi::decode(&Self::param_types(), bytes)
            .map_err(|e| PayloadError::Decode(e.to_string()))?;
        let mut it = tokens.into_iter();
        let scaled_score = match it.next() {
            Some(Token::Uint(v)) => uint_to_u16(v)?,
            other => return Err(unexpected("scaledScore", other)),
        };
        let metric_ratings = match it.next() {
            Some(Token::FixedArray(items)) if items.len() == METRIC_COUNT => {
                let mut out = [0u8; METRIC_COUNT];
                for (slot, item) in out.iter_mut().zip(items) {
                    *slot = match item {
                        Token::Uint(v) => uint_to_u8(v)?,
                        other => return Err(unexpected("metricRatings", Some(other))),
                    };
                }
                out
            }
            other => return Err(unexpected("metricRatings", other)),
        };
        let source_ref = match it.next() {
            Some(Token::String(s)) => s,
            other => return Err(unexpected("sourceRef", other)),
        };
        let community_context = match it.next() {
            Some(Token::String(s)) => s,
            other => return Err(unexpected("communityContext", other)),
        };
        Ok(Self {
            scaled_score,
            metric_ratings,
            source_ref,
            community_context,
        })
    }

    /// BLAKE3 of the encoded bytes, used to detect payload drift on resume.
    pub fn hash(&self) -> Hash32 {
        Hash32(blake3::hash(&self.encode()).into())
    }
}

fn uint_to_u16(v: U256) -> Result<u16, PayloadError> {
    if v > U256::from(u16::MAX) {
        return Err(PayloadError::Decode(format!("{v} overflows uint16")));
    }
    u16::try_from(v.low_u64()).map_err(|e| PayloadError::Decode(e.to_string()))
}

fn uint_to_u8(v: U256) -> Result<u8, PayloadError> {
    if v > U256::from(u8::MAX) {
        return Err(PayloadError::Decode(format!("{v} overflows uint8")));
    }
    u8::try_from(v.low_u64()).map_err(|e| PayloadError::Decode(e.to_string()))
}

fn unexpected(field: &str, token: Option<Token>) -> PayloadError {
    PayloadError::Decode(format!("unexpected token for {field}: {token:?}"))
}
