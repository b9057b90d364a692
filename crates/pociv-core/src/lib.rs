#![forbid(unsafe_code)]
#![deny(clippy::cast_precision_loss)]
#![deny(clippy::cast_possible_truncation)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::cast_sign_loss)]

//! Core types for the civility attestation pipeline.
//!
//! Everything in this crate is either pure (scoring, eligibility, payload
//! encoding, state machine tables) or a contract for an external
//! collaborator (chain client, persistence gateway, notifier). Runtime
//! orchestration lives in `pociv-pipeline`.

pub mod attestation;
pub mod canonical;
pub mod chain;
pub mod eligibility;
pub mod gateway;
pub mod model;
pub mod notify;
pub mod payload;
pub mod run;
pub mod scoring;

pub use attestation::{
    validate_attestation_transition, AttestationRecord, AttestationStatus,
    AttestationTransitionError,
};
pub use canonical::{canonical_decode, canonical_encode, CanonicalError, Hash32};
pub use chain::{AttestationChain, AttestationRequest, ChainError, SubmitReceipt, TxReceipt};
pub use eligibility::{evaluate, EligibilityVerdict, DEFAULT_ELIGIBILITY_THRESHOLD};
pub use gateway::{CreateOutcome, GatewayError, PersistenceGateway};
pub use model::{
    ChannelId, MessageId, MintKey, RatingRequest, RunId, User, UserId, Validation, ValidationId,
    WalletAddress, WalletParseError,
};
pub use notify::{Notification, NotificationKind, Notifier, NotifyError};
pub use payload::{AttestationPayload, AttestationSettings, PayloadError, SCHEMA_DEFINITION};
pub use run::{
    validate_run_transition, AttestationRef, NotificationStatus, RunOutcome, RunRecord, RunStep,
    RunStepCounts, RunTransitionError,
};
pub use scoring::{calculate_score, InvalidMetric, Metric, MetricRatings, Tier, TierBands};

/// Current wall-clock time in milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
