#![forbid(unsafe_code)]
#![deny(clippy::cast_precision_loss)]
#![deny(clippy::cast_possible_truncation)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::cast_sign_loss)]

//! Civility rating pipeline: score, check eligibility, mint, notify.
//!
//! ## Flow
//!
//! ```text
//! submit_rating --> run(STARTED) --> worker pool --> Orchestrator::drive
//!                                                      |
//!   Scorer -> persist Validation -> Eligibility -> Minter -> Notifier
//! ```
//!
//! Every step records its intent before, and its result after, the side
//! effect. A restarted process picks unfinished runs up from the store and
//! continues from the recorded step.

pub mod metrics;
pub mod minter;
pub mod notifier;
pub mod orchestrator;
pub mod worker;

use std::time::Duration;

use pociv_core::payload::AttestationSettings;
use pociv_core::{
    ChainError, GatewayError, InvalidMetric, PayloadError, RunId, RunStep, RunTransitionError,
    TierBands, ValidationId, DEFAULT_ELIGIBILITY_THRESHOLD,
};
use thiserror::Error;

pub use minter::{AttestationMinter, MintOutcome, PriorGeneration};
pub use notifier::{LoggingNotifier, WebhookNotifier, WebhookNotifierConfig};
pub use orchestrator::{Orchestrator, ResumeSummary, SubmitAck, SubmitDisposition, SubmitRating};
pub use worker::{spawn_worker_pool, WorkerConfig, WorkerPoolHandle, WorkerSnapshot};

/// Longest error text stored on a run.
const MAX_ERROR_LEN: usize = 256;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid metric: {0}")]
    InvalidMetric(#[from] InvalidMetric),
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("payload error: {0}")]
    Payload(#[from] PayloadError),
    #[error("run transition error: {0}")]
    Transition(#[from] RunTransitionError),
    #[error("run not found: {0}")]
    RunNotFound(RunId),
    #[error("run {run_id} cannot be abandoned at {step}")]
    NotAbandonable { run_id: RunId, step: RunStep },
    #[error("run {run_id} has no failed mint to retry (step {step})")]
    NotRetryable { run_id: RunId, step: RunStep },
    #[error("attestation for validation {validation} is still pending on chain (tx {tx_hash})")]
    MintUnresolved {
        validation: ValidationId,
        tx_hash: String,
    },
    #[error("run {run_id}: failed attestation generation {generation} landed on chain (tx {tx_hash})")]
    PriorGenerationLanded {
        run_id: RunId,
        generation: u32,
        tx_hash: String,
    },
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("work queue is full")]
    QueueFull,
    #[error("worker pool stopped")]
    Stopped,
}

impl PipelineError {
    /// Errors that mean the deployment itself is misconfigured: no run can
    /// make progress until the node is restarted with a fixed config.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::Chain(ChainError::Config(_))
                | Self::Payload(PayloadError::InvalidPlatform | PayloadError::EmptyCommunityContext)
        )
    }

    /// Errors caused by one run's own data. Retrying cannot fix them, so the
    /// run is quarantined instead of being picked up by every scan.
    pub fn is_run_defect(&self) -> bool {
        match self {
            Self::Invariant(_) | Self::Gateway(GatewayError::Corrupt(_)) => true,
            Self::Payload(PayloadError::ScoreMismatch { .. } | PayloadError::Decode(_)) => true,
            Self::Transition(RunTransitionError::Abandoned) => false,
            Self::Transition(_) => true,
            _ => false,
        }
    }
}

/// Retry and timing policy for the minter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintConfig {
    /// Attempt slots per attestation generation.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Bound on a single broadcast call.
    pub submit_timeout_ms: u64,
    /// How long to wait for a broadcast transaction to be mined.
    pub receipt_timeout_ms: u64,
    pub receipt_poll_ms: u64,
}

impl Default for MintConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 2_000,
            backoff_max_ms: 60_000,
            submit_timeout_ms: 30_000,
            receipt_timeout_ms: 120_000,
            receipt_poll_ms: 2_000,
        }
    }
}

impl MintConfig {
    /// Delay after `failed_attempts` consecutive failures: base * 2^(n-1), capped.
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let exp = failed_attempts.saturating_sub(1).min(32);
        let delay = self
            .backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.backoff_max_ms);
        Duration::from_millis(delay)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Minimum score for minting, inclusive.
    pub eligibility_threshold: f64,
    pub tiers: TierBands,
    pub attestation: AttestationSettings,
    pub mint: MintConfig,
    /// Bound on every persistence gateway call.
    pub gateway_timeout_ms: u64,
    /// Bound on a notification delivery.
    pub notify_timeout_ms: u64,
}

impl PipelineConfig {
    pub fn new(attestation: AttestationSettings) -> Self {
        Self {
            eligibility_threshold: DEFAULT_ELIGIBILITY_THRESHOLD,
            tiers: TierBands::default(),
            attestation,
            mint: MintConfig::default(),
            gateway_timeout_ms: 5_000,
            notify_timeout_ms: 10_000,
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(0.0..=5.0).contains(&self.eligibility_threshold) {
            return Err(PipelineError::Config(format!(
                "eligibility threshold {} outside [0, 5]",
                self.eligibility_threshold
            )));
        }
        self.tiers.validate().map_err(PipelineError::Config)?;
        self.attestation
            .validate()
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        if self.mint.max_attempts == 0 {
            return Err(PipelineError::Config(
                "mint.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.mint.receipt_poll_ms == 0 {
            return Err(PipelineError::Config(
                "mint.receipt_poll_ms must be positive".to_string(),
            ));
        }
        if self.gateway_timeout_ms == 0 {
            return Err(PipelineError::Config(
                "gateway_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Run a gateway call under a deadline. An expired deadline is
/// `GatewayError::Timeout`, distinct from any error the store reports.
pub(crate) async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, GatewayError>
where
    F: std::future::Future<Output = Result<T, GatewayError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or(Err(GatewayError::Timeout))
}

/// Error text safe to persist: single line, bounded length.
pub(crate) fn sanitize_error(err: &impl std::fmt::Display) -> String {
    let mut s: String = err
        .to_string()
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    if s.len() > MAX_ERROR_LEN {
        let mut cut = MAX_ERROR_LEN;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
    s
}
