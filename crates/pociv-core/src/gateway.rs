//! Persistence gateway contract.
//!
//! The pipeline reaches its record store only through this trait, so the
//! sled-backed store and test doubles are interchangeable. All writes that
//! guard an invariant are conditional:
//! - validations and attestations are created only if absent
//! - run updates are compare-and-swap on `revision`
//! - attestation updates are compare-and-swap against the record the caller
//!   read, and are checked against the status machine

use async_trait::async_trait;
use thiserror::Error;

use crate::attestation::AttestationRecord;
use crate::model::{RunId, User, UserId, Validation, ValidationId, WalletAddress};
use crate::run::{RunRecord, RunStepCounts};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store call timed out")]
    Timeout,
    #[error("concurrent update conflict: {0}")]
    Conflict(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl GatewayError {
    /// Worth retrying on a later pass.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout | Self::Conflict(_))
    }
}

/// Result of a create-if-absent write.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome<T> {
    Created(T),
    Existing(T),
}

impl<T> CreateOutcome<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Created(v) | Self::Existing(v) => v,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn get_user(&self, id: UserId) -> Result<Option<User>, GatewayError>;

    /// Create the user on first contact; returns the stored user either way.
    async fn ensure_user(&self, id: UserId, now_ms: u64) -> Result<User, GatewayError>;

    /// Set or replace the user's wallet.
    async fn link_wallet(
        &self,
        id: UserId,
        wallet: WalletAddress,
        now_ms: u64,
    ) -> Result<User, GatewayError>;

    /// Validations are immutable: an existing record with the same id wins.
    async fn insert_validation(
        &self,
        validation: &Validation,
    ) -> Result<CreateOutcome<Validation>, GatewayError>;

    async fn get_validation(&self, id: &ValidationId) -> Result<Option<Validation>, GatewayError>;

    async fn get_attestation(
        &self,
        validation_id: &ValidationId,
    ) -> Result<Option<AttestationRecord>, GatewayError>;

    /// At most one attestation per validation: an existing record wins.
    async fn create_attestation(
        &self,
        record: &AttestationRecord,
    ) -> Result<CreateOutcome<AttestationRecord>, GatewayError>;

    /// Replace `expected` with `next`. Fails with `Conflict` if the stored
    /// record is no longer `expected`, and rejects status regressions.
    async fn update_attestation(
        &self,
        expected: &AttestationRecord,
        next: &AttestationRecord,
    ) -> Result<(), GatewayError>;

    /// Replace a FAILED record with a fresh PENDING generation.
    async fn supersede_attestation(
        &self,
        validation_id: &ValidationId,
        now_ms: u64,
    ) -> Result<AttestationRecord, GatewayError>;

    /// Create the run if no run exists for its id.
    async fn create_run(&self, run: &RunRecord) -> Result<CreateOutcome<RunRecord>, GatewayError>;

    async fn get_run(&self, id: &RunId) -> Result<Option<RunRecord>, GatewayError>;

    /// Store `run` only if the stored revision equals `run.revision`.
    /// Returns the stored record with its bumped revision.
    async fn update_run(&self, run: &RunRecord) -> Result<RunRecord, GatewayError>;

    /// Runs that are neither terminal, abandoned nor quarantined. Successive
    /// calls resume after the last run the previous call returned.
    async fn list_unfinished_runs(&self, limit: usize) -> Result<Vec<RunRecord>, GatewayError>;

    async fn count_runs(&self) -> Result<RunStepCounts, GatewayError>;
}
