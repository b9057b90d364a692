//! Attestation record and its status machine.
//!
//! ```text
//! PENDING -> MINTED
//!    |
//!    +-----> FAILED  (may be superseded by a new PENDING generation)
//! ```
//!
//! Transitions are monotone: nothing moves back to PENDING in place and no
//! state is skipped. Superseding a FAILED row replaces it with a new
//! generation that carries a fresh mint key.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::canonical::Hash32;
use crate::model::{MintKey, ValidationId, WalletAddress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttestationStatus {
    Pending,
    Minted,
    Failed,
}

impl AttestationStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Minted => "MINTED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Minted | Self::Failed)
    }
}

impl fmt::Display for AttestationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttestationTransitionError {
    #[error("attestation is terminal ({from}); cannot move to {to}")]
    Terminal {
        from: AttestationStatus,
        to: AttestationStatus,
    },
    #[error("only a FAILED attestation can be superseded (found {0})")]
    NotSupersedable(AttestationStatus),
}

/// Check a status change on the same attestation generation.
///
/// `Pending -> Pending` is allowed so progress (attempt counter, tx hash)
/// can be recorded without changing status.
pub fn validate_attestation_transition(
    from: AttestationStatus,
    to: AttestationStatus,
) -> Result<(), AttestationTransitionError> {
    match (from, to) {
        (AttestationStatus::Pending, _) => Ok(()),
        (from, to) => Err(AttestationTransitionError::Terminal { from, to }),
    }
}

/// The stored record of one Validation's attestation. At most one exists per validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationRecord {
    pub validation_id: ValidationId,
    /// Assigned by the attestation service once minted.
    pub attestation_uid: Option<Hash32>,
    pub recipient: WalletAddress,
    pub tx_hash: Option<String>,
    pub status: AttestationStatus,
    pub mint_key: MintKey,
    pub generation: u32,
    /// Attempt slots consumed in this generation.
    pub attempts: u32,
    /// Number of transactions actually broadcast in this generation.
    pub broadcasts: u32,
    pub last_error: Option<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl AttestationRecord {
    pub fn pending(
        validation_id: ValidationId,
        recipient: WalletAddress,
        generation: u32,
        now_ms: u64,
    ) -> Self {
        Self {
            validation_id,
            attestation_uid: None,
            recipient,
            tx_hash: None,
            status: AttestationStatus::Pending,
            mint_key: MintKey::derive(validation_id, generation),
            generation,
            attempts: 0,
            broadcasts: 0,
            last_error: None,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }

    /// Fresh PENDING generation replacing this FAILED record.
    pub fn supersede(&self, now_ms: u64) -> Result<Self, AttestationTransitionError> {
        if self.status != AttestationStatus::Failed {
            return Err(AttestationTransitionError::NotSupersedable(self.status));
        }
        let generation = self.generation.saturating_add(1);
        Ok(Self::pending(
            self.validation_id,
            self.recipient.clone(),
            generation,
            now_ms,
        ))
    }

    pub fn mark_minted(&mut self, tx_hash: String, uid: Hash32, now_ms: u64) {
        self.status = AttestationStatus::Minted;
        self.tx_hash = Some(tx_hash);
        self.attestation_uid = Some(uid);
        self.last_error = None;
        self.updated_at_ms = now_ms;
    }

    pub fn mark_failed(&mut self, reason: String, now_ms: u64) {
        self.status = AttestationStatus::Failed;
        self.last_error = Some(reason);
        self.updated_at_ms = now_ms;
    }
}
