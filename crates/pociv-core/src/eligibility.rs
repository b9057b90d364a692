//! Threshold and wallet-linkage check that decides whether a validation is minted.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::{User, WalletAddress};

/// Default minimum score for minting (inclusive).
pub const DEFAULT_ELIGIBILITY_THRESHOLD: f64 = 3.0;

/// Outcome of the eligibility check. Only `Eligible` leads to a mint;
/// the other two are valid terminal outcomes, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EligibilityVerdict {
    /// Score cleared the threshold and the target has a wallet.
    Eligible { recipient: WalletAddress },
    BelowThreshold,
    NoWallet,
}

impl EligibilityVerdict {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::Eligible { .. })
    }

    pub fn recipient(&self) -> Option<&WalletAddress> {
        match self {
            Self::Eligible { recipient } => Some(recipient),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Eligible { .. } => "eligible",
            Self::BelowThreshold => "below_threshold",
            Self::NoWallet => "no_wallet",
        }
    }
}

impl fmt::Display for EligibilityVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Decide eligibility from a score and the target's wallet state as read now.
///
/// The threshold check comes first, so a low score reports `BelowThreshold`
/// even when the target also lacks a wallet. A missing user record counts as
/// no wallet.
pub fn evaluate(score: f64, threshold: f64, target: Option<&User>) -> EligibilityVerdict {
    if score < threshold {
        return EligibilityVerdict::BelowThreshold;
    }
    match target.and_then(|u| u.wallet.clone()) {
        Some(recipient) => EligibilityVerdict::Eligible { recipient },
        None => EligibilityVerdict::NoWallet,
    }
}
