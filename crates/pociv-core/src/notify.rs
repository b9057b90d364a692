//! Outcome notification contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::canonical::Hash32;
use crate::model::{RunId, UserId};
use crate::scoring::Tier;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationKind {
    Minted {
        tier: Option<Tier>,
        score: f64,
        attestation_uid: Hash32,
        explorer_url: String,
    },
    MintFailed {
        score: f64,
        reason: String,
    },
    BelowThreshold {
        score: f64,
        threshold: f64,
    },
    NoWallet {
        score: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub run_id: RunId,
    pub recipient: UserId,
    #[serde(flatten)]
    pub kind: NotificationKind,
}

impl Notification {
    /// User-facing text.
    pub fn message(&self) -> String {
        match &self.kind {
            NotificationKind::Minted {
                tier: Some(tier),
                explorer_url,
                ..
            } => format!(
                "{} You earned a {} Civility Stamp! View on EAS: {}",
                tier.emoji(),
                tier.name(),
                explorer_url
            ),
            NotificationKind::Minted {
                tier: None,
                explorer_url,
                ..
            } => format!("Your Civility Stamp was minted! View on EAS: {explorer_url}"),
            NotificationKind::MintFailed { score, .. } => format!(
                "Your message scored {score:.1}, but minting the Civility Stamp failed. An operator has been alerted."
            ),
            NotificationKind::BelowThreshold { score, threshold } => format!(
                "Your message scored {score:.1}, below the {threshold:.1} needed for a Civility Stamp."
            ),
            NotificationKind::NoWallet { score } => format!(
                "Your message scored {score:.1} and qualifies for a Civility Stamp. Link a wallet to receive future stamps."
            ),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            NotificationKind::Minted { .. } => "minted",
            NotificationKind::MintFailed { .. } => "mint_failed",
            NotificationKind::BelowThreshold { .. } => "below_threshold",
            NotificationKind::NoWallet { .. } => "no_wallet",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    #[error("notification transport error: {0}")]
    Transport(String),
    #[error("notification rejected: status {status}")]
    Rejected { status: u16 },
    #[error("notification timed out")]
    Timeout,
}

/// Delivers a run's outcome to the rated user.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelId, MessageId};

    fn notification(kind: NotificationKind) -> Notification {
        Notification {
            run_id: RunId::derive(ChannelId(1), MessageId(2)),
            recipient: UserId(3),
            kind,
        }
    }

    #[test]
    fn minted_message_names_tier_and_link() {
        let n = notification(NotificationKind::Minted {
            tier: Some(Tier::Silver),
            score: 4.2,
            attestation_uid: Hash32([1; 32]),
            explorer_url: "https://example.test/view/0x01".to_string(),
        });
        assert_eq!(
            n.message(),
            "\u{1F948} You earned a Silver Civility Stamp! View on EAS: https://example.test/view/0x01"
        );
        assert_eq!(n.kind_name(), "minted");
    }

    #[test]
    fn ineligible_messages_are_distinct() {
        let below = notification(NotificationKind::BelowThreshold {
            score: 2.8,
            threshold: 3.0,
        });
        let no_wallet = notification(NotificationKind::NoWallet { score: 4.2 });
        let failed = notification(NotificationKind::MintFailed {
            score: 4.2,
            reason: "exhausted".to_string(),
        });
        assert!(below.message().contains("2.8"));
        assert!(no_wallet.message().contains("Link a wallet"));
        assert!(failed.message().contains("failed"));
        assert_ne!(below.kind_name(), no_wallet.kind_name());
    }

    #[test]
    fn json_shape_is_flat_and_tagged() {
        let n = notification(NotificationKind::NoWallet { score: 4.0 });
        let v = serde_json::to_value(&n).expect("json");
        assert_eq!(v["kind"], "no_wallet");
        assert_eq!(v["recipient"], 3);
        assert_eq!(v["score"], 4.0);
        assert_eq!(v["run_id"], n.run_id.to_hex());
    }
}
