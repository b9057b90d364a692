//! Pipeline run state machine.
//!
//! ## Step Transitions
//!
//! ```text
//! Started -> Scored -> EligibilityChecked -+-> NotEligible ---+
//!                                          +-> NoWallet ------+-> Notified
//!                                          +-> MintAttempted -+-> Minted -+
//!                                                             +-> Failed -+
//! ```
//!
//! Each run persists its last confirmed step as a tag. A resumed run simply
//! continues from that tag. Before a step's side effect executes, the intended
//! next step is persisted in `pending_intent`, so a resumed run can tell
//! "started but unconfirmed" from "never started".
//!
//! The one backward edge is an explicit operator action: a run whose mint
//! ended FAILED may be reopened at `MintAttempted` with a superseding
//! attestation generation (see [`RunRecord::reopen_for_mint`]).
//!
//! A run whose own data is inconsistent is quarantined: it keeps its step and
//! error text but is no longer listed as unfinished.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::attestation::AttestationStatus;
use crate::canonical::Hash32;
use crate::eligibility::EligibilityVerdict;
use crate::model::{RatingRequest, RunId, ValidationId};
use crate::scoring::Tier;

/// Persisted step tag of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStep {
    Started,
    Scored,
    EligibilityChecked,
    NotEligible,
    NoWallet,
    MintAttempted,
    Minted,
    Failed,
    Notified,
}

impl RunStep {
    pub const ALL: [RunStep; 9] = [
        RunStep::Started,
        RunStep::Scored,
        RunStep::EligibilityChecked,
        RunStep::NotEligible,
        RunStep::NoWallet,
        RunStep::MintAttempted,
        RunStep::Minted,
        RunStep::Failed,
        RunStep::Notified,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::Scored => "SCORED",
            Self::EligibilityChecked => "ELIGIBILITY_CHECKED",
            Self::NotEligible => "NOT_ELIGIBLE",
            Self::NoWallet => "NO_WALLET",
            Self::MintAttempted => "MINT_ATTEMPTED",
            Self::Minted => "MINTED",
            Self::Failed => "FAILED",
            Self::Notified => "NOTIFIED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Notified)
    }

    /// Steps whose only remaining work is delivering the outcome.
    pub fn awaits_notification(&self) -> bool {
        matches!(
            self,
            Self::NotEligible | Self::NoWallet | Self::Minted | Self::Failed
        )
    }
}

impl fmt::Display for RunStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunTransitionError {
    #[error("run is terminal ({from}); cannot move to {to}")]
    Terminal { from: RunStep, to: RunStep },
    #[error("invalid run transition {from} -> {to}")]
    Invalid { from: RunStep, to: RunStep },
    #[error("run cannot be reopened from {from}")]
    NotReopenable { from: RunStep },
    #[error("run was abandoned")]
    Abandoned,
}

/// Forward transition table.
pub fn validate_run_transition(from: RunStep, to: RunStep) -> Result<(), RunTransitionError> {
    use RunStep::*;
    if from.is_terminal() {
        return Err(RunTransitionError::Terminal { from, to });
    }
    let ok = matches!(
        (from, to),
        (Started, Scored)
            | (Scored, EligibilityChecked)
            | (EligibilityChecked, NotEligible | NoWallet | MintAttempted)
            | (MintAttempted, Minted | Failed)
            | (NotEligible | NoWallet | Minted | Failed, Notified)
    );
    if ok {
        Ok(())
    } else {
        Err(RunTransitionError::Invalid { from, to })
    }
}

/// Terminal flavor of a run, known once the outcome step is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    Minted { tier: Option<Tier> },
    MintFailed,
    BelowThreshold,
    NoWallet,
}

impl RunOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Minted { .. } => "minted",
            Self::MintFailed => "mint_failed",
            Self::BelowThreshold => "below_threshold",
            Self::NoWallet => "no_wallet",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationStatus {
    Delivered { at_ms: u64 },
    Failed { reason: String },
}

/// Snapshot of the attestation as last seen by the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationRef {
    pub status: AttestationStatus,
    pub generation: u32,
    pub tx_hash: Option<String>,
    pub uid: Option<Hash32>,
}

/// Durable record of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub request: RatingRequest,
    pub step: RunStep,
    /// Step whose side effect has been started but not yet confirmed.
    pub pending_intent: Option<RunStep>,
    pub validation_id: Option<ValidationId>,
    pub score: Option<f64>,
    pub verdict: Option<EligibilityVerdict>,
    pub tier: Option<Tier>,
    pub attestation: Option<AttestationRef>,
    pub outcome: Option<RunOutcome>,
    pub notification: Option<NotificationStatus>,
    pub abandoned: bool,
    /// Set when the run's data cannot be advanced; `last_error` says why.
    pub quarantined: bool,
    pub last_error: Option<String>,
    pub step_errors: u32,
    /// Bumped by the store on every successful write; used for compare-and-swap.
    pub revision: u64,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl RunRecord {
    pub fn new(request: RatingRequest, now_ms: u64) -> Self {
        Self {
            run_id: request.run_id(),
            request,
            step: RunStep::Started,
            pending_intent: None,
            validation_id: None,
            score: None,
            verdict: None,
            tier: None,
            attestation: None,
            outcome: None,
            notification: None,
            abandoned: false,
            quarantined: false,
            last_error: None,
            step_errors: 0,
            revision: 0,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.step.is_terminal() || self.abandoned || self.quarantined
    }

    /// Park a run that cannot make progress. It keeps its step so an operator
    /// can inspect where it stopped.
    pub fn quarantine(&mut self, reason: String, now_ms: u64) {
        self.quarantined = true;
        self.pending_intent = None;
        self.record_error(reason, now_ms);
    }

    /// Record that the side effect leading to `next` is about to run.
    pub fn record_intent(&mut self, next: RunStep, now_ms: u64) -> Result<(), RunTransitionError> {
        if self.abandoned {
            return Err(RunTransitionError::Abandoned);
        }
        validate_run_transition(self.step, next)?;
        self.pending_intent = Some(next);
        self.updated_at_ms = now_ms;
        Ok(())
    }

    /// Record that the step completed.
    pub fn record_result(&mut self, next: RunStep, now_ms: u64) -> Result<(), RunTransitionError> {
        if self.abandoned {
            return Err(RunTransitionError::Abandoned);
        }
        validate_run_transition(self.step, next)?;
        self.step = next;
        self.pending_intent = None;
        self.last_error = None;
        self.updated_at_ms = now_ms;
        Ok(())
    }

    pub fn record_error(&mut self, error: String, now_ms: u64) {
        self.last_error = Some(error);
        self.step_errors = self.step_errors.saturating_add(1);
        self.updated_at_ms = now_ms;
    }

    /// True when the run's mint ended FAILED (before or after notification).
    pub fn mint_failed(&self) -> bool {
        match self.step {
            RunStep::Failed => true,
            RunStep::Notified => self.outcome == Some(RunOutcome::MintFailed),
            _ => false,
        }
    }

    /// Re-enter `MintAttempted` after a FAILED mint. The caller supersedes the
    /// attestation row first.
    pub fn reopen_for_mint(&mut self, now_ms: u64) -> Result<(), RunTransitionError> {
        if self.abandoned {
            return Err(RunTransitionError::Abandoned);
        }
        if !self.mint_failed() {
            return Err(RunTransitionError::NotReopenable { from: self.step });
        }
        self.step = RunStep::MintAttempted;
        self.pending_intent = None;
        self.outcome = None;
        self.notification = None;
        self.last_error = None;
        self.updated_at_ms = now_ms;
        Ok(())
    }
}

/// Count of runs per step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStepCounts {
    pub started: u64,
    pub scored: u64,
    pub eligibility_checked: u64,
    pub not_eligible: u64,
    pub no_wallet: u64,
    pub mint_attempted: u64,
    pub minted: u64,
    pub failed: u64,
    pub notified: u64,
    pub abandoned: u64,
    pub quarantined: u64,
}

impl RunStepCounts {
    pub fn add(&mut self, run: &RunRecord) {
        if run.abandoned {
            self.abandoned += 1;
            return;
        }
        if run.quarantined {
            self.quarantined += 1;
            return;
        }
        let slot = match run.step {
            RunStep::Started => &mut self.started,
            RunStep::Scored => &mut self.scored,
            RunStep::EligibilityChecked => &mut self.eligibility_checked,
            RunStep::NotEligible => &mut self.not_eligible,
            RunStep::NoWallet => &mut self.no_wallet,
            RunStep::MintAttempted => &mut self.mint_attempted,
            RunStep::Minted => &mut self.minted,
            RunStep::Failed => &mut self.failed,
            RunStep::Notified => &mut self.notified,
        };
        *slot += 1;
    }

    pub fn total(&self) -> u64 {
        self.in_flight() + self.notified + self.abandoned + self.quarantined
    }

    /// Runs that still have work to do.
    pub fn in_flight(&self) -> u64 {
        self.started
            + self.scored
            + self.eligibility_checked
            + self.not_eligible
            + self.no_wallet
            + self.mint_attempted
            + self.minted
            + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelId, MessageId, UserId};
    use crate::scoring::MetricRatings;

    fn run() -> RunRecord {
        RunRecord::new(
            RatingRequest {
                validator: UserId(1),
                target: UserId(2),
                channel: ChannelId(3),
                message: MessageId(4),
                metrics: MetricRatings::try_from_slice(&[1, 2, 3, 4, 5]).expect("metrics"),
            },
            100,
        )
    }

    #[test]
    fn forward_path_is_accepted() {
        use RunStep::*;
        for path in [
            vec![Started, Scored, EligibilityChecked, NotEligible, Notified],
            vec![Started, Scored, EligibilityChecked, NoWallet, Notified],
            vec![Started, Scored, EligibilityChecked, MintAttempted, Minted, Notified],
            vec![Started, Scored, EligibilityChecked, MintAttempted, Failed, Notified],
        ] {
            for pair in path.windows(2) {
                assert!(validate_run_transition(pair[0], pair[1]).is_ok(), "{pair:?}");
            }
        }
    }

    #[test]
    fn skips_and_backward_moves_are_rejected() {
        use RunStep::*;
        assert!(validate_run_transition(Started, EligibilityChecked).is_err());
        assert!(validate_run_transition(Scored, MintAttempted).is_err());
        assert!(validate_run_transition(EligibilityChecked, Minted).is_err());
        assert!(validate_run_transition(MintAttempted, Notified).is_err());
        assert!(validate_run_transition(Minted, MintAttempted).is_err());
        assert!(validate_run_transition(Failed, Minted).is_err());
        for to in RunStep::ALL {
            assert!(matches!(
                validate_run_transition(Notified, to),
                Err(RunTransitionError::Terminal { .. })
            ));
        }
    }

    #[test]
    fn intent_then_result() {
        let mut r = run();
        r.record_intent(RunStep::Scored, 110).expect("intent");
        assert_eq!(r.pending_intent, Some(RunStep::Scored));
        assert_eq!(r.step, RunStep::Started);
        r.record_result(RunStep::Scored, 120).expect("result");
        assert_eq!(r.pending_intent, None);
        assert_eq!(r.step, RunStep::Scored);
        assert!(r.record_intent(RunStep::Notified, 130).is_err());
    }

    #[test]
    fn reopen_only_after_failed_mint() {
        let mut r = run();
        assert!(matches!(
            r.reopen_for_mint(1),
            Err(RunTransitionError::NotReopenable { .. })
        ));
        r.step = RunStep::MintAttempted;
        assert!(r.reopen_for_mint(1).is_err());
        r.step = RunStep::Notified;
        r.outcome = Some(RunOutcome::MintFailed);
        r.reopen_for_mint(2).expect("reopen");
        assert_eq!(r.step, RunStep::MintAttempted);
        assert_eq!(r.outcome, None);

        let mut abandoned = run();
        abandoned.step = RunStep::Failed;
        abandoned.abandoned = true;
        assert_eq!(
            abandoned.reopen_for_mint(3),
            Err(RunTransitionError::Abandoned)
        );
    }

    #[test]
    fn counts_track_in_flight() {
        let mut counts = RunStepCounts::default();
        let mut a = run();
        counts.add(&a);
        a.step = RunStep::Notified;
        counts.add(&a);
        a.abandoned = true;
        counts.add(&a);
        assert_eq!(counts.started, 1);
        assert_eq!(counts.notified, 1);
        assert_eq!(counts.abandoned, 1);
        assert_eq!(counts.in_flight(), 1);
        assert_eq!(counts.total(), 3);
    }

    #[test]
    fn quarantined_run_is_finished_at_its_step() {
        let mut r = run();
        r.record_intent(RunStep::Scored, 110).expect("intent");
        r.quarantine("run has no score".to_string(), 120);
        assert!(r.is_finished());
        assert_eq!(r.step, RunStep::Started);
        assert_eq!(r.pending_intent, None);
        assert_eq!(r.last_error.as_deref(), Some("run has no score"));
        assert_eq!(r.step_errors, 1);

        let mut counts = RunStepCounts::default();
        counts.add(&r);
        assert_eq!(counts.quarantined, 1);
        assert_eq!(counts.started, 0);
        assert_eq!(counts.in_flight(), 0);
    }
}
