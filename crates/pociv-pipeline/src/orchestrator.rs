//! Run orchestrator.
//!
//! Drives a run through score -> eligibility -> mint -> notify. Each step is
//! two run writes: the intent (before the side effect) and the result
//! (after). A crash between the two leaves the intent on record and the next
//! `drive` repeats the step; every step's side effect is idempotent, so the
//! repeat converges on the same outcome.
//!
//! Runs are serialized in-process by a per-run lock and across processes by
//! the revision compare-and-swap on every run write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use pociv_core::{
    evaluate, now_ms, AttestationChain, AttestationRef, AttestationStatus, ChannelId,
    EligibilityVerdict, MessageId, MetricRatings, Notification, NotificationKind,
    NotificationStatus, Notifier, NotifyError, PersistenceGateway, RatingRequest, RunId,
    RunOutcome, RunRecord, RunStep, RunStepCounts, UserId, Validation,
};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::metrics::{
    NOTIFICATIONS_TOTAL, RUNS_QUARANTINED_TOTAL, RUNS_SUBMITTED_TOTAL, RUNS_TERMINAL_TOTAL,
    STEP_ERRORS_TOTAL,
};
use crate::minter::{AttestationMinter, MintOutcome, PriorGeneration};
use crate::{bounded, sanitize_error, PipelineConfig, PipelineError};

/// A rating as received from the platform, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRating {
    pub validator: UserId,
    pub target: UserId,
    pub channel: ChannelId,
    pub message: MessageId,
    pub metrics: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum SubmitDisposition {
    /// A new run was created at STARTED.
    Created,
    /// A run for this message already existed; the trigger joined it.
    Attached { step: RunStep },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubmitAck {
    pub run_id: RunId,
    #[serde(flatten)]
    pub disposition: SubmitDisposition,
}

/// Counts from one resume pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResumeSummary {
    pub scanned: usize,
    pub completed: usize,
    pub errored: usize,
}

pub struct Orchestrator {
    gateway: Arc<dyn PersistenceGateway>,
    notifier: Arc<dyn Notifier>,
    minter: AttestationMinter,
    config: PipelineConfig,
    locks: Mutex<HashMap<RunId, Arc<tokio::sync::Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        chain: Arc<dyn AttestationChain>,
        notifier: Arc<dyn Notifier>,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let minter = AttestationMinter::new(
            chain,
            gateway.clone(),
            config.attestation.clone(),
            config.mint.clone(),
            Duration::from_millis(config.gateway_timeout_ms),
        );
        Ok(Self {
            gateway,
            notifier,
            minter,
            config,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn gateway_timeout(&self) -> Duration {
        Duration::from_millis(self.config.gateway_timeout_ms)
    }

    /// Validate a rating and create its run, or attach to the run that
    /// already exists for the same message.
    pub async fn submit_rating(&self, rating: SubmitRating) -> Result<SubmitAck, PipelineError> {
        let metrics = MetricRatings::try_from_slice(&rating.metrics)?;
        let request = RatingRequest {
            validator: rating.validator,
            target: rating.target,
            channel: rating.channel,
            message: rating.message,
            metrics,
        };
        let now = now_ms();
        bounded(self.gateway_timeout(), self.gateway.ensure_user(request.target, now)).await?;
        bounded(
            self.gateway_timeout(),
            self.gateway.ensure_user(request.validator, now),
        )
        .await?;

        let run = RunRecord::new(request, now);
        let run_id = run.run_id;
        let created = bounded(self.gateway_timeout(), self.gateway.create_run(&run)).await?;
        let disposition = if created.was_created() {
            info!(run = %run_id, target = %run.request.target, "run created");
            SubmitDisposition::Created
        } else {
            let existing = created.into_inner();
            if existing.request != run.request {
                warn!(
                    run = %run_id,
                    "duplicate trigger carries a different rating; keeping the first"
                );
            }
            debug!(run = %run_id, step = %existing.step, "duplicate trigger attached");
            SubmitDisposition::Attached {
                step: existing.step,
            }
        };
        let label = match disposition {
            SubmitDisposition::Created => "created",
            SubmitDisposition::Attached { .. } => "attached",
        };
        RUNS_SUBMITTED_TOTAL.with_label_values(&[label]).inc();
        Ok(SubmitAck {
            run_id,
            disposition,
        })
    }

    fn run_lock(&self, run_id: RunId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(run_id).or_default().clone()
    }

    fn release_lock(&self, run_id: &RunId) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.remove(run_id);
    }

    /// Advance a run until it is finished or a step fails.
    pub async fn drive(&self, run_id: RunId) -> Result<RunRecord, PipelineError> {
        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;
        let result = self.drive_locked(run_id).await;
        if matches!(&result, Ok(run) if run.is_finished()) {
            self.release_lock(&run_id);
        }
        result
    }

    async fn drive_locked(&self, run_id: RunId) -> Result<RunRecord, PipelineError> {
        let mut run = self.load(&run_id).await?;
        if let Some(intent) = run.pending_intent {
            info!(run = %run_id, step = %run.step, intent = %intent, "resuming unconfirmed step");
        }
        while !run.is_finished() {
            let step = run.step;
            match self.advance(run).await {
                Ok(next) => run = next,
                Err(err) => {
                    self.record_failure(&run_id, step, &err).await;
                    return Err(err);
                }
            }
        }
        Ok(run)
    }

    async fn load(&self, run_id: &RunId) -> Result<RunRecord, PipelineError> {
        bounded(self.gateway_timeout(), self.gateway.get_run(run_id))
            .await?
            .ok_or(PipelineError::RunNotFound(*run_id))
    }

    async fn save(&self, run: &RunRecord) -> Result<RunRecord, PipelineError> {
        Ok(bounded(self.gateway_timeout(), self.gateway.update_run(run)).await?)
    }

    async fn record_failure(&self, run_id: &RunId, step: RunStep, err: &PipelineError) {
        STEP_ERRORS_TOTAL.with_label_values(&[step.name()]).inc();
        warn!(run = %run_id, step = %step, error = %err, fatal = err.is_fatal(), "run step failed");
        let mut run = match bounded(self.gateway_timeout(), self.gateway.get_run(run_id)).await {
            Ok(Some(run)) if !run.is_finished() => run,
            Ok(_) => return,
            Err(e) => {
                debug!(run = %run_id, error = %e, "could not reload run to record error");
                return;
            }
        };
        if err.is_run_defect() {
            error!(run = %run_id, step = %step, error = %err, "run quarantined");
            RUNS_QUARANTINED_TOTAL.inc();
            run.quarantine(sanitize_error(err), now_ms());
        } else {
            run.record_error(sanitize_error(err), now_ms());
        }
        if let Err(e) = self.save(&run).await {
            debug!(run = %run_id, error = %e, "could not record run error");
        }
    }

    /// Execute exactly one step: persist intent, perform the effect, persist the result.
    async fn advance(&self, mut run: RunRecord) -> Result<RunRecord, PipelineError> {
        match run.step {
            RunStep::Started => {
                run.record_intent(RunStep::Scored, now_ms())?;
                let mut run = self.save(&run).await?;
                let validation = Validation::from_request(run.run_id, &run.request, now_ms());
                let stored = bounded(
                    self.gateway_timeout(),
                    self.gateway.insert_validation(&validation),
                )
                .await?
                .into_inner();
                run.validation_id = Some(stored.id);
                run.score = Some(stored.score);
                run.tier = self.config.tiers.tier_for(stored.score);
                run.record_result(RunStep::Scored, now_ms())?;
                let run = self.save(&run).await?;
                info!(
                    run = %run.run_id,
                    validation = %stored.id,
                    score = stored.score,
                    metrics = %stored.metrics,
                    "rating scored"
                );
                Ok(run)
            }
            RunStep::Scored => {
                let score = run.score.ok_or_else(|| missing(&run, "score"))?;
                run.record_intent(RunStep::EligibilityChecked, now_ms())?;
                let mut run = self.save(&run).await?;
                let target = bounded(
                    self.gateway_timeout(),
                    self.gateway.get_user(run.request.target),
                )
                .await?;
                let verdict = evaluate(score, self.config.eligibility_threshold, target.as_ref());
                info!(run = %run.run_id, score, verdict = %verdict, "eligibility checked");
                run.verdict = Some(verdict);
                run.record_result(RunStep::EligibilityChecked, now_ms())?;
                self.save(&run).await
            }
            RunStep::EligibilityChecked => {
                let verdict = run.verdict.clone().ok_or_else(|| missing(&run, "verdict"))?;
                let (next, outcome) = match verdict {
                    EligibilityVerdict::Eligible { .. } => (RunStep::MintAttempted, None),
                    EligibilityVerdict::BelowThreshold => {
                        (RunStep::NotEligible, Some(RunOutcome::BelowThreshold))
                    }
                    EligibilityVerdict::NoWallet => (RunStep::NoWallet, Some(RunOutcome::NoWallet)),
                };
                run.record_intent(next, now_ms())?;
                let mut run = self.save(&run).await?;
                run.outcome = outcome;
                run.record_result(next, now_ms())?;
                self.save(&run).await
            }
            RunStep::MintAttempted => self.mint_step(run).await,
            RunStep::NotEligible | RunStep::NoWallet | RunStep::Minted | RunStep::Failed => {
                self.notify_step(run).await
            }
            RunStep::Notified => Ok(run),
        }
    }

    async fn mint_step(&self, mut run: RunRecord) -> Result<RunRecord, PipelineError> {
        let validation_id = run
            .validation_id
            .ok_or_else(|| missing(&run, "validation id"))?;
        let recipient = run
            .verdict
            .as_ref()
            .and_then(EligibilityVerdict::recipient)
            .cloned()
            .ok_or_else(|| missing(&run, "recipient"))?;
        run.record_intent(RunStep::Minted, now_ms())?;
        let mut run = self.save(&run).await?;

        let validation = bounded(
            self.gateway_timeout(),
            self.gateway.get_validation(&validation_id),
        )
        .await?
        .ok_or_else(|| {
            PipelineError::Invariant(format!(
                "run {} references missing validation {validation_id}",
                run.run_id
            ))
        })?;
        let outcome = self.minter.mint(&validation, &recipient).await?;
        let record = outcome.record();
        run.attestation = Some(AttestationRef {
            status: record.status,
            generation: record.generation,
            tx_hash: record.tx_hash.clone(),
            uid: record.attestation_uid,
        });
        let next = match outcome {
            MintOutcome::Minted(_) => {
                run.outcome = Some(RunOutcome::Minted { tier: run.tier });
                RunStep::Minted
            }
            MintOutcome::Failed(_) => {
                run.outcome = Some(RunOutcome::MintFailed);
                RunStep::Failed
            }
        };
        run.record_result(next, now_ms())?;
        self.save(&run).await
    }

    async fn notify_step(&self, mut run: RunRecord) -> Result<RunRecord, PipelineError> {
        run.record_intent(RunStep::Notified, now_ms())?;
        let mut run = self.save(&run).await?;
        let notification = self.notification_for(&run).await?;

        let limit = Duration::from_millis(self.config.notify_timeout_ms);
        let delivered = timeout(limit, self.notifier.deliver(&notification))
            .await
            .unwrap_or(Err(NotifyError::Timeout));
        let status = match delivered {
            Ok(()) => {
                NOTIFICATIONS_TOTAL.with_label_values(&["delivered"]).inc();
                NotificationStatus::Delivered { at_ms: now_ms() }
            }
            Err(err) => {
                let label = match err {
                    NotifyError::Timeout => "timeout",
                    _ => "failed",
                };
                NOTIFICATIONS_TOTAL.with_label_values(&[label]).inc();
                warn!(run = %run.run_id, kind = notification.kind_name(), error = %err, "notification not delivered");
                NotificationStatus::Failed {
                    reason: sanitize_error(&err),
                }
            }
        };
        run.notification = Some(status);
        run.record_result(RunStep::Notified, now_ms())?;
        let run = self.save(&run).await?;
        let outcome = run.outcome.as_ref().map_or("unknown", RunOutcome::name);
        RUNS_TERMINAL_TOTAL.with_label_values(&[outcome]).inc();
        info!(run = %run.run_id, outcome, "run complete");
        Ok(run)
    }

    async fn notification_for(&self, run: &RunRecord) -> Result<Notification, PipelineError> {
        let score = run.score.ok_or_else(|| missing(run, "score"))?;
        let outcome = run.outcome.as_ref().ok_or_else(|| missing(run, "outcome"))?;
        let kind = match outcome {
            RunOutcome::Minted { tier } => {
                let uid = run
                    .attestation
                    .as_ref()
                    .and_then(|a| a.uid)
                    .ok_or_else(|| missing(run, "attestation uid"))?;
                NotificationKind::Minted {
                    tier: *tier,
                    score,
                    attestation_uid: uid,
                    explorer_url: self.config.attestation.explorer_url(&uid),
                }
            }
            RunOutcome::MintFailed => {
                let validation_id = run
                    .validation_id
                    .ok_or_else(|| missing(run, "validation id"))?;
                let record = bounded(
                    self.gateway_timeout(),
                    self.gateway.get_attestation(&validation_id),
                )
                .await?;
                let reason = record
                    .and_then(|r| r.last_error)
                    .unwrap_or_else(|| "mint failed".to_string());
                NotificationKind::MintFailed { score, reason }
            }
            RunOutcome::BelowThreshold => NotificationKind::BelowThreshold {
                score,
                threshold: self.config.eligibility_threshold,
            },
            RunOutcome::NoWallet => NotificationKind::NoWallet { score },
        };
        Ok(Notification {
            run_id: run.run_id,
            recipient: run.request.target,
            kind,
        })
    }

    /// Ids of runs with work left. Successive calls page through the store,
    /// so runs that keep failing do not hide the rest.
    pub async fn unfinished_runs(&self, limit: usize) -> Result<Vec<RunId>, PipelineError> {
        let runs = bounded(
            self.gateway_timeout(),
            self.gateway.list_unfinished_runs(limit),
        )
        .await?;
        Ok(runs.into_iter().map(|r| r.run_id).collect())
    }

    /// Drive every unfinished run once, in order. Errors are recorded on the
    /// run and counted; they do not stop the pass.
    pub async fn resume_all(&self, limit: usize) -> Result<ResumeSummary, PipelineError> {
        let ids = self.unfinished_runs(limit).await?;
        let mut summary = ResumeSummary {
            scanned: ids.len(),
            ..ResumeSummary::default()
        };
        for run_id in ids {
            match self.drive(run_id).await {
                Ok(run) if run.is_finished() => summary.completed += 1,
                Ok(_) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(_) => summary.errored += 1,
            }
        }
        if summary.scanned > 0 {
            info!(
                scanned = summary.scanned,
                completed = summary.completed,
                errored = summary.errored,
                "resume pass finished"
            );
        }
        Ok(summary)
    }

    /// Stop a run whose mint failed. It will not be retried or resumed.
    pub async fn abandon(&self, run_id: RunId) -> Result<RunRecord, PipelineError> {
        let lock = self.run_lock(run_id);
        let guard = lock.lock().await;
        let mut run = self.load(&run_id).await?;
        if run.abandoned {
            return Ok(run);
        }
        if !run.mint_failed() {
            return Err(PipelineError::NotAbandonable {
                run_id,
                step: run.step,
            });
        }
        run.abandoned = true;
        run.updated_at_ms = now_ms();
        let run = self.save(&run).await?;
        drop(guard);
        self.release_lock(&run_id);
        warn!(run = %run_id, "run abandoned after failed mint");
        Ok(run)
    }

    /// Reopen a run whose mint ended FAILED: supersede the failed attestation
    /// with a fresh generation and move the run back to MINT_ATTEMPTED. The
    /// caller drives it afterwards.
    ///
    /// The failed generation is checked on chain first. If its transaction is
    /// still pending or has landed, nothing is superseded.
    pub async fn retry_failed_mint(&self, run_id: RunId) -> Result<RunRecord, PipelineError> {
        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;
        let mut run = self.load(&run_id).await?;
        if run.abandoned || !run.mint_failed() {
            return Err(PipelineError::NotRetryable {
                run_id,
                step: run.step,
            });
        }
        let validation_id = run
            .validation_id
            .ok_or_else(|| missing(&run, "validation id"))?;
        let current = bounded(
            self.gateway_timeout(),
            self.gateway.get_attestation(&validation_id),
        )
        .await?;
        match current {
            Some(failed) if failed.status == AttestationStatus::Failed => {
                match self.minter.check_prior_generation(&failed).await? {
                    PriorGeneration::Clear => {}
                    PriorGeneration::InFlight(tx_hash) => {
                        warn!(run = %run_id, tx_hash = %tx_hash, "failed generation still has a transaction in flight");
                        return Err(PipelineError::MintUnresolved {
                            validation: validation_id,
                            tx_hash,
                        });
                    }
                    PriorGeneration::Landed(receipt) => {
                        error!(
                            run = %run_id,
                            generation = failed.generation,
                            tx_hash = %receipt.tx_hash,
                            "attestation recorded FAILED is on chain; refusing to mint another"
                        );
                        return Err(PipelineError::PriorGenerationLanded {
                            run_id,
                            generation: failed.generation,
                            tx_hash: receipt.tx_hash,
                        });
                    }
                }
                let fresh = bounded(
                    self.gateway_timeout(),
                    self.gateway.supersede_attestation(&validation_id, now_ms()),
                )
                .await?;
                info!(run = %run_id, generation = fresh.generation, "failed attestation superseded");
            }
            // Already superseded by an earlier retry that did not finish, or
            // no attestation row at all: the minter picks up from here.
            _ => {}
        }
        run.reopen_for_mint(now_ms())?;
        self.save(&run).await
    }

    pub async fn get_run(&self, run_id: &RunId) -> Result<Option<RunRecord>, PipelineError> {
        Ok(bounded(self.gateway_timeout(), self.gateway.get_run(run_id)).await?)
    }

    pub async fn counts(&self) -> Result<RunStepCounts, PipelineError> {
        Ok(bounded(self.gateway_timeout(), self.gateway.count_runs()).await?)
    }
}

fn missing(run: &RunRecord, what: &str) -> PipelineError {
    PipelineError::Invariant(format!(
        "run {} at {} has no {what}",
        run.run_id, run.step
    ))
}
