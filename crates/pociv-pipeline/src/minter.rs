//! Attestation minter.
//!
//! Turns an eligible validation into exactly one landed attestation, or a
//! FAILED record once the attempt budget is spent.
//!
//! ## Attempt Loop
//!
//! ```text
//! loop:
//!   stored MINTED/FAILED          -> return it (no broadcast)
//!   known tx mined ok / key found -> MINTED
//!   attempts == max, tx unmined   -> wait once more; still unmined -> MintUnresolved
//!   attempts == max               -> FAILED
//!   backoff, attempts += 1 (persisted before any broadcast)
//!   known tx still unmined        -> wait for its receipt, do not re-send
//!   otherwise                     -> broadcast, persist tx hash, wait for receipt
//! ```
//!
//! A broadcast that times out is ambiguous: the next iteration's lookup by
//! mint key decides whether it landed before anything is sent again.
//!
//! FAILED is only written once no broadcast transaction can still land. A
//! generation that runs out of slots with a transaction still unmined stays
//! PENDING and the run is left for a later pass.

use std::sync::Arc;
use std::time::Duration;

use pociv_core::chain::{AttestationChain, AttestationRequest, ChainError, TxReceipt};
use pociv_core::payload::{AttestationPayload, AttestationSettings};
use pociv_core::{
    now_ms, AttestationRecord, AttestationStatus, PersistenceGateway, Validation, ValidationId,
    WalletAddress,
};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::metrics::MINT_ATTEMPTS_TOTAL;
use crate::{bounded, sanitize_error, MintConfig, PipelineError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MintOutcome {
    Minted(AttestationRecord),
    Failed(AttestationRecord),
}

impl MintOutcome {
    pub fn record(&self) -> &AttestationRecord {
        match self {
            Self::Minted(r) | Self::Failed(r) => r,
        }
    }
}

/// What the chain says about the current generation before the next attempt.
enum ChainView {
    Landed(TxReceipt),
    /// A broadcast transaction exists but is not mined yet.
    InFlight(String),
    /// The known transaction was mined and reverted.
    Reverted(String),
    NotLanded,
}

/// Where a FAILED generation stands on chain before it is superseded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriorGeneration {
    /// Nothing landed and nothing is pending.
    Clear,
    InFlight(String),
    Landed(TxReceipt),
}

enum ReceiptWait {
    Confirmed(TxReceipt),
    Reverted,
    Pending,
}

pub struct AttestationMinter {
    chain: Arc<dyn AttestationChain>,
    gateway: Arc<dyn PersistenceGateway>,
    settings: AttestationSettings,
    config: MintConfig,
    gateway_timeout: Duration,
}

impl AttestationMinter {
    pub fn new(
        chain: Arc<dyn AttestationChain>,
        gateway: Arc<dyn PersistenceGateway>,
        settings: AttestationSettings,
        config: MintConfig,
        gateway_timeout: Duration,
    ) -> Self {
        Self {
            chain,
            gateway,
            settings,
            config,
            gateway_timeout,
        }
    }

    /// Encode the payload for a validation and check it decodes back unchanged.
    pub fn encode(&self, validation: &Validation) -> Result<Vec<u8>, PipelineError> {
        let payload = AttestationPayload::from_validation(validation, &self.settings)?;
        let data = payload.encode();
        if AttestationPayload::decode(&data)? != payload {
            return Err(PipelineError::Invariant(format!(
                "payload for validation {} does not survive a decode",
                validation.id
            )));
        }
        Ok(data)
    }

    /// Mint the attestation for `validation`, or return the one already on record.
    pub async fn mint(
        &self,
        validation: &Validation,
        recipient: &WalletAddress,
    ) -> Result<MintOutcome, PipelineError> {
        let data = self.encode(validation)?;
        let mut record = self.load_or_create(validation.id, recipient).await?;

        loop {
            match record.status {
                AttestationStatus::Minted => {
                    debug!(validation = %validation.id, "attestation already minted");
                    return Ok(MintOutcome::Minted(record));
                }
                AttestationStatus::Failed => return Ok(MintOutcome::Failed(record)),
                AttestationStatus::Pending => {}
            }

            let in_flight = match self.chain_view(&record).await? {
                ChainView::Landed(receipt) => {
                    MINT_ATTEMPTS_TOTAL.with_label_values(&["found_landed"]).inc();
                    return self.finish_minted(record, receipt).await;
                }
                ChainView::InFlight(tx) => Some(tx),
                ChainView::Reverted(tx) => {
                    let mut next = record.clone();
                    next.tx_hash = None;
                    next.last_error = Some(format!("transaction {tx} reverted"));
                    next.updated_at_ms = now_ms();
                    record = self.persist(&record, next).await?;
                    None
                }
                ChainView::NotLanded => None,
            };

            if record.attempts >= self.config.max_attempts {
                let Some(tx) = in_flight else {
                    return self.finish_failed(record).await;
                };
                match self.await_receipt(&tx).await {
                    ReceiptWait::Confirmed(receipt) => {
                        return self.finish_minted(record, receipt).await
                    }
                    ReceiptWait::Reverted => {
                        MINT_ATTEMPTS_TOTAL.with_label_values(&["reverted"]).inc();
                        continue;
                    }
                    ReceiptWait::Pending => {
                        MINT_ATTEMPTS_TOTAL.with_label_values(&["unresolved"]).inc();
                        warn!(
                            validation = %record.validation_id,
                            attempts = record.attempts,
                            tx_hash = %tx,
                            "attempt budget spent with a transaction still unmined; leaving PENDING"
                        );
                        return Err(PipelineError::MintUnresolved {
                            validation: record.validation_id,
                            tx_hash: tx,
                        });
                    }
                }
            }

            if record.attempts > 0 {
                let delay = self.config.backoff(record.attempts);
                debug!(
                    validation = %record.validation_id,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "backing off before next attempt"
                );
                sleep(delay).await;
            }

            let mut next = record.clone();
            next.attempts = next.attempts.saturating_add(1);
            if in_flight.is_none() {
                next.broadcasts = next.broadcasts.saturating_add(1);
            }
            next.updated_at_ms = now_ms();
            record = self.persist(&record, next).await?;
            let attempt = record.attempts;

            let tx_hash = match in_flight {
                Some(tx) => {
                    info!(
                        validation = %record.validation_id,
                        attempt,
                        tx_hash = %tx,
                        "previous broadcast still unmined; waiting instead of re-sending"
                    );
                    MINT_ATTEMPTS_TOTAL.with_label_values(&["waited"]).inc();
                    tx
                }
                None => match self.broadcast(&record, &data, attempt).await {
                    Ok(tx) => {
                        let mut next = record.clone();
                        next.tx_hash = Some(tx.clone());
                        next.updated_at_ms = now_ms();
                        record = self.persist(&record, next).await?;
                        tx
                    }
                    Err(err) => {
                        let mut next = record.clone();
                        next.last_error = Some(sanitize_error(&err));
                        next.updated_at_ms = now_ms();
                        record = self.persist(&record, next).await?;
                        continue;
                    }
                },
            };

            match self.await_receipt(&tx_hash).await {
                ReceiptWait::Confirmed(receipt) => return self.finish_minted(record, receipt).await,
                ReceiptWait::Reverted => {
                    warn!(validation = %record.validation_id, attempt, tx_hash = %tx_hash, "attestation transaction reverted");
                    MINT_ATTEMPTS_TOTAL.with_label_values(&["reverted"]).inc();
                    // The next iteration's chain view clears the reverted hash.
                }
                ReceiptWait::Pending => {
                    warn!(validation = %record.validation_id, attempt, tx_hash = %tx_hash, "receipt not observed within timeout");
                    MINT_ATTEMPTS_TOTAL.with_label_values(&["receipt_timeout"]).inc();
                    let mut next = record.clone();
                    next.last_error = Some(format!("transaction {tx_hash} not mined in time"));
                    next.updated_at_ms = now_ms();
                    record = self.persist(&record, next).await?;
                }
            }
        }
    }

    /// Check a FAILED generation's mint key and last transaction on chain.
    /// Chain errors propagate: an unreadable chain is never reported clear.
    pub async fn check_prior_generation(
        &self,
        record: &AttestationRecord,
    ) -> Result<PriorGeneration, PipelineError> {
        Ok(match self.chain_view(record).await? {
            ChainView::Landed(receipt) => PriorGeneration::Landed(receipt),
            ChainView::InFlight(tx) => PriorGeneration::InFlight(tx),
            ChainView::Reverted(_) | ChainView::NotLanded => PriorGeneration::Clear,
        })
    }

    async fn load_or_create(
        &self,
        validation_id: ValidationId,
        recipient: &WalletAddress,
    ) -> Result<AttestationRecord, PipelineError> {
        if let Some(existing) =
            bounded(self.gateway_timeout, self.gateway.get_attestation(&validation_id)).await?
        {
            return Ok(existing);
        }
        let fresh = AttestationRecord::pending(validation_id, recipient.clone(), 0, now_ms());
        let stored = bounded(self.gateway_timeout, self.gateway.create_attestation(&fresh)).await?;
        Ok(stored.into_inner())
    }

    async fn persist(
        &self,
        current: &AttestationRecord,
        next: AttestationRecord,
    ) -> Result<AttestationRecord, PipelineError> {
        bounded(
            self.gateway_timeout,
            self.gateway.update_attestation(current, &next),
        )
        .await?;
        Ok(next)
    }

    async fn chain_call<T, F>(&self, fut: F) -> Result<T, ChainError>
    where
        F: std::future::Future<Output = Result<T, ChainError>>,
    {
        timeout(Duration::from_millis(self.config.submit_timeout_ms), fut)
            .await
            .unwrap_or(Err(ChainError::Timeout))
    }

    /// Read-only check of the chain. Errors propagate: without an answer the
    /// minter must not broadcast.
    async fn chain_view(&self, record: &AttestationRecord) -> Result<ChainView, PipelineError> {
        let mut pending_tx = None;
        if let Some(tx) = &record.tx_hash {
            match self.chain_call(self.chain.get_receipt(tx)).await? {
                Some(receipt) if receipt.success => return Ok(ChainView::Landed(receipt)),
                Some(_) => return Ok(ChainView::Reverted(tx.clone())),
                None => pending_tx = Some(tx.clone()),
            }
        }
        match self
            .chain_call(self.chain.find_attestation(&record.mint_key))
            .await?
        {
            Some(receipt) if receipt.success => Ok(ChainView::Landed(receipt)),
            _ => Ok(pending_tx.map_or(ChainView::NotLanded, ChainView::InFlight)),
        }
    }

    async fn broadcast(
        &self,
        record: &AttestationRecord,
        data: &[u8],
        attempt: u32,
    ) -> Result<String, ChainError> {
        let request = AttestationRequest {
            schema_uid: self.settings.schema_uid,
            chain_id: self.settings.chain_id,
            recipient: record.recipient.clone(),
            data: data.to_vec(),
            mint_key: record.mint_key,
        };
        info!(
            validation = %record.validation_id,
            generation = record.generation,
            attempt,
            "broadcasting attestation"
        );
        match self
            .chain_call(self.chain.submit_attestation(&request))
            .await
        {
            Ok(receipt) => {
                MINT_ATTEMPTS_TOTAL.with_label_values(&["broadcast_ok"]).inc();
                info!(
                    validation = %record.validation_id,
                    attempt,
                    tx_hash = %receipt.tx_hash,
                    already_known = receipt.already_known,
                    "attestation broadcast accepted"
                );
                Ok(receipt.tx_hash)
            }
            Err(err) => {
                MINT_ATTEMPTS_TOTAL.with_label_values(&[err.kind()]).inc();
                if err.is_ambiguous() {
                    warn!(
                        validation = %record.validation_id,
                        attempt,
                        error = %err,
                        "broadcast outcome unknown; will look it up before retrying"
                    );
                } else {
                    warn!(validation = %record.validation_id, attempt, error = %err, "broadcast failed");
                }
                Err(err)
            }
        }
    }

    async fn await_receipt(&self, tx_hash: &str) -> ReceiptWait {
        let deadline = Instant::now() + Duration::from_millis(self.config.receipt_timeout_ms);
        let poll = Duration::from_millis(self.config.receipt_poll_ms.max(1));
        loop {
            match self.chain_call(self.chain.get_receipt(tx_hash)).await {
                Ok(Some(receipt)) if receipt.success => return ReceiptWait::Confirmed(receipt),
                Ok(Some(_)) => return ReceiptWait::Reverted,
                Ok(None) => {}
                Err(err) => debug!(tx_hash, error = %err, "receipt poll failed"),
            }
            let now = Instant::now();
            if now >= deadline {
                return ReceiptWait::Pending;
            }
            sleep(poll.min(deadline - now)).await;
        }
    }

    async fn finish_minted(
        &self,
        record: AttestationRecord,
        receipt: TxReceipt,
    ) -> Result<MintOutcome, PipelineError> {
        let uid = receipt.attestation_uid.ok_or_else(|| {
            ChainError::Decode(format!(
                "receipt for {} has no attestation uid",
                receipt.tx_hash
            ))
        })?;
        let mut next = record.clone();
        next.mark_minted(receipt.tx_hash.clone(), uid, now_ms());
        let stored = self.persist(&record, next).await?;
        MINT_ATTEMPTS_TOTAL.with_label_values(&["minted"]).inc();
        info!(
            validation = %stored.validation_id,
            tx_hash = %receipt.tx_hash,
            attestation_uid = %uid,
            attempts = stored.attempts,
            "attestation minted"
        );
        Ok(MintOutcome::Minted(stored))
    }

    async fn finish_failed(&self, record: AttestationRecord) -> Result<MintOutcome, PipelineError> {
        let reason = format!(
            "retry budget exhausted after {} attempts: {}",
            record.attempts,
            record.last_error.as_deref().unwrap_or("unknown error")
        );
        let mut next = record.clone();
        next.mark_failed(sanitize_error(&reason), now_ms());
        let stored = self.persist(&record, next).await?;
        MINT_ATTEMPTS_TOTAL.with_label_values(&["exhausted"]).inc();
        warn!(
            validation = %stored.validation_id,
            attempts = stored.attempts,
            broadcasts = stored.broadcasts,
            reason = %reason,
            "attestation mint failed"
        );
        Ok(MintOutcome::Failed(stored))
    }
}
