//! Deterministic in-process attestation chain.
//!
//! Submissions are deduplicated by mint key, tx hashes and attestation uids
//! are derived from the key, and failures can be scripted for tests and
//! offline runs.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{AttestationChain, AttestationRequest, ChainError, SubmitReceipt, TxReceipt};
use crate::canonical::Hash32;
use crate::model::MintKey;

/// Scripted behavior for the next submit call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitFault {
    /// Reject without recording the transaction.
    Reject(String),
    /// Fail with a network error without recording the transaction.
    Unreachable,
    /// Record the transaction, then report a timeout to the caller.
    LandThenTimeout,
    /// Record the transaction as mined but reverted.
    Revert,
}

#[derive(Debug, Clone)]
struct StoredTx {
    tx_hash: String,
    success: bool,
    block_number: u64,
    mined: bool,
    data_hash: Hash32,
}

#[derive(Debug, Default)]
struct MockState {
    by_key: HashMap<MintKey, StoredTx>,
    by_hash: HashMap<String, MintKey>,
    faults: VecDeque<SubmitFault>,
    broadcasts: u64,
    height: u64,
    hold_receipts: bool,
    lookups_unavailable: bool,
}

#[derive(Debug, Default)]
pub struct MockAttestationChain {
    state: Mutex<MockState>,
}

impl MockAttestationChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue faults consumed by the next submit calls, in order.
    pub fn push_faults(&self, faults: impl IntoIterator<Item = SubmitFault>) {
        let mut st = self.state.lock().expect("mutex poisoned");
        st.faults.extend(faults);
    }

    /// Reject the next `n` submits.
    pub fn fail_submits(&self, n: usize) {
        self.push_faults((0..n).map(|i| SubmitFault::Reject(format!("scripted failure {i}"))));
    }

    /// While set, landed transactions stay unmined.
    pub fn hold_receipts(&self, hold: bool) {
        let mut st = self.state.lock().expect("mutex poisoned");
        st.hold_receipts = hold;
        if !hold {
            for tx in st.by_key.values_mut() {
                tx.mined = true;
            }
        }
    }

    /// While set, receipt and lookup queries fail with a network error.
    pub fn lookups_unavailable(&self, unavailable: bool) {
        let mut st = self.state.lock().expect("mutex poisoned");
        st.lookups_unavailable = unavailable;
    }

    /// Number of submit calls received, including failed and duplicate ones.
    pub fn broadcast_count(&self) -> u64 {
        self.state.lock().expect("mutex poisoned").broadcasts
    }

    /// Number of distinct attestations that landed successfully.
    pub fn landed_count(&self) -> usize {
        self.state
            .lock()
            .expect("mutex poisoned")
            .by_key
            .values()
            .filter(|tx| tx.success)
            .count()
    }

    /// BLAKE3 of the payload recorded for a key.
    pub fn payload_hash(&self, key: &MintKey) -> Option<Hash32> {
        let st = self.state.lock().expect("mutex poisoned");
        st.by_key.get(key).map(|tx| tx.data_hash)
    }

    pub fn attestation_uid(key: &MintKey) -> Hash32 {
        Hash32::derive(b"mock.attestation.uid", &[&key.0 .0])
    }

    fn tx_hash(key: &MintKey) -> String {
        format!(
            "0x{}",
            Hash32::derive(b"mock.attestation.tx", &[&key.0 .0]).to_hex()
        )
    }

    fn record(st: &mut MockState, request: &AttestationRequest, success: bool) -> String {
        st.height = st.height.saturating_add(1);
        let tx_hash = Self::tx_hash(&request.mint_key);
        let stored = StoredTx {
            tx_hash: tx_hash.clone(),
            success,
            block_number: st.height,
            mined: !st.hold_receipts,
            data_hash: Hash32(blake3::hash(&request.data).into()),
        };
        st.by_hash.insert(tx_hash.clone(), request.mint_key);
        st.by_key.insert(request.mint_key, stored);
        tx_hash
    }

    fn receipt(key: &MintKey, tx: &StoredTx) -> TxReceipt {
        TxReceipt {
            tx_hash: tx.tx_hash.clone(),
            success: tx.success,
            attestation_uid: tx.success.then(|| Self::attestation_uid(key)),
            block_number: Some(tx.block_number),
        }
    }
}

#[async_trait]
impl AttestationChain for MockAttestationChain {
    async fn submit_attestation(
        &self,
        request: &AttestationRequest,
    ) -> Result<SubmitReceipt, ChainError> {
        let mut st = self.state.lock().expect("mutex poisoned");
        st.broadcasts = st.broadcasts.saturating_add(1);

        if let Some(existing) = st.by_key.get(&request.mint_key) {
            if existing.success {
                return Ok(SubmitReceipt {
                    tx_hash: existing.tx_hash.clone(),
                    already_known: true,
                });
            }
        }

        match st.faults.pop_front() {
            Some(SubmitFault::Reject(reason)) => Err(ChainError::Rejected(reason)),
            Some(SubmitFault::Unreachable) => {
                Err(ChainError::Network("mock chain unreachable".to_string()))
            }
            Some(SubmitFault::LandThenTimeout) => {
                Self::record(&mut st, request, true);
                Err(ChainError::Timeout)
            }
            Some(SubmitFault::Revert) => {
                let tx_hash = Self::record(&mut st, request, false);
                Ok(SubmitReceipt {
                    tx_hash,
                    already_known: false,
                })
            }
            None => {
                let tx_hash = Self::record(&mut st, request, true);
                Ok(SubmitReceipt {
                    tx_hash,
                    already_known: false,
                })
            }
        }
    }

    async fn get_receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>, ChainError> {
        let st = self.state.lock().expect("mutex poisoned");
        if st.lookups_unavailable {
            return Err(ChainError::Network("mock chain unreachable".to_string()));
        }
        Ok(st
            .by_hash
            .get(tx_hash)
            .and_then(|key| st.by_key.get(key).map(|tx| (key, tx)))
            .filter(|(_, tx)| tx.mined)
            .map(|(key, tx)| Self::receipt(key, tx)))
    }

    async fn find_attestation(&self, mint_key: &MintKey) -> Result<Option<TxReceipt>, ChainError> {
        let st = self.state.lock().expect("mutex poisoned");
        if st.lookups_unavailable {
            return Err(ChainError::Network("mock chain unreachable".to_string()));
        }
        Ok(st
            .by_key
            .get(mint_key)
            .filter(|tx| tx.mined && tx.success)
            .map(|tx| Self::receipt(mint_key, tx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WalletAddress;

    fn request(key: u8) -> AttestationRequest {
        AttestationRequest {
            schema_uid: Hash32([9; 32]),
            chain_id: 11_155_420,
            recipient: WalletAddress::parse("0x00000000000000000000000000000000000000aa")
                .expect("wallet"),
            data: vec![1, 2, 3],
            mint_key: MintKey(Hash32([key; 32])),
        }
    }

    #[tokio::test]
    async fn submit_is_idempotent_by_key() {
        let chain = MockAttestationChain::new();
        let first = chain.submit_attestation(&request(1)).await.expect("submit");
        let second = chain.submit_attestation(&request(1)).await.expect("submit");
        assert!(!first.already_known);
        assert!(second.already_known);
        assert_eq!(first.tx_hash, second.tx_hash);
        assert_eq!(chain.broadcast_count(), 2);
        assert_eq!(chain.landed_count(), 1);

        let receipt = chain
            .get_receipt(&first.tx_hash)
            .await
            .expect("receipt")
            .expect("mined");
        assert!(receipt.success);
        assert_eq!(
            receipt.attestation_uid,
            Some(MockAttestationChain::attestation_uid(&request(1).mint_key))
        );
    }

    #[tokio::test]
    async fn land_then_timeout_is_discoverable() {
        let chain = MockAttestationChain::new();
        chain.push_faults([SubmitFault::LandThenTimeout]);
        let err = chain
            .submit_attestation(&request(2))
            .await
            .expect_err("timeout");
        assert!(err.is_ambiguous());
        let found = chain
            .find_attestation(&request(2).mint_key)
            .await
            .expect("lookup");
        assert!(found.is_some_and(|r| r.success));
    }

    #[tokio::test]
    async fn scripted_rejections_then_success() {
        let chain = MockAttestationChain::new();
        chain.fail_submits(2);
        assert!(chain.submit_attestation(&request(3)).await.is_err());
        assert!(chain.submit_attestation(&request(3)).await.is_err());
        assert!(chain.submit_attestation(&request(3)).await.is_ok());
        assert_eq!(chain.broadcast_count(), 3);
        assert_eq!(chain.landed_count(), 1);
    }

    #[tokio::test]
    async fn held_receipts_are_not_visible() {
        let chain = MockAttestationChain::new();
        chain.hold_receipts(true);
        let sub = chain.submit_attestation(&request(4)).await.expect("submit");
        assert!(chain.get_receipt(&sub.tx_hash).await.expect("rx").is_none());
        assert!(chain
            .find_attestation(&request(4).mint_key)
            .await
            .expect("lookup")
            .is_none());
        chain.hold_receipts(false);
        assert!(chain.get_receipt(&sub.tx_hash).await.expect("rx").is_some());
    }

    #[tokio::test]
    async fn reverted_tx_is_not_found_by_key() {
        let chain = MockAttestationChain::new();
        chain.push_faults([SubmitFault::Revert]);
        let sub = chain.submit_attestation(&request(5)).await.expect("submit");
        let receipt = chain
            .get_receipt(&sub.tx_hash)
            .await
            .expect("rx")
            .expect("mined");
        assert!(!receipt.success);
        assert!(receipt.attestation_uid.is_none());
        assert!(chain
            .find_attestation(&request(5).mint_key)
            .await
            .expect("lookup")
            .is_none());
    }
}
