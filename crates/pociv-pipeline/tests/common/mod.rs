//! Shared fixtures for pipeline integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pociv_core::chain::mock_client::MockAttestationChain;
use pociv_core::payload::AttestationSettings;
use pociv_core::{
    AttestationRecord, ChannelId, CreateOutcome, GatewayError, Hash32, MessageId, Notification,
    Notifier, NotifyError, PersistenceGateway, RunId, RunRecord, RunStepCounts, User, UserId,
    Validation, ValidationId, WalletAddress,
};
use pociv_pipeline::{Orchestrator, PipelineConfig, SubmitRating};
use pociv_storage::Storage;
use tempfile::TempDir;

pub const TARGET: UserId = UserId(2_002);
pub const VALIDATOR: UserId = UserId(1_001);

// ========== Notifier ==========

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: AtomicBool,
    delay_ms: AtomicU64,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().expect("mutex poisoned").clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay_ms(&self, ms: u64) {
        self.delay_ms.store(ms, Ordering::SeqCst);
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError::Transport("relay unreachable".to_string()));
        }
        self.sent
            .lock()
            .expect("mutex poisoned")
            .push(notification.clone());
        Ok(())
    }
}

// ========== Gateway ==========

/// Storage wrapper that can stop accepting run writes after a budget, to
/// simulate a crash between a step's intent and its result, and can stall
/// user reads past the gateway deadline.
pub struct FlakyGateway {
    inner: Arc<Storage>,
    run_write_budget: AtomicUsize,
    run_writes: AtomicUsize,
    stall_user_reads: AtomicBool,
}

impl FlakyGateway {
    pub fn new(inner: Arc<Storage>) -> Self {
        Self {
            inner,
            run_write_budget: AtomicUsize::new(usize::MAX),
            run_writes: AtomicUsize::new(0),
            stall_user_reads: AtomicBool::new(false),
        }
    }

    /// Allow `n` more successful run updates, then fail every later one.
    pub fn crash_after_run_writes(&self, n: usize) {
        self.run_write_budget.store(n, Ordering::SeqCst);
    }

    pub fn run_writes(&self) -> usize {
        self.run_writes.load(Ordering::SeqCst)
    }

    pub fn stall_user_reads(&self, stall: bool) {
        self.stall_user_reads.store(stall, Ordering::SeqCst);
    }
}

#[async_trait]
impl PersistenceGateway for FlakyGateway {
    async fn get_user(&self, id: UserId) -> Result<Option<User>, GatewayError> {
        if self.stall_user_reads.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        self.inner.get_user(id).map_err(Into::into)
    }

    async fn ensure_user(&self, id: UserId, now_ms: u64) -> Result<User, GatewayError> {
        self.inner.ensure_user(id, now_ms).map_err(Into::into)
    }

    async fn link_wallet(
        &self,
        id: UserId,
        wallet: WalletAddress,
        now_ms: u64,
    ) -> Result<User, GatewayError> {
        self.inner.link_wallet(id, wallet, now_ms).map_err(Into::into)
    }

    async fn insert_validation(
        &self,
        validation: &Validation,
    ) -> Result<CreateOutcome<Validation>, GatewayError> {
        self.inner.insert_validation(validation).map_err(Into::into)
    }

    async fn get_validation(&self, id: &ValidationId) -> Result<Option<Validation>, GatewayError> {
        self.inner.get_validation(id).map_err(Into::into)
    }

    async fn get_attestation(
        &self,
        validation_id: &ValidationId,
    ) -> Result<Option<AttestationRecord>, GatewayError> {
        self.inner.get_attestation(validation_id).map_err(Into::into)
    }

    async fn create_attestation(
        &self,
        record: &AttestationRecord,
    ) -> Result<CreateOutcome<AttestationRecord>, GatewayError> {
        self.inner.create_attestation(record).map_err(Into::into)
    }

    async fn update_attestation(
        &self,
        expected: &AttestationRecord,
        next: &AttestationRecord,
    ) -> Result<(), GatewayError> {
        self.inner
            .update_attestation(expected, next)
            .map_err(Into::into)
    }

    async fn supersede_attestation(
        &self,
        validation_id: &ValidationId,
        now_ms: u64,
    ) -> Result<AttestationRecord, GatewayError> {
        self.inner
            .supersede_attestation(validation_id, now_ms)
            .map_err(Into::into)
    }

    async fn create_run(&self, run: &RunRecord) -> Result<CreateOutcome<RunRecord>, GatewayError> {
        self.inner.create_run(run).map_err(Into::into)
    }

    async fn get_run(&self, id: &RunId) -> Result<Option<RunRecord>, GatewayError> {
        self.inner.get_run(id).map_err(Into::into)
    }

    async fn update_run(&self, run: &RunRecord) -> Result<RunRecord, GatewayError> {
        let budget = self.run_write_budget.load(Ordering::SeqCst);
        if budget == 0 {
            return Err(GatewayError::Unavailable("simulated crash".to_string()));
        }
        if budget != usize::MAX {
            self.run_write_budget.store(budget - 1, Ordering::SeqCst);
        }
        let stored = self.inner.update_run(run)?;
        self.run_writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    async fn list_unfinished_runs(&self, limit: usize) -> Result<Vec<RunRecord>, GatewayError> {
        self.inner.list_unfinished_runs(limit).map_err(Into::into)
    }

    async fn count_runs(&self) -> Result<RunStepCounts, GatewayError> {
        self.inner.count_runs().map_err(Into::into)
    }
}

// ========== Environment ==========

pub struct TestEnv {
    _dir: TempDir,
    pub storage: Arc<Storage>,
    pub chain: Arc<MockAttestationChain>,
    pub notifier: Arc<RecordingNotifier>,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tmpdir");
        let storage = Arc::new(Storage::open(dir.path()).expect("open"));
        Self {
            _dir: dir,
            storage,
            chain: Arc::new(MockAttestationChain::new()),
            notifier: Arc::new(RecordingNotifier::default()),
        }
    }

    /// Orchestrator over the plain store.
    pub fn orchestrator(&self) -> Orchestrator {
        self.orchestrator_with(self.storage.clone())
    }

    pub fn orchestrator_with(&self, gateway: Arc<dyn PersistenceGateway>) -> Orchestrator {
        Orchestrator::new(
            gateway,
            self.chain.clone(),
            self.notifier.clone(),
            pipeline_config(),
        )
        .expect("orchestrator")
    }

    pub fn link_target_wallet(&self) -> WalletAddress {
        let wallet = target_wallet();
        self.storage
            .link_wallet(TARGET, wallet.clone(), 1)
            .expect("link wallet");
        wallet
    }
}

pub fn settings() -> AttestationSettings {
    AttestationSettings::new(
        Hash32([0x5c; 32]),
        WalletAddress::parse("0x4200000000000000000000000000000000000021").expect("eas"),
    )
}

pub fn pipeline_config() -> PipelineConfig {
    let mut config = PipelineConfig::new(settings());
    config.mint.backoff_base_ms = 1;
    config.mint.backoff_max_ms = 4;
    config.mint.receipt_timeout_ms = 20;
    config.mint.receipt_poll_ms = 1;
    config.gateway_timeout_ms = 100;
    config.notify_timeout_ms = 100;
    config
}

pub fn target_wallet() -> WalletAddress {
    WalletAddress::parse("0x1111111111111111111111111111111111111111").expect("wallet")
}

pub fn rating(message: u64, metrics: &[i64]) -> SubmitRating {
    SubmitRating {
        validator: VALIDATOR,
        target: TARGET,
        channel: ChannelId(77),
        message: MessageId(message),
        metrics: metrics.to_vec(),
    }
}
