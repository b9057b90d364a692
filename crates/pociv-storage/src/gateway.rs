use async_trait::async_trait;
use pociv_core::{
    AttestationRecord, CreateOutcome, GatewayError, PersistenceGateway, RunId, RunRecord,
    RunStepCounts, User, UserId, Validation, ValidationId, WalletAddress,
};

use crate::{Storage, StorageError};

impl From<StorageError> for GatewayError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Sled(e) => GatewayError::Unavailable(e.to_string()),
            StorageError::Canonical(e) => GatewayError::Corrupt(e.to_string()),
            StorageError::SchemaMismatch { expected, found } => GatewayError::Corrupt(format!(
                "schema mismatch: expected {expected}, found {found:?}"
            )),
            StorageError::Conflict(msg) => GatewayError::Conflict(msg),
            StorageError::NotFound(msg) => GatewayError::NotFound(msg),
            StorageError::InvalidTransition(msg) => GatewayError::InvalidTransition(msg),
        }
    }
}

impl Storage {
    /// Run a sled call on the blocking pool so a slow disk never stalls the
    /// async workers.
    async fn blocking<T, F>(&self, op: F) -> Result<T, GatewayError>
    where
        T: Send + 'static,
        F: FnOnce(&Storage) -> Result<T, StorageError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(&store)).await
            .map_err(|e| GatewayError::Unavailable(format!("spawn_blocking error: {e}")))?
            .map_err(Into::into)
    }
}

#[async_trait]
impl PersistenceGateway for Storage {
    async fn get_user(&self, id: UserId) -> Result<Option<User>, GatewayError> {
        self.blocking(move |s| s.get_user(id)).await
    }

    async fn ensure_user(&self, id: UserId, now_ms: u64) -> Result<User, GatewayError> {
        self.blocking(move |s| s.ensure_user(id, now_ms)).await
    }

    async fn link_wallet(
        &self,
        id: UserId,
        wallet: WalletAddress,
        now_ms: u64,
    ) -> Result<User, GatewayError> {
        self.blocking(move |s| s.link_wallet(id, wallet, now_ms)).await
    }

    async fn insert_validation(
        &self,
        validation: &Validation,
    ) -> Result<CreateOutcome<Validation>, GatewayError> {
        let validation = validation.clone();
        self.blocking(move |s| s.insert_validation(&validation)).await
    }

    async fn get_validation(&self, id: &ValidationId) -> Result<Option<Validation>, GatewayError> {
        let id = *id;
        self.blocking(move |s| s.get_validation(&id)).await
    }

    async fn get_attestation(
        &self,
        validation_id: &ValidationId,
    ) -> Result<Option<AttestationRecord>, GatewayError> {
        let id = *validation_id;
        self.blocking(move |s| s.get_attestation(&id)).await
    }

    async fn create_attestation(
        &self,
        record: &AttestationRecord,
    ) -> Result<CreateOutcome<AttestationRecord>, GatewayError> {
        let record = record.clone();
        self.blocking(move |s| s.create_attestation(&record)).await
    }

    async fn update_attestation(
        &self,
        expected: &AttestationRecord,
        next: &AttestationRecord,
    ) -> Result<(), GatewayError> {
        let expected = expected.clone();
        let next = next.clone();
        self.blocking(move |s| s.update_attestation(&expected, &next)).await
    }

    async fn supersede_attestation(
        &self,
        validation_id: &ValidationId,
        now_ms: u64,
    ) -> Result<AttestationRecord, GatewayError> {
        let id = *validation_id;
        self.blocking(move |s| s.supersede_attestation(&id, now_ms)).await
    }

    async fn create_run(&self, run: &RunRecord) -> Result<CreateOutcome<RunRecord>, GatewayError> {
        let run = run.clone();
        self.blocking(move |s| s.create_run(&run)).await
    }

    async fn get_run(&self, id: &RunId) -> Result<Option<RunRecord>, GatewayError> {
        let id = *id;
        self.blocking(move |s| s.get_run(&id)).await
    }

    async fn update_run(&self, run: &RunRecord) -> Result<RunRecord, GatewayError> {
        let run = run.clone();
        self.blocking(move |s| s.update_run(&run)).await
    }

    async fn list_unfinished_runs(&self, limit: usize) -> Result<Vec<RunRecord>, GatewayError> {
        self.blocking(move |s| s.list_unfinished_runs(limit)).await
    }

    async fn count_runs(&self) -> Result<RunStepCounts, GatewayError> {
        self.blocking(|s| s.count_runs()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pociv_core::{ChannelId, MessageId, MetricRatings, RatingRequest};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn gateway_maps_conflicts() {
        let dir = tempdir().expect("tmpdir");
        let storage = Arc::new(Storage::open(dir.path()).expect("open"));
        let gateway: Arc<dyn PersistenceGateway> = storage;
        let run = RunRecord::new(
            RatingRequest {
                validator: UserId(1),
                target: UserId(2),
                channel: ChannelId(3),
                message: MessageId(4),
                metrics: MetricRatings::try_from_slice(&[1, 1, 1, 1, 1]).expect("metrics"),
            },
            10,
        );
        gateway.create_run(&run).await.expect("create");
        gateway.update_run(&run).await.expect("first update");
        let err = gateway.update_run(&run).await.expect_err("stale");
        assert!(matches!(err, GatewayError::Conflict(_)));
        assert!(err.is_transient());

        let missing = RunId::derive(ChannelId(9), MessageId(9));
        assert_eq!(gateway.get_run(&missing).await.expect("get"), None);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn blocking_calls_share_one_store() {
        let dir = tempdir().expect("tmpdir");
        let storage = Storage::open(dir.path()).expect("open");
        let gateway: Arc<dyn PersistenceGateway> = Arc::new(storage.clone());
        let wallet =
            WalletAddress::parse("0x00000000000000000000000000000000000000aa").expect("wallet");

        let linked = gateway
            .link_wallet(UserId(7), wallet.clone(), 50)
            .await
            .expect("link");
        assert_eq!(storage.get_user(UserId(7)).expect("get"), Some(linked));

        let (a, b) = tokio::join!(gateway.ensure_user(UserId(8), 60), gateway.get_user(UserId(7)));
        assert_eq!(a.expect("ensure").id, UserId(8));
        assert_eq!(b.expect("get").and_then(|u| u.wallet), Some(wallet));
    }
}
