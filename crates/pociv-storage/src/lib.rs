#![forbid(unsafe_code)]
#![deny(clippy::cast_precision_loss)]
#![deny(clippy::cast_possible_truncation)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::cast_sign_loss)]

//! Durable record store for users, validations, attestations and runs.
//!
//! Every record is canonically encoded (bincode, fixed-int, little-endian)
//! into its own sled tree. Writes that guard pipeline invariants use sled's
//! compare-and-swap so they stay correct with several writers:
//! - validations and attestations are insert-if-absent
//! - run updates require the caller's `revision` to match the stored one
//! - attestation updates swap against the exact record the caller read and
//!   are checked against the status machine

mod gateway;

use std::ops::Bound;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use pociv_core::{
    canonical_decode, canonical_encode, validate_attestation_transition, AttestationRecord,
    AttestationStatus, CanonicalError, CreateOutcome, RunId, RunRecord, RunStepCounts, User,
    UserId, Validation, ValidationId, WalletAddress,
};
use sled::{CompareAndSwapError, IVec, Tree};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const SCHEMA_VERSION: &str = "1";
const META_SCHEMA_KEY: &[u8] = b"schema_version";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage error: {0}")]
    Sled(#[from] sled::Error),
    #[error("canonical encoding error: {0}")]
    Canonical(#[from] CanonicalError),
    #[error("schema mismatch: expected {expected}, found {found:?}")]
    SchemaMismatch {
        expected: String,
        found: Option<String>,
    },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
}

/// Handle to the store. Clones share the same database.
#[derive(Clone)]
pub struct Storage {
    db: sled::Db,
    users: Tree,
    validations: Tree,
    /// validation_id -> AttestationRecord (current generation only).
    attestations: Tree,
    /// run_id -> RunRecord.
    runs: Tree,
    meta: Tree,
    /// Key of the last run handed out by `list_unfinished_runs`.
    scan_cursor: Arc<Mutex<Option<IVec>>>,
}

impl Storage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let users = db.open_tree("users")?;
        let validations = db.open_tree("validations")?;
        let attestations = db.open_tree("attestations")?;
        let runs = db.open_tree("runs")?;
        let meta = db.open_tree("meta")?;
        let storage = Self {
            db,
            users,
            validations,
            attestations,
            runs,
            meta,
            scan_cursor: Arc::new(Mutex::new(None)),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.meta.get(key.as_bytes())?.map(|ivec| ivec.to_vec()))
    }

    // ========== Users ==========

    pub fn get_user(&self, id: UserId) -> Result<Option<User>, StorageError> {
        decode_opt(self.users.get(id.0.to_be_bytes())?)
    }

    /// Create the user on first contact.
    pub fn ensure_user(&self, id: UserId, now_ms: u64) -> Result<User, StorageError> {
        let user = User::new(id, now_ms);
        let bytes = canonical_encode(&user)?;
        match self
            .users
            .compare_and_swap(id.0.to_be_bytes(), None::<&[u8]>, Some(bytes))?
        {
            Ok(()) => {
                debug!(user = %id, "created user");
                Ok(user)
            }
            Err(CompareAndSwapError { current, .. }) => existing(current, "user"),
        }
    }

    /// Set the user's wallet, creating the user if needed. An existing record
    /// that does not decode is reported, never replaced.
    pub fn link_wallet(
        &self,
        id: UserId,
        wallet: WalletAddress,
        now_ms: u64,
    ) -> Result<User, StorageError> {
        let key = id.0.to_be_bytes();
        loop {
            let current = self.users.get(key)?;
            let mut user = match &current {
                Some(bytes) => canonical_decode::<User>(bytes)?,
                None => User::new(id, now_ms),
            };
            user.wallet = Some(wallet.clone());
            let bytes = canonical_encode(&user)?;
            match self.users.compare_and_swap(key, current, Some(bytes))? {
                Ok(()) => {
                    info!(user = %id, wallet = %wallet, "linked wallet");
                    return Ok(user);
                }
                // Another writer got there first; re-read and apply on top.
                Err(CompareAndSwapError { .. }) => continue,
            }
        }
    }

    // ========== Validations ==========

    /// Insert if absent. Validations are immutable, so an existing record wins.
    pub fn insert_validation(
        &self,
        validation: &Validation,
    ) -> Result<CreateOutcome<Validation>, StorageError> {
        let bytes = canonical_encode(validation)?;
        match self
            .validations
            .compare_and_swap(validation.id.0 .0, None::<&[u8]>, Some(bytes))?
        {
            Ok(()) => Ok(CreateOutcome::Created(validation.clone())),
            Err(CompareAndSwapError { current, .. }) => {
                existing(current, "validation").map(CreateOutcome::Existing)
            }
        }
    }

    pub fn get_validation(&self, id: &ValidationId) -> Result<Option<Validation>, StorageError> {
        decode_opt(self.validations.get(id.0 .0)?)
    }

    // ========== Attestations ==========

    pub fn get_attestation(
        &self,
        validation_id: &ValidationId,
    ) -> Result<Option<AttestationRecord>, StorageError> {
        decode_opt(self.attestations.get(validation_id.0 .0)?)
    }

    /// Insert if absent. At most one attestation exists per validation.
    pub fn create_attestation(
        &self,
        record: &AttestationRecord,
    ) -> Result<CreateOutcome<AttestationRecord>, StorageError> {
        let bytes = canonical_encode(record)?;
        match self.attestations.compare_and_swap(
            record.validation_id.0 .0,
            None::<&[u8]>,
            Some(bytes),
        )? {
            Ok(()) => Ok(CreateOutcome::Created(record.clone())),
            Err(CompareAndSwapError { current, .. }) => {
                existing(current, "attestation").map(CreateOutcome::Existing)
            }
        }
    }

    /// Replace `expected` with `next`, enforcing monotone status.
    pub fn update_attestation(
        &self,
        expected: &AttestationRecord,
        next: &AttestationRecord,
    ) -> Result<(), StorageError> {
        if expected.validation_id != next.validation_id || expected.generation != next.generation
        {
            return Err(StorageError::InvalidTransition(
                "attestation update must keep validation and generation".to_string(),
            ));
        }
        validate_attestation_transition(expected.status, next.status)
            .map_err(|e| StorageError::InvalidTransition(e.to_string()))?;
        let old = canonical_encode(expected)?;
        let new = canonical_encode(next)?;
        match self
            .attestations
            .compare_and_swap(next.validation_id.0 .0, Some(old), Some(new))?
        {
            Ok(()) => Ok(()),
            Err(CompareAndSwapError { current: None, .. }) => Err(StorageError::NotFound(
                format!("attestation {}", next.validation_id),
            )),
            Err(CompareAndSwapError { .. }) => Err(StorageError::Conflict(format!(
                "attestation {} changed since it was read",
                next.validation_id
            ))),
        }
    }

    /// Replace a FAILED attestation with a fresh PENDING generation.
    pub fn supersede_attestation(
        &self,
        validation_id: &ValidationId,
        now_ms: u64,
    ) -> Result<AttestationRecord, StorageError> {
        let key = validation_id.0 .0;
        let current_bytes = self
            .attestations
            .get(key)?
            .ok_or_else(|| StorageError::NotFound(format!("attestation {validation_id}")))?;
        let current: AttestationRecord = canonical_decode(&current_bytes)?;
        let next = current
            .supersede(now_ms)
            .map_err(|e| StorageError::InvalidTransition(e.to_string()))?;
        let bytes = canonical_encode(&next)?;
        self.attestations
            .compare_and_swap(key, Some(current_bytes), Some(bytes))?
            .map_err(|_| {
                StorageError::Conflict(format!("attestation {validation_id} changed concurrently"))
            })?;
        info!(
            validation = %validation_id,
            generation = next.generation,
            "superseded failed attestation"
        );
        Ok(next)
    }

    pub fn count_attestations(&self, status: AttestationStatus) -> Result<u64, StorageError> {
        let mut count = 0u64;
        for item in self.attestations.iter() {
            let (_, value) = item?;
            let record: AttestationRecord = canonical_decode(&value)?;
            if record.status == status {
                count += 1;
            }
        }
        Ok(count)
    }

    // ========== Runs ==========

    /// Insert if absent. One run exists per run id.
    pub fn create_run(&self, run: &RunRecord) -> Result<CreateOutcome<RunRecord>, StorageError> {
        let bytes = canonical_encode(run)?;
        match self
            .runs
            .compare_and_swap(run.run_id.0 .0, None::<&[u8]>, Some(bytes))?
        {
            Ok(()) => Ok(CreateOutcome::Created(run.clone())),
            Err(CompareAndSwapError { current, .. }) => {
                existing(current, "run").map(CreateOutcome::Existing)
            }
        }
    }

    pub fn get_run(&self, id: &RunId) -> Result<Option<RunRecord>, StorageError> {
        decode_opt(self.runs.get(id.0 .0)?)
    }

    /// Compare-and-swap on `revision`; returns the stored record.
    pub fn update_run(&self, run: &RunRecord) -> Result<RunRecord, StorageError> {
        let key = run.run_id.0 .0;
        let current_bytes = self
            .runs
            .get(key)?
            .ok_or_else(|| StorageError::NotFound(format!("run {}", run.run_id)))?;
        let current: RunRecord = canonical_decode(&current_bytes)?;
        if current.revision != run.revision {
            return Err(StorageError::Conflict(format!(
                "run {} revision {} is stale (stored {})",
                run.run_id, run.revision, current.revision
            )));
        }
        let mut next = run.clone();
        next.revision = run.revision.saturating_add(1);
        let bytes = canonical_encode(&next)?;
        self.runs
            .compare_and_swap(key, Some(current_bytes), Some(bytes))?
            .map_err(|_| StorageError::Conflict(format!("run {} changed concurrently", run.run_id)))?;
        Ok(next)
    }

    /// Runs that still have work to do, up to `limit`.
    /// Up to `limit` unfinished runs in key order, starting after the last run
    /// the previous call returned and wrapping around. Successive scans cycle
    /// through every unfinished run however many of them keep failing.
    /// Records that do not decode are logged and skipped.
    pub fn list_unfinished_runs(&self, limit: usize) -> Result<Vec<RunRecord>, StorageError> {
        let mut cursor = self
            .scan_cursor
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let items: Box<dyn Iterator<Item = sled::Result<(IVec, IVec)>>> = match cursor.clone() {
            Some(after) => Box::new(
                self.runs
                    .range((Bound::Excluded(after.clone()), Bound::<IVec>::Unbounded))
                    .chain(self.runs.range(..=after)),
            ),
            None => Box::new(self.runs.iter()),
        };

        let mut out = Vec::new();
        let mut last_key = None;
        for item in items {
            if out.len() >= limit {
                break;
            }
            let (key, value) = item?;
            match canonical_decode::<RunRecord>(&value) {
                Ok(run) if !run.is_finished() => {
                    last_key = Some(key);
                    out.push(run);
                }
                Ok(_) => {}
                Err(e) => warn!(key = %hex::encode(&key), error = %e, "skipping undecodable run record"),
            }
        }
        // A short page means the whole tree was covered; start over next time.
        *cursor = if out.len() >= limit { last_key } else { None };
        Ok(out)
    }

    pub fn count_runs(&self) -> Result<RunStepCounts, StorageError> {
        let mut counts = RunStepCounts::default();
        for item in self.runs.iter() {
            let (_, value) = item?;
            let run: RunRecord = canonical_decode(&value)?;
            counts.add(&run);
        }
        Ok(counts)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let existing = self.meta.get(META_SCHEMA_KEY)?;
        match existing {
            Some(val) => {
                let current = String::from_utf8_lossy(&val).to_string();
                if current != SCHEMA_VERSION {
                    return Err(StorageError::SchemaMismatch {
                        expected: SCHEMA_VERSION.to_string(),
                        found: Some(current),
                    });
                }
            }
            None => {
                self.meta
                    .insert(META_SCHEMA_KEY, SCHEMA_VERSION.as_bytes())?;
                info!(schema = SCHEMA_VERSION, "initialized schema version");
            }
        }
        Ok(())
    }
}

fn decode_opt<T: serde::de::DeserializeOwned>(
    value: Option<IVec>,
) -> Result<Option<T>, StorageError> {
    value
        .map(|ivec| canonical_decode(&ivec))
        .transpose()
        .map_err(Into::into)
}

fn existing<T: serde::de::DeserializeOwned>(
    current: Option<IVec>,
    what: &str,
) -> Result<T, StorageError> {
    let bytes = current.ok_or_else(|| StorageError::Conflict(format!("{what} vanished during insert")))?;
    Ok(canonical_decode(&bytes)?)
}
