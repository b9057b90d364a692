#![forbid(unsafe_code)]
#![deny(clippy::cast_precision_loss)]
#![deny(clippy::cast_possible_truncation)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::cast_sign_loss)]

//! Operator surface for the civility attestation pipeline: TOML config,
//! component wiring and the HTTP server (rating intake, wallet linking,
//! health, status and metrics).

pub mod config;
pub mod server;

use std::sync::Arc;

use pociv_core::chain::http_client::HttpAttestationChain;
use pociv_core::chain::mock_client::MockAttestationChain;
use pociv_core::{AttestationChain, ChainError, Notifier, NotifyError};
use pociv_pipeline::{LoggingNotifier, Orchestrator, PipelineError, WebhookNotifier};
use pociv_storage::{Storage, StorageError};
use thiserror::Error;
use tracing::info;

use crate::config::{ChainMode, NotifierKind, PocivNodeConfig};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("config error: {0}")]
    Config(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("chain client error: {0}")]
    Chain(#[from] ChainError),
    #[error("notifier error: {0}")]
    Notify(#[from] NotifyError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Wired pipeline components sharing one store.
pub struct Components {
    pub storage: Arc<Storage>,
    pub orchestrator: Arc<Orchestrator>,
}

pub fn build_chain(
    cfg: &PocivNodeConfig,
    mode: ChainMode,
) -> Result<Arc<dyn AttestationChain>, NodeError> {
    Ok(match mode {
        ChainMode::Mock => Arc::new(MockAttestationChain::new()),
        ChainMode::Http => Arc::new(HttpAttestationChain::new(cfg.chain.to_http_config())?),
    })
}

pub fn build_notifier(cfg: &PocivNodeConfig) -> Result<Arc<dyn Notifier>, NodeError> {
    match cfg.notifier.kind {
        NotifierKind::Log => Ok(Arc::new(LoggingNotifier)),
        NotifierKind::Webhook => {
            let webhook = cfg.notifier.webhook_config().ok_or_else(|| {
                NodeError::Config("notifier.webhook_url is required".to_string())
            })?;
            Ok(Arc::new(WebhookNotifier::new(webhook)?))
        }
    }
}

pub fn build(cfg: &PocivNodeConfig, mode: ChainMode) -> Result<Components, NodeError> {
    cfg.validate(mode).map_err(NodeError::Config)?;
    let pipeline = cfg.pipeline_config().map_err(NodeError::Config)?;
    let storage = Arc::new(Storage::open(&cfg.storage.path)?);
    let chain = build_chain(cfg, mode)?;
    let notifier = build_notifier(cfg)?;
    let orchestrator = Arc::new(Orchestrator::new(
        storage.clone(),
        chain,
        notifier,
        pipeline,
    )?);
    info!(
        label = %cfg.node.label,
        storage = %cfg.storage.path,
        chain_mode = ?mode,
        "pipeline components ready"
    );
    Ok(Components {
        storage,
        orchestrator,
    })
}
