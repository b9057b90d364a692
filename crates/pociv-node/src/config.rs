// `serde` derive macros and the score thresholds use `f64`.
#![allow(clippy::disallowed_types)]

use std::fs;

use pociv_core::chain::http_client::HttpChainConfig;
use pociv_core::payload::{
    AttestationSettings, DEFAULT_CHAIN_ID, DEFAULT_COMMUNITY_CONTEXT, DEFAULT_EAS_CONTRACT,
    DEFAULT_EXPLORER_URL_TEMPLATE, DEFAULT_SOURCE_PLATFORM, SCHEMA_DEFINITION,
};
use pociv_core::{Hash32, TierBands, WalletAddress, DEFAULT_ELIGIBILITY_THRESHOLD};
use pociv_pipeline::{MintConfig, PipelineConfig, WebhookNotifierConfig, WorkerConfig};
use serde::Deserialize;

/// Which attestation chain client the node talks to.
#[derive(Debug, Clone, Copy, clap::ValueEnum, PartialEq, Eq)]
pub enum ChainMode {
    /// Offline deterministic in-process chain.
    Mock,
    /// Attestation relay over HTTP (requires `[chain] base_url`).
    Http,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PocivNodeConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub tiers: TierBands,
    #[serde(default)]
    pub mint: MintSection,
    #[serde(default)]
    pub attestation: AttestationSection,
    #[serde(default)]
    pub chain: ChainSection,
    #[serde(default)]
    pub notifier: NotifierSection,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_label")]
    pub label: String,
}

fn default_node_label() -> String {
    "pociv-node".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            label: default_node_label(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: String,
}

fn default_storage_path() -> String {
    "./data/pociv".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_resume_interval_ms")]
    pub resume_interval_ms: u64,
    #[serde(default = "default_scan_limit")]
    pub scan_limit: usize,
    #[serde(default = "default_gateway_timeout_ms")]
    pub gateway_timeout_ms: u64,
    #[serde(default = "default_notify_timeout_ms")]
    pub notify_timeout_ms: u64,
    #[serde(default = "default_threshold")]
    pub eligibility_threshold: f64,
}

fn default_workers() -> usize {
    WorkerConfig::default().workers
}

fn default_queue_capacity() -> usize {
    WorkerConfig::default().queue_capacity
}

fn default_resume_interval_ms() -> u64 {
    WorkerConfig::default().resume_interval_ms
}

fn default_scan_limit() -> usize {
    WorkerConfig::default().scan_limit
}

fn default_gateway_timeout_ms() -> u64 {
    5_000
}

fn default_notify_timeout_ms() -> u64 {
    10_000
}

fn default_threshold() -> f64 {
    DEFAULT_ELIGIBILITY_THRESHOLD
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            resume_interval_ms: default_resume_interval_ms(),
            scan_limit: default_scan_limit(),
            gateway_timeout_ms: default_gateway_timeout_ms(),
            notify_timeout_ms: default_notify_timeout_ms(),
            eligibility_threshold: default_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MintSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_submit_timeout_ms")]
    pub submit_timeout_ms: u64,
    #[serde(default = "default_receipt_timeout_ms")]
    pub receipt_timeout_ms: u64,
    #[serde(default = "default_receipt_poll_ms")]
    pub receipt_poll_ms: u64,
}

fn default_max_attempts() -> u32 {
    MintConfig::default().max_attempts
}

fn default_backoff_base_ms() -> u64 {
    MintConfig::default().backoff_base_ms
}

fn default_backoff_max_ms() -> u64 {
    MintConfig::default().backoff_max_ms
}

fn default_submit_timeout_ms() -> u64 {
    MintConfig::default().submit_timeout_ms
}

fn default_receipt_timeout_ms() -> u64 {
    MintConfig::default().receipt_timeout_ms
}

fn default_receipt_poll_ms() -> u64 {
    MintConfig::default().receipt_poll_ms
}

impl Default for MintSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            submit_timeout_ms: default_submit_timeout_ms(),
            receipt_timeout_ms: default_receipt_timeout_ms(),
            receipt_poll_ms: default_receipt_poll_ms(),
        }
    }
}

impl MintSection {
    pub fn to_mint_config(&self) -> MintConfig {
        MintConfig {
            max_attempts: self.max_attempts,
            backoff_base_ms: self.backoff_base_ms,
            backoff_max_ms: self.backoff_max_ms,
            submit_timeout_ms: self.submit_timeout_ms,
            receipt_timeout_ms: self.receipt_timeout_ms,
            receipt_poll_ms: self.receipt_poll_ms,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttestationSection {
    /// Registered EAS schema uid (64 hex digits). Required in http mode.
    #[serde(default)]
    pub schema_uid: Option<String>,
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    #[serde(default = "default_eas_contract")]
    pub eas_contract: String,
    #[serde(default = "default_source_platform")]
    pub source_platform: String,
    #[serde(default = "default_community_context")]
    pub community_context: String,
    #[serde(default = "default_explorer_url_template")]
    pub explorer_url_template: String,
}

fn default_chain_id() -> u64 {
    DEFAULT_CHAIN_ID
}

fn default_eas_contract() -> String {
    DEFAULT_EAS_CONTRACT.to_string()
}

fn default_source_platform() -> String {
    DEFAULT_SOURCE_PLATFORM.to_string()
}

fn default_community_context() -> String {
    DEFAULT_COMMUNITY_CONTEXT.to_string()
}

fn default_explorer_url_template() -> String {
    DEFAULT_EXPLORER_URL_TEMPLATE.to_string()
}

impl Default for AttestationSection {
    fn default() -> Self {
        Self {
            schema_uid: None,
            chain_id: default_chain_id(),
            eas_contract: default_eas_contract(),
            source_platform: default_source_platform(),
            community_context: default_community_context(),
            explorer_url_template: default_explorer_url_template(),
        }
    }
}

impl AttestationSection {
    /// Schema uid used when none is configured. Only valid against the mock chain.
    pub fn dev_schema_uid() -> Hash32 {
        Hash32::derive(b"pociv.schema.dev", &[SCHEMA_DEFINITION.as_bytes()])
    }

    fn schema_uid(&self) -> Result<Option<Hash32>, String> {
        match self.schema_uid.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => {
                let uid = Hash32::from_hex(raw)
                    .map_err(|e| format!("attestation.schema_uid is malformed: {e}"))?;
                Ok(Some(uid))
            }
        }
    }

    pub fn to_settings(&self) -> Result<AttestationSettings, String> {
        let schema_uid = self.schema_uid()?.unwrap_or_else(Self::dev_schema_uid);
        let eas_contract = WalletAddress::parse(&self.eas_contract)
            .map_err(|e| format!("attestation.eas_contract is malformed: {e}"))?;
        let mut settings = AttestationSettings::new(schema_uid, eas_contract);
        settings.chain_id = self.chain_id;
        settings.source_platform = self.source_platform.clone();
        settings.community_context = self.community_context.clone();
        settings.explorer_url_template = self.explorer_url_template.clone();
        settings
            .validate()
            .map_err(|e| format!("invalid [attestation] config: {e}"))?;
        Ok(settings)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChainSection {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ChainSection {
    pub fn to_http_config(&self) -> HttpChainConfig {
        let mut cfg = HttpChainConfig::new(self.base_url.clone());
        cfg.api_key = self.api_key.clone().filter(|k| !k.trim().is_empty());
        if let Some(timeout_ms) = self.timeout_ms {
            cfg.timeout_ms = timeout_ms;
        }
        cfg
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifierKind {
    #[default]
    Log,
    Webhook,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifierSection {
    #[serde(default)]
    pub kind: NotifierKind,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_webhook_timeout_ms() -> u64 {
    5_000
}

impl Default for NotifierSection {
    fn default() -> Self {
        Self {
            kind: NotifierKind::default(),
            webhook_url: None,
            timeout_ms: default_webhook_timeout_ms(),
        }
    }
}

impl NotifierSection {
    pub fn webhook_config(&self) -> Option<WebhookNotifierConfig> {
        let url = self.webhook_url.as_deref()?.trim();
        if url.is_empty() {
            return None;
        }
        Some(WebhookNotifierConfig {
            url: url.to_string(),
            timeout_ms: self.timeout_ms,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_bind_address() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn resolve_env_refs(mut v: toml::Value) -> Result<toml::Value, String> {
    fn walk(v: &mut toml::Value) -> Result<(), String> {
        match v {
            toml::Value::String(s) => {
                if let Some(var) = s.strip_prefix("env:") {
                    let var = var.trim();
                    if var.is_empty() {
                        return Err("invalid env: reference (empty var name)".to_string());
                    }
                    let val = std::env::var(var)
                        .map_err(|_| format!("missing required environment variable: {var}"))?;
                    *s = val;
                }
            }
            toml::Value::Array(arr) => {
                for x in arr {
                    walk(x)?;
                }
            }
            toml::Value::Table(map) => {
                for (_, x) in map.iter_mut() {
                    walk(x)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    walk(&mut v)?;
    Ok(v)
}

pub fn parse_config(raw: &str) -> Result<PocivNodeConfig, String> {
    let parsed: toml::Value = toml::from_str(raw).map_err(|e| format!("failed to parse config: {e}"))?;
    let resolved = resolve_env_refs(parsed)?;
    resolved
        .try_into::<PocivNodeConfig>()
        .map_err(|e| format!("failed to decode config: {e}"))
}

pub fn load_config(path: &str) -> Result<PocivNodeConfig, String> {
    let raw = fs::read_to_string(path).map_err(|e| format!("failed to read config {path}: {e}"))?;
    parse_config(&raw).map_err(|e| format!("{path}: {e}"))
}

impl PocivNodeConfig {
    pub fn validate(&self, mode: ChainMode) -> Result<(), String> {
        if self.node.label.trim().is_empty() {
            return Err("node.label is empty".to_string());
        }
        if self.storage.path.trim().is_empty() {
            return Err("storage.path is empty".to_string());
        }
        if self.pipeline.workers == 0 {
            return Err("pipeline.workers must be >= 1".to_string());
        }
        if self.pipeline.queue_capacity == 0 {
            return Err("pipeline.queue_capacity must be >= 1".to_string());
        }

        self.pipeline_config()?;

        if mode == ChainMode::Http {
            if self.chain.base_url.trim().is_empty() {
                return Err("chain.base_url is required in http chain mode".to_string());
            }
            if self.attestation.schema_uid()?.is_none() {
                return Err("attestation.schema_uid is required in http chain mode".to_string());
            }
        }

        if self.notifier.kind == NotifierKind::Webhook && self.notifier.webhook_config().is_none() {
            return Err("notifier.webhook_url is required for the webhook notifier".to_string());
        }
        Ok(())
    }

    pub fn pipeline_config(&self) -> Result<PipelineConfig, String> {
        let mut config = PipelineConfig::new(self.attestation.to_settings()?);
        config.eligibility_threshold = self.pipeline.eligibility_threshold;
        config.tiers = self.tiers;
        config.mint = self.mint.to_mint_config();
        config.gateway_timeout_ms = self.pipeline.gateway_timeout_ms;
        config.notify_timeout_ms = self.pipeline.notify_timeout_ms;
        config.validate().map_err(|e| e.to_string())?;
        Ok(config)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            workers: self.pipeline.workers,
            queue_capacity: self.pipeline.queue_capacity,
            resume_interval_ms: self.pipeline.resume_interval_ms,
            scan_limit: self.pipeline.scan_limit,
        }
    }
}
