#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use pociv_core::payload::{source_ref, AttestationPayload, SCHEMA_DEFINITION};
use pociv_core::{now_ms, ChannelId, MessageId, MetricRatings, RunId, UserId, WalletAddress};
use pociv_node::config::{self, ChainMode, PocivNodeConfig};
use pociv_node::server::{self, AppState};
use pociv_node::{build, NodeError};
use pociv_pipeline::{metrics, spawn_worker_pool, SubmitRating};
use serde::Serialize;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Civility rating attestation node")]
struct Args {
    /// Path to a TOML config file.
    #[arg(long, env = "POCIV_CONFIG")]
    config: Option<PathBuf>,

    /// Chain mode:
    /// - mock: offline deterministic in-process chain (default)
    /// - http: attestation relay over HTTP (requires config)
    #[arg(long, value_enum, default_value_t = ChainMode::Mock)]
    chain_mode: ChainMode,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the node as a long-running service (workers + health/status/metrics).
    Run,

    /// Submit a rating and drive its run to completion inline.
    Submit(SubmitArgs),

    /// Print one run, or run counts by step when `--run` is omitted.
    Status {
        /// Run id (64 hex digits).
        #[arg(long)]
        run: Option<String>,
    },

    /// Link a wallet to a platform user.
    LinkWallet {
        #[arg(long)]
        user: u64,
        #[arg(long)]
        wallet: String,
    },

    /// Supersede a FAILED attestation and mint again.
    RetryMint {
        #[arg(long)]
        run: String,
    },

    /// Give up on a run whose mint failed.
    Abandon {
        #[arg(long)]
        run: String,
    },

    /// Print the attestation schema and an example encoding.
    Schema,
}

#[derive(Debug, clap::Args)]
struct SubmitArgs {
    #[arg(long)]
    validator: u64,
    #[arg(long)]
    target: u64,
    #[arg(long)]
    channel: u64,
    #[arg(long)]
    message: u64,
    /// Five ratings 0-5, comma separated (e.g. `5,4,4,5,3`).
    #[arg(long, value_delimiter = ',', allow_negative_numbers = true)]
    metrics: Vec<i64>,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let cfg = match load(args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(msg) => exit_err(&msg),
    };
    init_logging(&cfg);

    if let Err(err) = run(args, cfg).await {
        error!(error = %err, "pociv-node terminated with error");
        std::process::exit(1);
    }
}

fn load(path: Option<&Path>) -> Result<PocivNodeConfig, String> {
    match path {
        Some(p) => config::load_config(&p.to_string_lossy()),
        None => Ok(PocivNodeConfig::default()),
    }
}

async fn run(args: Args, cfg: PocivNodeConfig) -> Result<(), NodeError> {
    match args.command.unwrap_or(Command::Run) {
        Command::Schema => print_schema(&cfg),
        command => run_pipeline_command(command, args.chain_mode, &cfg).await,
    }
}

async fn run_pipeline_command(
    command: Command,
    mode: ChainMode,
    cfg: &PocivNodeConfig,
) -> Result<(), NodeError> {
    let components = build(cfg, mode)?;
    let orchestrator = components.orchestrator;
    let storage = components.storage;

    match command {
        Command::Run => {
            metrics::init();
            let pool = spawn_worker_pool(Arc::clone(&orchestrator), cfg.worker_config());
            let state = AppState {
                storage,
                orchestrator,
                pool,
                label: cfg.node.label.clone(),
                metrics_enabled: cfg.server.metrics_enabled,
                start_instant: Instant::now(),
            };
            server::serve(state, &cfg.server.bind_address).await
        }
        Command::Submit(submit) => {
            let ack = orchestrator
                .submit_rating(SubmitRating {
                    validator: UserId(submit.validator),
                    target: UserId(submit.target),
                    channel: ChannelId(submit.channel),
                    message: MessageId(submit.message),
                    metrics: submit.metrics,
                })
                .await?;
            info!(run = %ack.run_id, disposition = ?ack.disposition, "rating accepted");
            let run = orchestrator.drive(ack.run_id).await?;
            storage.flush()?;
            print_json(&serde_json::json!({ "ack": ack, "run": run }))
        }
        Command::Status { run: None } => print_json(&orchestrator.counts().await?),
        Command::Status { run: Some(raw) } => {
            let run_id = parse_run_id(&raw)?;
            let run = orchestrator
                .get_run(&run_id)
                .await?
                .ok_or_else(|| NodeError::InvalidArgument(format!("run {run_id} not found")))?;
            print_json(&run)
        }
        Command::LinkWallet { user, wallet } => {
            let wallet = WalletAddress::parse(&wallet)
                .map_err(|e| NodeError::InvalidArgument(e.to_string()))?;
            let user = storage.link_wallet(UserId(user), wallet, now_ms())?;
            storage.flush()?;
            print_json(&user)
        }
        Command::RetryMint { run } => {
            let run_id = parse_run_id(&run)?;
            orchestrator.retry_failed_mint(run_id).await?;
            let run = orchestrator.drive(run_id).await?;
            storage.flush()?;
            print_json(&run)
        }
        Command::Abandon { run } => {
            let run_id = parse_run_id(&run)?;
            let run = orchestrator.abandon(run_id).await?;
            storage.flush()?;
            print_json(&run)
        }
        Command::Schema => print_schema(cfg),
    }
}

fn print_schema(cfg: &PocivNodeConfig) -> Result<(), NodeError> {
    let settings = cfg.attestation.to_settings().map_err(NodeError::Config)?;
    let metrics = MetricRatings::try_from_slice(&[5, 4, 4, 5, 3])
        .map_err(|e| NodeError::InvalidArgument(e.to_string()))?;
    let payload = AttestationPayload::from_parts(
        &metrics,
        source_ref(&settings.source_platform, ChannelId(1), MessageId(2)),
        settings.community_context.clone(),
    );
    print_json(&serde_json::json!({
        "schema": SCHEMA_DEFINITION,
        "schema_uid": format!("0x{}", settings.schema_uid.to_hex()),
        "example": {
            "metrics": metrics.as_array(),
            "payload": payload,
            "encoded": format!("0x{}", hex::encode(payload.encode())),
        },
    }))
}

fn parse_run_id(raw: &str) -> Result<RunId, NodeError> {
    RunId::from_hex(raw).map_err(|e| NodeError::InvalidArgument(format!("run id {raw}: {e}")))
}

fn print_json<T: Serialize>(value: &T) -> Result<(), NodeError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_logging(cfg: &PocivNodeConfig) {
    // Prefer explicit config logging.level unless user set RUST_LOG.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level));

    if cfg.logging.format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn exit_err(msg: &str) -> ! {
    eprintln!("{msg}");
    std::process::exit(2);
}
