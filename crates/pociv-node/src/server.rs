use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use pociv_core::{now_ms, GatewayError, PersistenceGateway, RunStepCounts, UserId, WalletAddress};
use pociv_pipeline::{
    metrics, Orchestrator, PipelineError, SubmitDisposition, SubmitRating, WorkerPoolHandle,
    WorkerSnapshot,
};
use pociv_storage::Storage;
use serde::{Deserialize, Serialize};
use tokio::signal;
use tracing::{error, info, warn};

use crate::NodeError;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<Storage>,
    pub orchestrator: Arc<Orchestrator>,
    pub pool: WorkerPoolHandle,
    pub label: String,
    pub metrics_enabled: bool,
    pub start_instant: Instant,
}

#[derive(Serialize)]
struct StatusResponse {
    service: ServiceInfo,
    uptime_ms: u64,
    runs: Option<RunStepCounts>,
    workers: WorkerSnapshot,
}

#[derive(Serialize)]
struct ServiceInfo {
    name: &'static str,
    label: String,
    version: &'static str,
}

#[derive(Debug, Deserialize)]
struct LinkWalletRequest {
    user: UserId,
    wallet: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/submit-rating", post(submit_rating))
        .route("/link-wallet", post(link_wallet))
        .route("/healthz", get(health))
        .route("/readyz", get(ready))
        .route("/status", get(status))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serve until SIGINT/SIGTERM, then drain the worker pool and flush the store.
pub async fn serve(state: AppState, bind_address: &str) -> Result<(), NodeError> {
    let addr: SocketAddr = bind_address
        .parse()
        .map_err(|e| NodeError::Config(format!("invalid server.bind_address {bind_address}: {e}")))?;
    let pool = state.pool.clone();
    let storage = state.storage.clone();
    let app = router(state);

    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| NodeError::Server(e.to_string()))?;

    pool.shutdown().await;
    storage.flush()?;
    info!("node stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

fn error_response(status: StatusCode, message: impl ToString) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn gateway_status(err: &GatewayError) -> StatusCode {
    if err.is_transient() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

/// Accept a rating, persist its run and hand it to the worker pool.
async fn submit_rating(
    State(state): State<AppState>,
    Json(rating): Json<SubmitRating>,
) -> Response {
    let ack = match state.orchestrator.submit_rating(rating).await {
        Ok(ack) => ack,
        Err(e @ PipelineError::InvalidMetric(_)) => {
            return error_response(StatusCode::BAD_REQUEST, e);
        }
        Err(PipelineError::Gateway(e)) => return error_response(gateway_status(&e), e),
        Err(e) => {
            error!(error = %e, "rating submission failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, e);
        }
    };
    // The run is already durable; a full or stopped queue only delays it to
    // the next resume scan.
    if let Err(e) = state.pool.enqueue(ack.run_id) {
        warn!(run = %ack.run_id, error = %e, "run not queued; left for the resume scan");
    }
    let status = match ack.disposition {
        SubmitDisposition::Created => StatusCode::ACCEPTED,
        SubmitDisposition::Attached { .. } => StatusCode::OK,
    };
    (status, Json(ack)).into_response()
}

async fn link_wallet(
    State(state): State<AppState>,
    Json(request): Json<LinkWalletRequest>,
) -> Response {
    let wallet = match WalletAddress::parse(&request.wallet) {
        Ok(wallet) => wallet,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    let linked =
        PersistenceGateway::link_wallet(state.storage.as_ref(), request.user, wallet, now_ms())
            .await;
    match linked {
        Ok(user) => Json(user).into_response(),
        Err(e) => {
            warn!(user = %request.user, error = %e, "wallet link failed");
            error_response(gateway_status(&e), e)
        }
    }
}

async fn health() -> impl IntoResponse {
    "ok"
}

async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    match state.storage.get_meta("schema_version") {
        Ok(Some(_)) if state.pool.snapshot().workers_alive > 0 => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let uptime_ms = u64::try_from(state.start_instant.elapsed().as_millis()).unwrap_or(u64::MAX);
    let runs = match state.orchestrator.counts().await {
        Ok(counts) => Some(counts),
        Err(e) => {
            warn!(error = %e, "failed to count runs for status");
            None
        }
    };
    Json(StatusResponse {
        service: ServiceInfo {
            name: "pociv-node",
            label: state.label.clone(),
            version: env!("CARGO_PKG_VERSION"),
        },
        uptime_ms,
        runs,
        workers: state.pool.snapshot(),
    })
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    if !state.metrics_enabled {
        return (StatusCode::NOT_FOUND, String::new());
    }
    (StatusCode::OK, metrics::gather_text())
}
