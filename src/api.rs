//! HTTP server for health, readiness, metrics and operator review
//!
//! - GET /health  - pipeline counters (JSON)
//! - GET /healthz - liveness
//! - GET /readyz  - readiness: recovery finished and the reader is running
//! - GET /metrics - Prometheus metrics
//! - GET /pending - unfinished, abandoned and frozen records

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use eyre::eyre;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::coordinator::{RelayStats, SharedStats};
use crate::store::EventStore;
use crate::types::{RelayRecord, RelayState};

#[derive(Clone)]
pub struct AppState {
    pub stats: SharedStats,
    pub store: Arc<dyn EventStore>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(flatten)]
    pub stats: RelayStats,
}

/// One record as shown to operators
#[derive(Debug, Serialize)]
pub struct PendingRecord {
    pub dedup_key: String,
    pub state: RelayState,
    pub frozen: bool,
    pub block_number: u64,
    pub beneficiary: String,
    pub amount: String,
    pub asset_id: String,
    pub destination_tx_hash: Option<String>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl From<RelayRecord> for PendingRecord {
    fn from(record: RelayRecord) -> Self {
        Self {
            dedup_key: record.dedup_key.to_string(),
            state: record.state,
            frozen: record.frozen,
            block_number: record.event.block_number,
            beneficiary: record.event.payload.beneficiary,
            amount: record.event.payload.amount,
            asset_id: record.event.payload.asset_id,
            destination_tx_hash: record.destination_tx_hash,
            attempt_count: record.attempt_count,
            last_error: record.last_error,
            next_retry_at: record.next_retry_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PendingResponse {
    /// Still moving through the pipeline
    pub in_progress: Vec<PendingRecord>,
    /// Need operator intervention
    pub abandoned: Vec<PendingRecord>,
    pub frozen: Vec<PendingRecord>,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.stats.read().await.clone();
    Json(HealthResponse {
        status: "healthy".to_string(),
        stats,
    })
}

/// Liveness probe (always returns OK if server is running)
async fn liveness() -> &'static str {
    "OK"
}

async fn readiness(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.stats.read().await.is_ready() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT_READY")
    }
}

async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

async fn pending(State(state): State<AppState>) -> Response {
    let mut states = RelayState::NON_TERMINAL.to_vec();
    states.push(RelayState::Abandoned);

    // Frozen records are listed in every state, including terminal ones
    let listed = async {
        let open = state.store.scan_by_state(&states).await?;
        let frozen = state.store.scan_frozen().await?;
        Ok::<_, crate::error::RelayError>((open, frozen))
    };
    let (open, frozen) = match listed.await {
        Ok(lists) => lists,
        Err(e) => {
            error!(error = %e, "Failed to list pending records");
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
        }
    };

    let mut response = PendingResponse {
        in_progress: Vec::new(),
        abandoned: Vec::new(),
        frozen: frozen.into_iter().map(PendingRecord::from).collect(),
    };
    for record in open.into_iter().filter(|r| !r.frozen) {
        if record.state == RelayState::Abandoned {
            response.abandoned.push(record.into());
        } else {
            response.in_progress.push(record.into());
        }
    }
    Json(response).into_response()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/healthz", get(liveness))
        .route("/readyz", get(readiness))
        .route("/metrics", get(prometheus_metrics))
        .route("/pending", get(pending))
        .with_state(state)
}

/// Serve the API until `shutdown` is cancelled
pub async fn start_server(
    bind_address: &str,
    port: u16,
    state: AppState,
    shutdown: CancellationToken,
) -> eyre::Result<()> {
    let addr: SocketAddr = format!("{}:{}", bind_address, port)
        .parse()
        .map_err(|e| eyre!("Invalid bind address {}:{}: {}", bind_address, port, e))?;
    info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    Ok(())
}
