//! API request handlers.
//!
//! The pool blocks the calling thread for the whole check (capacity wait,
//! worker startup, verification), so every pool call runs inside
//! `tokio::task::spawn_blocking()`. Each request holds one blocking thread for
//! its duration; tokio's blocking pool is sized far above any sensible pool
//! capacity.

use std::sync::Arc;
use std::time::Duration;

use axum::{Json, body::Bytes, extract::State};
use tracing::instrument;

use crate::pool::PoolStats;
use crate::rpc::{self, JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use crate::version;

use super::AppState;
use super::error::ApiError;
use super::types::*;

/// JSON-RPC endpoint.
///
/// The only method is `check_proof`, taking [`CheckProofParams`] and returning
/// a `{score, messages}` result. Checks that fail inside the pool (no free
/// worker in time, worker crash, timeout) still succeed at the RPC level with
/// `score = -1`; JSON-RPC errors are reserved for malformed requests.
#[utoipa::path(
    post,
    path = "/",
    request_body = JsonRpcRequest,
    responses(
        (status = 200, description = "JSON-RPC response; `result` is a CheckResult", body = JsonRpcResponse),
    ),
    tag = "rpc"
)]
#[instrument(skip_all)]
pub async fn check_proof(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<JsonRpcResponse>, ApiError> {
    let request = rpc::parse_request(&body)?;
    let id = request.id.clone();

    if request.method != rpc::CHECK_PROOF {
        return Err(ApiError::new(id, JsonRpcError::method_not_found(&request.method)));
    }
    let params: CheckProofParams = request
        .parse_params()
        .map_err(|e| ApiError::new(id.clone(), e))?;

    let problem = params.problem();
    tracing::debug!(problem = %problem, timeout_secs = params.timeout, "check_proof");

    let pool = Arc::clone(&state.pool);
    let timeout = Duration::from_secs(params.timeout);
    let result = tokio::task::spawn_blocking(move || pool.check_proof(&problem, &params.proof, timeout))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Proof check task panicked");
            ApiError::internal(id.clone(), format!("Task join error: {}", e))
        })?;

    let value = serde_json::to_value(result)
        .map_err(|e| ApiError::internal(id.clone(), e.to_string()))?;
    Ok(Json(JsonRpcResponse::success(id, value)))
}

/// Liveness check.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
    ),
    tag = "health"
)]
#[instrument(skip(state))]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: version::full_version(),
        started_at: state.started_at,
    })
}

/// Pool statistics: capacity, live and busy workers, lifetime counters and
/// the worker table.
#[utoipa::path(
    get,
    path = "/stats",
    responses(
        (status = 200, description = "Pool statistics", body = PoolStats),
    ),
    tag = "monitoring"
)]
#[instrument(skip(state))]
pub async fn get_stats(State(state): State<Arc<AppState>>) -> Result<Json<PoolStats>, ApiError> {
    let pool = Arc::clone(&state.pool);
    // Reading worker pids briefly locks each worker's process handle.
    let stats = tokio::task::spawn_blocking(move || pool.stats())
        .await
        .map_err(|e| ApiError::internal(None, format!("Task join error: {}", e)))?;
    Ok(Json(stats))
}
