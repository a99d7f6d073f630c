//! Single-problem verification worker (`coqpool worker`).
//!
//! The pool launches one of these per problem. It loads the theorem,
//! optionally checks that the original proof still compiles, and only then
//! starts listening, so an open port means the worker is ready. It serves one
//! JSON-RPC method, `check_proof(proof) -> {score, messages}`, and exits on
//! SIGTERM or Ctrl+C.

mod checker;

use std::path::PathBuf;
use std::sync::Arc;

use axum::{Json, Router, body::Bytes, extract::State, routing::post};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use crate::check::ProblemId;
use crate::corpus::Corpus;
use crate::error::{CoqpoolError, Result};
use crate::rpc::{self, JsonRpcError, JsonRpcResponse};

use checker::ProofChecker;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerServerConfig {
    pub problem: ProblemId,
    pub coqstoq: PathBuf,
    pub host: String,
    pub port: u16,
    /// Proof checker executable, `coqc` by default.
    pub checker: String,
    pub skip_sanity_check: bool,
}

#[derive(Debug, Deserialize)]
struct CheckProofParams {
    proof: String,
}

/// Load the problem, sanity-check it and serve until told to stop.
pub fn run(config: WorkerServerConfig) -> Result<()> {
    let corpus = Corpus::new(&config.coqstoq);
    let index = usize::try_from(config.problem.idx).map_err(|_| {
        CoqpoolError::TheoremIndexOutOfRange {
            split: config.problem.split.clone(),
            index: usize::MAX,
            count: 0,
        }
    })?;
    let theorem = corpus.get_theorem(&config.problem.split, index)?;
    let checker = ProofChecker::new(&corpus, &theorem, &config.checker)?;

    if config.skip_sanity_check {
        tracing::debug!(problem = %config.problem, "Skipping sanity check");
    } else {
        checker.sanity_check()?;
        tracing::debug!(problem = %config.problem, "Ground truth checks");
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(serve(config, Arc::new(checker)))
}

async fn serve(config: WorkerServerConfig, checker: Arc<ProofChecker>) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(problem = %config.problem, %addr, "Worker listening");

    axum::serve(listener, router(checker))
        .with_graceful_shutdown(crate::server::shutdown_signal())
        .await?;

    tracing::info!(problem = %config.problem, "Worker stopped");
    Ok(())
}

fn router(checker: Arc<ProofChecker>) -> Router {
    Router::new()
        .route("/", post(handle_rpc))
        .layer(TraceLayer::new_for_http())
        .with_state(checker)
}

async fn handle_rpc(State(checker): State<Arc<ProofChecker>>, body: Bytes) -> Json<JsonRpcResponse> {
    let request = match rpc::parse_request(&body) {
        Ok(request) => request,
        Err(response) => return Json(response),
    };
    if request.method != rpc::CHECK_PROOF {
        return Json(JsonRpcResponse::error(
            request.id,
            JsonRpcError::method_not_found(&request.method),
        ));
    }
    let params: CheckProofParams = match request.parse_params() {
        Ok(params) => params,
        Err(error) => return Json(JsonRpcResponse::error(request.id, error)),
    };

    let outcome = tokio::task::spawn_blocking(move || checker.check(&params.proof)).await;
    let response = match outcome {
        Ok(Ok(result)) => match serde_json::to_value(result) {
            Ok(value) => JsonRpcResponse::success(request.id, value),
            Err(e) => JsonRpcResponse::error(request.id, JsonRpcError::internal_error(e.to_string())),
        },
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Proof check failed");
            JsonRpcResponse::error(request.id, JsonRpcError::internal_error(e.to_string()))
        }
        Err(e) => {
            tracing::error!(error = %e, "Proof check task panicked");
            JsonRpcResponse::error(request.id, JsonRpcError::internal_error(e.to_string()))
        }
    };
    Json(response)
}
