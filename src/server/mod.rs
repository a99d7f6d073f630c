//! HTTP front end of the worker pool.
//!
//! Accepts JSON-RPC 2.0 `check_proof` calls on `POST /` and hands them to a
//! shared [`WorkerPool`].
//!
//! # Example
//!
//! ```bash
//! # Start the server
//! coqpool serve --port 8080 --capacity 8
//!
//! # Check a proof
//! curl -s localhost:8080/ -d '{"jsonrpc": "2.0", "id": 1, "method": "check_proof",
//!   "params": {"split": "val", "idx": 3, "proof": "Proof. auto. Qed."}}'
//!
//! # View API documentation
//! open "http://localhost:8080/docs"
//! ```

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod openapi;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

use crate::error::Result;
use crate::pool::WorkerPool;

/// Shared application state.
pub struct AppState {
    pub pool: Arc<WorkerPool>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self {
            pool,
            started_at: Utc::now(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Enable CORS for all origins.
    pub cors: bool,
    /// Specific CORS origins (used when `cors` is false).
    pub cors_origins: Option<Vec<String>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            cors: false,
            cors_origins: None,
        }
    }
}

/// Constructs the HTTP router: the JSON-RPC endpoint, health and stats,
/// OpenAPI UI at `/docs` and the raw document at `/openapi.json`, wrapped in
/// request tracing and correlation IDs.
pub fn build_router(state: Arc<AppState>, cors: Option<CorsLayer>) -> Router {
    let mut app = Router::new()
        .route("/", post(handlers::check_proof))
        .route("/health", get(handlers::health_check))
        .route("/stats", get(handlers::get_stats))
        .merge(Scalar::with_url("/docs", openapi::ApiDoc::openapi()))
        .route(
            "/openapi.json",
            get(|| async { axum::Json(openapi::ApiDoc::openapi()) }),
        )
        .layer(TraceLayer::new_for_http())
        .layer(axum_middleware::from_fn(middleware::request_id_middleware))
        .with_state(state);

    if let Some(cors_layer) = cors {
        app = app.layer(cors_layer);
    }

    app
}

fn cors_layer(config: &ServerConfig) -> Option<CorsLayer> {
    if config.cors {
        return Some(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
                .max_age(Duration::from_secs(3600)),
        );
    }
    let origins: Vec<_> = config
        .cors_origins
        .as_ref()?
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    if origins.is_empty() {
        return None;
    }
    Some(
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
            .max_age(Duration::from_secs(3600)),
    )
}

/// Serve `pool` until Ctrl+C or SIGTERM, then stop every worker.
///
/// Must run inside a tokio runtime. The pool itself is not dropped here; its
/// blocking HTTP client has to be dropped outside the runtime.
pub async fn run_server(config: ServerConfig, pool: Arc<WorkerPool>) -> Result<()> {
    let state = Arc::new(AppState::new(Arc::clone(&pool)));
    let app = build_router(state, cors_layer(&config));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(%addr, capacity = pool.config().capacity, "Pool server listening");
    eprintln!("Starting coqpool server on http://{}", addr);
    eprintln!("API documentation: http://{}/docs", addr);
    eprintln!("OpenAPI spec: http://{}/openapi.json", addr);
    eprintln!();
    eprintln!("Press Ctrl+C to stop");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Stopping workers");
    tokio::task::spawn_blocking(move || pool.shutdown())
        .await
        .map_err(|e| crate::error::CoqpoolError::Worker(format!("Pool shutdown failed: {}", e)))?;

    eprintln!("\nServer stopped");
    Ok(())
}

/// Completes on Ctrl+C (SIGINT) or SIGTERM.
///
/// If a handler cannot be installed the error is logged and that signal is
/// ignored.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => tracing::debug!("Received Ctrl+C"),
        _ = terminate => tracing::debug!("Received SIGTERM"),
    }
}
