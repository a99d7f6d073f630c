//! OpenAPI specification for the coqpool server.

use utoipa::OpenApi;

use super::handlers;
use super::types::*;
use crate::check::{CheckResult, ProblemId};
use crate::pool::{PoolStats, WorkerInfo};
use crate::rpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "coqpool API",
        description = "Proof checking for the CoqStoq benchmark. Proofs are sent as JSON-RPC 2.0 `check_proof` calls to `POST /` and checked by a bounded pool of per-theorem workers.",
        version = "1.0.0",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local server")
    ),
    paths(
        handlers::check_proof,
        handlers::health_check,
        handlers::get_stats,
    ),
    components(schemas(
        JsonRpcRequest,
        JsonRpcResponse,
        JsonRpcError,
        RequestId,
        CheckProofParams,
        CheckResult,
        ProblemId,
        HealthResponse,
        PoolStats,
        WorkerInfo,
    )),
    tags(
        (name = "rpc", description = "Proof checking"),
        (name = "health", description = "Health checks"),
        (name = "monitoring", description = "Pool statistics")
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_paths() {
        let doc = ApiDoc::openapi();
        let paths: Vec<&String> = doc.paths.paths.keys().collect();
        assert!(paths.contains(&&"/".to_string()));
        assert!(paths.contains(&&"/health".to_string()));
        assert!(paths.contains(&&"/stats".to_string()));
    }

    #[test]
    fn test_openapi_schemas() {
        let doc = ApiDoc::openapi();
        let schemas = doc.components.unwrap().schemas;
        assert!(schemas.contains_key("CheckProofParams"));
        assert!(schemas.contains_key("CheckResult"));
        assert!(schemas.contains_key("PoolStats"));
    }
}
