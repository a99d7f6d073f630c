//! API request and response types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::check::ProblemId;

/// Default verification budget in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// Parameters of the `check_proof` JSON-RPC method.
///
/// Unknown fields (clients commonly send `coqstoq_loc`) are ignored.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CheckProofParams {
    /// Split name, e.g. `test`.
    pub split: String,
    /// Index into the split's theorem list.
    pub idx: u64,
    /// Candidate proof text, with or without a closing `Qed.`.
    pub proof: String,
    /// Total time budget in seconds (default: 120).
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl CheckProofParams {
    pub fn problem(&self) -> ProblemId {
        ProblemId::new(self.split.clone(), self.idx)
    }
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status.
    pub status: String,
    /// coqpool version.
    pub version: String,
    /// When the server started.
    pub started_at: DateTime<Utc>,
}
