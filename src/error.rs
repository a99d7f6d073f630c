//! Error types for coqpool.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Main error type for coqpool.
#[derive(Error, Debug)]
pub enum CoqpoolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Unknown split '{0}': no theorem list found. Is --coqstoq pointing at the CoqStoq repository?")]
    SplitNotFound(String),

    #[error("Theorem index {index} out of range for split '{split}' ({count} theorems)")]
    TheoremIndexOutOfRange {
        split: String,
        index: usize,
        count: usize,
    },

    #[error("Invalid theorem range {start}..{end} for split '{split}' ({count} theorems)")]
    InvalidRange {
        split: String,
        start: usize,
        end: usize,
        count: usize,
    },

    #[error("Hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Position {line}:{column} is outside of {path}")]
    PositionOutOfBounds {
        path: PathBuf,
        line: usize,
        column: usize,
    },

    #[error("Theorem positions in {path} are out of order: {detail}")]
    PositionOrder { path: PathBuf, detail: String },

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Worker did not become ready within {}s", .0.as_secs())]
    WorkerStartupTimeout(Duration),

    #[error("Timed out after {}s waiting for a free worker slot", .0.as_secs())]
    CapacityTimeout(Duration),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("No free port available for a new worker")]
    NoFreePort,

    #[error("Pool invariant violated: {0}")]
    PoolInvariant(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Ground truth proof does not check: {0}")]
    SanityCheck(String),
}

/// Result type alias for coqpool operations.
pub type Result<T> = std::result::Result<T, CoqpoolError>;
