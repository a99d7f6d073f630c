//! Proof-check request and result types shared by the pool, the worker and the client.

use std::fmt;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Identifies one theorem-verification task: a split name and an index into
/// that split's theorem list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
pub struct ProblemId {
    /// Split name, e.g. `test`, `val`, `train-rl`.
    pub split: String,
    /// Index into the split's theorem list.
    pub idx: u64,
}

impl ProblemId {
    pub fn new(split: impl Into<String>, idx: u64) -> Self {
        Self {
            split: split.into(),
            idx,
        }
    }
}

impl fmt::Display for ProblemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.split, self.idx)
    }
}

/// Outcome of a proof check, serialized as the integers `1`, `0` and `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum Score {
    /// The proof checked.
    Verified,
    /// The proof was rejected by the proof assistant.
    Rejected,
    /// The check could not be carried out (timeout, worker failure, ...).
    Error,
}

impl From<Score> for i8 {
    fn from(score: Score) -> Self {
        match score {
            Score::Verified => 1,
            Score::Rejected => 0,
            Score::Error => -1,
        }
    }
}

impl TryFrom<i8> for Score {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, String> {
        match value {
            1 => Ok(Score::Verified),
            0 => Ok(Score::Rejected),
            -1 => Ok(Score::Error),
            other => Err(format!("invalid score {}: expected 1, 0 or -1", other)),
        }
    }
}

/// Result of checking one proof attempt.
///
/// An [`Score::Error`] result always carries exactly one message explaining
/// what went wrong.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CheckResult {
    /// `1` verified, `0` rejected, `-1` error.
    #[schema(value_type = i8)]
    pub score: Score,
    pub messages: Vec<String>,
}

impl CheckResult {
    pub fn verified() -> Self {
        Self {
            score: Score::Verified,
            messages: Vec::new(),
        }
    }

    pub fn rejected(messages: Vec<String>) -> Self {
        Self {
            score: Score::Rejected,
            messages,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            score: Score::Error,
            messages: vec![message.into()],
        }
    }

    pub fn is_verified(&self) -> bool {
        self.score == Score::Verified
    }

    pub fn is_error(&self) -> bool {
        self.score == Score::Error
    }
}
