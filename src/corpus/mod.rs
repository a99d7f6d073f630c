//! Read access to a CoqStoq checkout: splits, theorem lists and theorem text.
//!
//! Layout under the root, for a split named `N`:
//!
//! ```text
//! N-theorems.json          reference list: [{thm_path, thm_idx}, ...]
//! N-theorems/**.json       theorem records, one JSON array per source file
//! N-repos/<project>/...    the projects' sources
//! ```

mod text;

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CoqpoolError, Result};

/// Split names shipped with CoqStoq.
pub const KNOWN_SPLITS: &[&str] = &["train-sft", "train-rl", "val", "cutoff", "test"];

/// Where a split's repositories and theorem records live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Split {
    pub dir_name: String,
    pub thm_dir_name: String,
}

impl Split {
    pub fn from_name(name: &str) -> Self {
        Self {
            dir_name: format!("{}-repos", name),
            thm_dir_name: format!("{}-theorems", name),
        }
    }

    /// Path of the split's reference list, relative to the corpus root.
    pub fn theorem_list_loc(&self) -> PathBuf {
        PathBuf::from(format!("{}.json", self.thm_dir_name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub dir_name: String,
    pub split: Split,
    pub commit_hash: String,
    pub compile_args: Vec<String>,
}

impl Project {
    /// Project directory, relative to the corpus root.
    pub fn workspace(&self) -> PathBuf {
        Path::new(&self.split.dir_name).join(&self.dir_name)
    }
}

/// 0-based line and character column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

/// A theorem record, as written by the theorem finder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalTheorem {
    pub project: Project,
    /// Source file, relative to the project workspace.
    pub path: PathBuf,
    pub theorem_start_pos: Position,
    pub theorem_end_pos: Position,
    pub proof_start_pos: Position,
    pub proof_end_pos: Position,
    /// SHA-256 of the source file when the record was made.
    pub hash: String,
}

/// Entry of a split's reference list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TheoremReference {
    pub thm_path: PathBuf,
    pub thm_idx: usize,
}

/// Everything a prover needs about one theorem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TheoremInfo {
    pub split: String,
    pub index: usize,
    /// Source text before the theorem statement.
    pub prefix: String,
    /// Source text after the proof.
    pub suffix: String,
    /// The theorem statement.
    pub theorem: String,
    /// The original proof.
    pub ground_truth: String,
}

/// A theorem's source file, hash-checked, with the record's positions resolved.
#[derive(Debug, Clone)]
pub struct TheoremSource {
    text: String,
    theorem_start: usize,
    theorem_end: usize,
    proof_start: usize,
    proof_end: usize,
}

impl TheoremSource {
    pub fn prefix(&self) -> &str {
        &self.text[..self.theorem_start]
    }

    pub fn theorem(&self) -> &str {
        &self.text[self.theorem_start..self.theorem_end]
    }

    pub fn ground_truth(&self) -> &str {
        &self.text[self.proof_start..self.proof_end]
    }

    pub fn suffix(&self) -> &str {
        &self.text[self.proof_end..]
    }

    /// The source file with the original proof replaced by `proof`.
    pub fn check_contents(&self, proof: &str) -> String {
        text::splice_proof(&self.text, self.theorem_end, self.proof_end, proof)
    }
}

/// A CoqStoq checkout on disk.
#[derive(Debug, Clone)]
pub struct Corpus {
    root: PathBuf,
}

impl Corpus {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn splits(&self) -> Vec<String> {
        KNOWN_SPLITS.iter().map(|s| s.to_string()).collect()
    }

    pub fn reference_list(&self, split: &str) -> Result<Vec<TheoremReference>> {
        let path = self.root.join(Split::from_name(split).theorem_list_loc());
        let contents = fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CoqpoolError::SplitNotFound(split.to_string()),
            _ => CoqpoolError::Io(e),
        })?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn num_theorems(&self, split: &str) -> Result<usize> {
        Ok(self.reference_list(split)?.len())
    }

    fn load_records(&self, thm_path: &Path) -> Result<Vec<EvalTheorem>> {
        let contents = fs::read_to_string(self.root.join(thm_path))?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn resolve(&self, reference: &TheoremReference) -> Result<EvalTheorem> {
        let mut records = self.load_records(&reference.thm_path)?;
        if reference.thm_idx >= records.len() {
            return Err(CoqpoolError::TheoremIndexOutOfRange {
                split: reference.thm_path.display().to_string(),
                index: reference.thm_idx,
                count: records.len(),
            });
        }
        Ok(records.swap_remove(reference.thm_idx))
    }

    pub fn get_theorem(&self, split: &str, index: usize) -> Result<EvalTheorem> {
        let references = self.reference_list(split)?;
        let reference = references
            .get(index)
            .ok_or_else(|| CoqpoolError::TheoremIndexOutOfRange {
                split: split.to_string(),
                index,
                count: references.len(),
            })?;
        self.resolve(reference)
    }

    /// All theorems of a split, in reference-list order.
    ///
    /// Each records file is read once, however many theorems it holds.
    pub fn theorem_list(&self, split: &str) -> Result<Vec<EvalTheorem>> {
        let references = self.reference_list(split)?;
        let mut files: std::collections::HashMap<&Path, Vec<EvalTheorem>> =
            std::collections::HashMap::new();

        let mut theorems = Vec::with_capacity(references.len());
        for reference in &references {
            if !files.contains_key(reference.thm_path.as_path()) {
                let records = self.load_records(&reference.thm_path)?;
                files.insert(reference.thm_path.as_path(), records);
            }
            let records = &files[reference.thm_path.as_path()];
            let theorem = records.get(reference.thm_idx).cloned().ok_or_else(|| {
                CoqpoolError::TheoremIndexOutOfRange {
                    split: reference.thm_path.display().to_string(),
                    index: reference.thm_idx,
                    count: records.len(),
                }
            })?;
            theorems.push(theorem);
        }
        Ok(theorems)
    }

    /// Absolute path of a theorem's project workspace.
    pub fn workspace(&self, theorem: &EvalTheorem) -> PathBuf {
        self.root.join(theorem.project.workspace())
    }

    /// Read a theorem's source file, verify its hash and resolve positions.
    pub fn source(&self, theorem: &EvalTheorem) -> Result<TheoremSource> {
        let path = self.workspace(theorem).join(&theorem.path);
        let bytes = fs::read(&path)?;

        let actual = hex_digest(&bytes);
        if actual != theorem.hash {
            return Err(CoqpoolError::HashMismatch {
                path,
                expected: theorem.hash.clone(),
                actual,
            });
        }

        let text = String::from_utf8(bytes).map_err(|e| {
            CoqpoolError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        let offset = |pos: Position| text::byte_offset(&text, pos, &path);
        let theorem_start = offset(theorem.theorem_start_pos)?;
        let theorem_end = offset(theorem.theorem_end_pos)?;
        let proof_start = offset(theorem.proof_start_pos)?;
        let proof_end = offset(theorem.proof_end_pos)?;

        if !(theorem_start <= theorem_end && theorem_end <= proof_start && proof_start <= proof_end) {
            return Err(CoqpoolError::PositionOrder {
                path,
                detail: format!(
                    "theorem {:?}..{:?}, proof {:?}..{:?}",
                    theorem.theorem_start_pos,
                    theorem.theorem_end_pos,
                    theorem.proof_start_pos,
                    theorem.proof_end_pos
                ),
            });
        }

        Ok(TheoremSource {
            text,
            theorem_start,
            theorem_end,
            proof_start,
            proof_end,
        })
    }

    fn info(&self, split: &str, index: usize, theorem: &EvalTheorem) -> Result<TheoremInfo> {
        let source = self.source(theorem)?;
        Ok(TheoremInfo {
            split: split.to_string(),
            index,
            prefix: source.prefix().to_string(),
            suffix: source.suffix().to_string(),
            theorem: source.theorem().to_string(),
            ground_truth: source.ground_truth().to_string(),
        })
    }

    pub fn theorem_info(&self, split: &str, index: usize) -> Result<TheoremInfo> {
        let theorem = self.get_theorem(split, index)?;
        self.info(split, index, &theorem)
    }

    /// Theorems `start..end` of a split. Requires `start < len` and
    /// `start <= end <= len`.
    pub fn theorem_range(&self, split: &str, start: usize, end: usize) -> Result<Vec<TheoremInfo>> {
        let theorems = self.theorem_list(split)?;
        let count = theorems.len();
        if start > end || start >= count || end > count {
            return Err(CoqpoolError::InvalidRange {
                split: split.to_string(),
                start,
                end,
                count,
            });
        }

        theorems[start..end]
            .iter()
            .enumerate()
            .map(|(i, theorem)| self.info(split, start + i, theorem))
            .collect()
    }
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn hex_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
