//! Compiling proof attempts with the proof checker.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use crate::check::CheckResult;
use crate::corpus::{Corpus, EvalTheorem, TheoremSource};
use crate::error::{CoqpoolError, Result};

/// Prefix of the temporary files proofs are written to. Must stay a valid
/// Coq module name once the random suffix is appended.
const CHECK_FILE_PREFIX: &str = "CoqpoolCheck";

/// Compiler outputs that may be left next to the checked file.
const BUILD_ARTIFACTS: &[&str] = &["vo", "vok", "vos", "glob"];

/// Checks proof attempts for one theorem.
///
/// Each attempt is spliced into the theorem's source file, written to a
/// temporary file in the project workspace and compiled there. Attempts are
/// compiled one at a time.
pub struct ProofChecker {
    checker: String,
    workspace: PathBuf,
    compile_args: Vec<String>,
    source: TheoremSource,
    lock: Mutex<()>,
}

impl ProofChecker {
    pub fn new(corpus: &Corpus, theorem: &EvalTheorem, checker: impl Into<String>) -> Result<Self> {
        Ok(Self {
            checker: checker.into(),
            workspace: corpus.workspace(theorem),
            compile_args: theorem.project.compile_args.clone(),
            source: corpus.source(theorem)?,
            lock: Mutex::new(()),
        })
    }

    pub fn ground_truth(&self) -> &str {
        self.source.ground_truth()
    }

    /// Fail unless the theorem's original proof checks.
    pub fn sanity_check(&self) -> Result<()> {
        let result = self.check(self.ground_truth())?;
        if result.is_verified() {
            Ok(())
        } else {
            Err(CoqpoolError::SanityCheck(result.messages.join("\n")))
        }
    }

    /// Compile `proof` in place of the theorem's original proof.
    pub fn check(&self, proof: &str) -> Result<CheckResult> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let start = Instant::now();

        let mut file = tempfile::Builder::new()
            .prefix(CHECK_FILE_PREFIX)
            .suffix(".v")
            .tempfile_in(&self.workspace)?;
        file.write_all(self.source.check_contents(proof).as_bytes())?;
        file.flush()?;

        let vo_path = file.path().with_extension("vo");
        let output = Command::new(&self.checker)
            .arg("-o")
            .arg(&vo_path)
            .args(&self.compile_args)
            .arg(file.path())
            .current_dir(&self.workspace)
            .stdin(Stdio::null())
            .output();
        remove_artifacts(file.path());

        let output = output.map_err(|e| {
            CoqpoolError::Worker(format!("Failed to run checker '{}': {}", self.checker, e))
        })?;

        tracing::debug!(
            success = output.status.success(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Checked proof"
        );

        if output.status.success() {
            return Ok(CheckResult::verified());
        }

        let mut messages = split_messages(&String::from_utf8_lossy(&output.stderr));
        if messages.is_empty() {
            messages = split_messages(&String::from_utf8_lossy(&output.stdout));
        }
        if messages.is_empty() {
            messages.push(format!("{} failed with {}", self.checker, output.status));
        }
        Ok(CheckResult::rejected(messages))
    }
}

fn remove_artifacts(source: &Path) {
    for ext in BUILD_ARTIFACTS {
        let _ = std::fs::remove_file(source.with_extension(ext));
    }
}

/// Split compiler output into one message per diagnostic.
///
/// Coq starts every diagnostic with a `File "...", line N, ...` header; output
/// without such headers is kept as a single message.
pub fn split_messages(output: &str) -> Vec<String> {
    let mut messages: Vec<String> = Vec::new();
    let mut current = String::new();
    for line in output.lines() {
        if line.starts_with("File \"") && !current.trim().is_empty() {
            messages.push(current.trim_end().to_string());
            current.clear();
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        messages.push(current.trim_end().to_string());
    }
    messages
}
