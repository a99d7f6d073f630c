//! Worker subprocess launching.
//!
//! Workers are plain executables started from an argument template. The
//! default template re-runs this binary in `worker` mode, but any program that
//! honours the worker contract (serve JSON-RPC `check_proof` on the given
//! address, exit on SIGTERM) can be plugged in with `--worker-program`.

use std::net::SocketAddr;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use super::proc::{Proc, WorkerProcess};
use crate::check::ProblemId;
use crate::error::{CoqpoolError, Result};

/// Starts worker processes. The pool never spawns anything directly.
pub trait WorkerLauncher: Send + Sync {
    /// Start a worker for `problem` that will listen on `address`.
    fn launch(&self, problem: &ProblemId, address: SocketAddr) -> Result<Box<dyn WorkerProcess>>;
}

/// A program plus an argument template.
///
/// Arguments may contain the placeholders `{split}`, `{idx}`, `{coqstoq}`,
/// `{host}` and `{port}`.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub coqstoq: PathBuf,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, coqstoq: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            coqstoq: coqstoq.into(),
        }
    }

    /// Run this binary's own `worker` subcommand.
    pub fn builtin(coqstoq: impl Into<PathBuf>, options: &BuiltinWorkerOptions) -> Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| CoqpoolError::Worker(format!("Failed to get current executable: {}", e)))?;

        let mut args: Vec<String> = [
            "worker", "{split}", "{idx}", "{coqstoq}", "--host", "{host}", "--port", "{port}",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        if let Some(checker) = &options.checker {
            args.push("--checker".to_string());
            args.push(checker.clone());
        }
        if options.skip_sanity_check {
            args.push("--skip-sanity-check".to_string());
        }

        Ok(Self::new(program, args, coqstoq))
    }

    /// Expand the argument template for one worker.
    pub fn render_args(&self, problem: &ProblemId, address: SocketAddr) -> Vec<String> {
        let coqstoq = self.coqstoq.to_string_lossy();
        let host = address.ip().to_string();
        let port = address.port().to_string();
        let idx = problem.idx.to_string();

        self.args
            .iter()
            .map(|arg| {
                arg.replace("{split}", &problem.split)
                    .replace("{idx}", &idx)
                    .replace("{coqstoq}", &coqstoq)
                    .replace("{host}", &host)
                    .replace("{port}", &port)
            })
            .collect()
    }
}

/// Options forwarded to the builtin worker.
#[derive(Debug, Clone, Default)]
pub struct BuiltinWorkerOptions {
    /// Proof checker executable (defaults to the worker's own default, `coqc`).
    pub checker: Option<String>,
    pub skip_sanity_check: bool,
}

/// Launches workers as subprocesses in their own process group.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    command: WorkerCommand,
}

impl CommandLauncher {
    pub fn new(command: WorkerCommand) -> Self {
        Self { command }
    }
}

impl WorkerLauncher for CommandLauncher {
    fn launch(&self, problem: &ProblemId, address: SocketAddr) -> Result<Box<dyn WorkerProcess>> {
        let args = self.command.render_args(problem, address);
        tracing::debug!(
            problem = %problem,
            %address,
            program = %self.command.program.display(),
            ?args,
            "Launching worker"
        );

        let child = Command::new(&self.command.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit()) // Worker diagnostics go to our stderr
            .process_group(0)
            .spawn()
            .map_err(|e| {
                CoqpoolError::Worker(format!(
                    "Failed to spawn worker {}: {}",
                    self.command.program.display(),
                    e
                ))
            })?;

        Ok(Box::new(Proc::from_child(child)))
    }
}
