//! coqpool - proof-checking worker pool for the CoqStoq benchmark

mod check;
mod cli;
mod client;
mod corpus;
mod error;
mod logging;
mod pool;
mod rpc;
mod server;
pub mod version;
mod worker;

use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use serde::Serialize;
use tracing::Level;

use check::{CheckResult, ProblemId};
use cli::{Cli, Commands, Verbosity};
use client::PoolClient;
use corpus::Corpus;
use logging::LogConfig;

/// Program entry point: parses CLI arguments, sets up logging, dispatches the
/// selected command, and on error prints the error chain and exits with 1.
fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }
    init_logging(&cli);

    let result = match &cli.command {
        Commands::Serve(args) => cmd_serve(&cli, args),
        Commands::Worker(args) => cmd_worker(args),
        Commands::Check(args) => cmd_check(&cli, args),
        Commands::VerifySplit(args) => cmd_verify_split(&cli, args),
        Commands::Splits => cmd_splits(&cli),
        Commands::Count(args) => cmd_count(&cli, args),
        Commands::Theorem(args) => cmd_theorem(&cli, args),
        Commands::Range(args) => cmd_range(&cli, args),
        Commands::Completions(args) => {
            args.generate();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Long-running commands log at INFO by default, one-shot commands at WARN.
/// Environment settings apply first; CLI flags override them.
fn init_logging(cli: &Cli) {
    let (config, base) = match cli.command {
        Commands::Serve(_) => (LogConfig::for_server(), Level::INFO),
        Commands::Worker(_) => (LogConfig::for_worker(), Level::INFO),
        _ => (LogConfig::new(), Level::WARN),
    };
    let mut config = config.with_level(base).with_env_overrides();

    match cli.verbosity() {
        Verbosity::Normal => {}
        Verbosity::Quiet => config = config.with_filter("error".to_string()),
        verbosity => {
            let level = verbosity.level(base).to_string().to_lowercase();
            config = config.with_filter(format!("warn,coqpool={level},tower_http={level}"));
        }
    }
    if let Some(format) = cli.log_format {
        config = config.with_format(format.into());
    }
    if let Some(ref path) = cli.log_file {
        config = config.with_file(path.clone());
    }
    if let Some(rotation) = cli.log_rotation {
        config = config.with_rotation(rotation.into());
    }
    if cli.log_span_events {
        config = config.with_span_events(true);
    }
    if cli.no_color {
        config = config.with_ansi(false);
    }

    logging::init(config);
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_serve(cli: &Cli, args: &cli::ServeArgs) -> Result<()> {
    use crate::pool::{
        BuiltinWorkerOptions, CommandLauncher, HttpTransport, PoolConfig, WorkerCommand, WorkerPool,
    };
    use crate::server::{ServerConfig, run_server};

    let defaults = PoolConfig::default();
    let capacity = args.capacity.unwrap_or(defaults.capacity);
    if capacity == 0 {
        bail!("--capacity must be at least 1");
    }
    let pool_config = PoolConfig {
        capacity,
        host: args.worker_host,
        retry_interval: Duration::from_millis(args.retry_interval_ms),
        startup_timeout: Duration::from_secs(args.startup_timeout_secs),
        recycle_on_timeout: !args.no_recycle_on_timeout,
        ..defaults
    };

    // Workers may run with a different working directory.
    let coqstoq = std::fs::canonicalize(&cli.coqstoq)
        .with_context(|| format!("CoqStoq repository not found at {}", cli.coqstoq.display()))?;

    let command = match &args.worker_program {
        Some(program) => WorkerCommand::new(program, args.worker_args.clone(), &coqstoq),
        None => WorkerCommand::builtin(
            &coqstoq,
            &BuiltinWorkerOptions {
                checker: Some(args.checker.clone()),
                skip_sanity_check: args.worker_skip_sanity_check,
            },
        )?,
    };

    // The blocking HTTP client inside the transport must be created and
    // dropped outside the async runtime.
    let pool = Arc::new(WorkerPool::new(
        pool_config,
        Arc::new(CommandLauncher::new(command)),
        Arc::new(HttpTransport::new()?),
    ));

    let config = ServerConfig {
        host: args.host.clone(),
        port: args.port,
        cors: args.cors,
        cors_origins: args.cors_origins.clone(),
    };

    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    let result = rt.block_on(run_server(config, Arc::clone(&pool)));
    drop(rt);
    drop(pool);

    result?;
    Ok(())
}

fn cmd_worker(args: &cli::WorkerArgs) -> Result<()> {
    use crate::worker::{WorkerServerConfig, run};

    run(WorkerServerConfig {
        problem: ProblemId::new(args.split.clone(), args.idx),
        coqstoq: args.coqstoq.clone(),
        host: args.host.clone(),
        port: args.port,
        checker: args.checker.clone(),
        skip_sanity_check: args.skip_sanity_check,
    })?;
    Ok(())
}

fn cmd_check(cli: &Cli, args: &cli::CheckArgs) -> Result<()> {
    let proof = if args.ground_truth {
        let index = usize::try_from(args.idx).context("theorem index too large")?;
        Corpus::new(&cli.coqstoq)
            .theorem_info(&args.split, index)?
            .ground_truth
    } else {
        match args.proof_file.as_deref() {
            Some(path) if path.as_os_str() == "-" => {
                let mut proof = String::new();
                std::io::stdin()
                    .read_to_string(&mut proof)
                    .context("Failed to read proof from stdin")?;
                proof
            }
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read proof from {}", path.display()))?,
            None => bail!("either --proof-file or --ground-truth is required"),
        }
    };

    let client = PoolClient::new(&args.url)?;
    let problem = ProblemId::new(args.split.clone(), args.idx);
    let result = client.check_proof(&problem, &proof, Duration::from_secs(args.timeout))?;
    print_json(&result)
}

/// Outcome of `coqpool verify-split`.
#[derive(Debug, Default, Serialize)]
struct VerifySummary {
    split: String,
    start: usize,
    end: usize,
    verified: usize,
    rejected: usize,
    errors: usize,
    /// Indices whose ground truth did not verify.
    failures: Vec<usize>,
}

impl VerifySummary {
    fn record(&mut self, index: usize, result: &CheckResult) {
        if result.is_verified() {
            self.verified += 1;
            return;
        }
        if result.is_error() {
            self.errors += 1;
        } else {
            self.rejected += 1;
        }
        self.failures.push(index);
    }
}

fn cmd_verify_split(cli: &Cli, args: &cli::VerifySplitArgs) -> Result<()> {
    if args.jobs == 0 {
        bail!("--jobs must be at least 1");
    }
    let corpus = Corpus::new(&cli.coqstoq);
    let end = match args.end {
        Some(end) => end,
        None => corpus.num_theorems(&args.split)?,
    };
    let theorems = corpus.theorem_range(&args.split, args.start, end)?;
    let client = PoolClient::new(&args.url)?;
    let timeout = Duration::from_secs(args.timeout);

    let health = client
        .health()
        .with_context(|| format!("Pool server at {} is not reachable", client.base_url()))?;
    if health.status != "ok" {
        bail!("Pool server at {} reports status '{}'", client.base_url(), health.status);
    }

    tracing::info!(
        split = %args.split,
        count = theorems.len(),
        jobs = args.jobs,
        url = client.base_url(),
        server_version = %health.version,
        "Verifying ground truth proofs"
    );

    let next = AtomicUsize::new(0);
    let results = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..args.jobs.min(theorems.len()))
            .map(|_| {
                scope.spawn(|| {
                    let mut done = Vec::new();
                    loop {
                        let i = next.fetch_add(1, Ordering::Relaxed);
                        let Some(theorem) = theorems.get(i) else {
                            break;
                        };
                        let problem = ProblemId::new(theorem.split.clone(), theorem.index as u64);
                        let result = client
                            .check_proof(&problem, &theorem.ground_truth, timeout)
                            .unwrap_or_else(|e| CheckResult::error(e.to_string()));
                        if !result.is_verified() {
                            tracing::warn!(
                                problem = %problem,
                                score = i8::from(result.score),
                                messages = ?result.messages,
                                "Ground truth did not verify"
                            );
                        }
                        done.push((theorem.index, result));
                    }
                    done
                })
            })
            .collect();
        let joined: Vec<_> = handles.into_iter().map(|h| h.join()).collect();
        merge_thread_results(joined)
    })?;

    let mut summary = VerifySummary {
        split: args.split.clone(),
        start: args.start,
        end,
        ..VerifySummary::default()
    };
    for (index, result) in &results {
        summary.record(*index, result);
    }
    summary.failures.sort_unstable();

    print_json(&summary)
}

/// Concatenate per-thread results, failing if any thread panicked.
fn merge_thread_results<T>(joined: Vec<std::thread::Result<Vec<T>>>) -> Result<Vec<T>> {
    let total = joined.len();
    let mut merged = Vec::new();
    let mut panicked = 0;
    for result in joined {
        match result {
            Ok(items) => merged.extend(items),
            Err(_) => panicked += 1,
        }
    }
    if panicked > 0 {
        bail!("{} of {} verification threads panicked", panicked, total);
    }
    Ok(merged)
}

fn cmd_splits(cli: &Cli) -> Result<()> {
    print_json(&Corpus::new(&cli.coqstoq).splits())
}

fn cmd_count(cli: &Cli, args: &cli::CountArgs) -> Result<()> {
    println!("{}", Corpus::new(&cli.coqstoq).num_theorems(&args.split)?);
    Ok(())
}

fn cmd_theorem(cli: &Cli, args: &cli::TheoremArgs) -> Result<()> {
    print_json(&Corpus::new(&cli.coqstoq).theorem_info(&args.split, args.index)?)
}

fn cmd_range(cli: &Cli, args: &cli::RangeArgs) -> Result<()> {
    print_json(&Corpus::new(&cli.coqstoq).theorem_range(&args.split, args.start, args.end)?)
}
