//! Command-line interface definitions using clap.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{ArgGroup, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use tracing::Level;

use crate::logging::{LogFormat, LogRotation};

/// Proof-checking worker pool and corpus tools for the CoqStoq benchmark.
#[derive(Parser, Debug)]
#[command(name = "coqpool")]
#[command(author, version, long_version = crate::version::long_version(), about, long_about = None)]
pub struct Cli {
    /// Path to the CoqStoq repository.
    #[arg(long, global = true, env = "COQPOOL_COQSTOQ", default_value = ".")]
    pub coqstoq: PathBuf,

    /// More log output (-v for debug, -vv for trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log errors only.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log line format.
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormatArg>,

    /// Also write logs to this file.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// How often the log file is rotated (default: daily).
    #[arg(long, global = true, value_enum)]
    pub log_rotation: Option<LogRotationArg>,

    /// Log span timings when spans close.
    #[arg(long, global = true)]
    pub log_span_events: bool,

    /// Disable colored output.
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the proof-checking pool server.
    Serve(ServeArgs),

    /// Run a single-problem worker (started by the pool).
    #[command(hide = true)]
    Worker(WorkerArgs),

    /// Send one proof to a running pool.
    Check(CheckArgs),

    /// Check the ground truth of a range of theorems through a running pool.
    VerifySplit(VerifySplitArgs),

    /// List the known split names.
    Splits,

    /// Print the number of theorems in a split.
    Count(CountArgs),

    /// Print one theorem as JSON.
    Theorem(TheoremArgs),

    /// Print a range of theorems as JSON.
    Range(RangeArgs),

    /// Generate shell completions.
    Completions(CompletionsArgs),
}

/// Arguments for shell completions.
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate and print completions to stdout.
    pub fn generate(&self) {
        clap_complete::generate(
            self.shell,
            &mut Cli::command(),
            "coqpool",
            &mut std::io::stdout(),
        );
    }
}

/// Arguments for the serve command.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Address to bind the API server to.
    #[arg(long, env = "COQPOOL_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on.
    #[arg(short, long, env = "COQPOOL_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Maximum number of live workers (default: number of CPUs).
    #[arg(short, long, env = "COQPOOL_CAPACITY")]
    pub capacity: Option<usize>,

    /// Address workers listen on.
    #[arg(long, default_value = "127.0.0.1")]
    pub worker_host: IpAddr,

    /// Longest single wait for a free worker slot before re-checking.
    #[arg(long, default_value_t = 100)]
    pub retry_interval_ms: u64,

    /// How long a new worker may take to load its theorem.
    #[arg(long, default_value_t = 300)]
    pub startup_timeout_secs: u64,

    /// Keep workers whose check timed out instead of restarting them.
    #[arg(long)]
    pub no_recycle_on_timeout: bool,

    /// Custom worker executable. Its arguments come from --worker-arg.
    #[arg(long, requires = "worker_args")]
    pub worker_program: Option<PathBuf>,

    /// Worker argument template; may use {split}, {idx}, {coqstoq}, {host}, {port}.
    #[arg(long = "worker-arg", allow_hyphen_values = true, requires = "worker_program")]
    pub worker_args: Vec<String>,

    /// Proof checker run by the builtin worker.
    #[arg(long, env = "COQPOOL_CHECKER", default_value = "coqc")]
    pub checker: String,

    /// Start builtin workers without compiling the original proof first.
    #[arg(long)]
    pub worker_skip_sanity_check: bool,

    /// Enable CORS for all origins.
    #[arg(long)]
    pub cors: bool,

    /// Allowed CORS origins (comma-separated).
    #[arg(long, value_delimiter = ',')]
    pub cors_origins: Option<Vec<String>>,
}

/// Arguments for the worker command.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    pub split: String,
    pub idx: u64,
    /// CoqStoq repository the theorem is read from.
    pub coqstoq: PathBuf,

    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long)]
    pub port: u16,

    #[arg(long, default_value = "coqc")]
    pub checker: String,

    #[arg(long)]
    pub skip_sanity_check: bool,
}

/// Arguments for the check command.
#[derive(Parser, Debug)]
#[command(group(ArgGroup::new("proof_source").required(true).args(["proof_file", "ground_truth"])))]
pub struct CheckArgs {
    pub split: String,
    pub idx: u64,

    /// File holding the proof to check ("-" for stdin).
    #[arg(long)]
    pub proof_file: Option<PathBuf>,

    /// Check the theorem's original proof.
    #[arg(long)]
    pub ground_truth: bool,

    /// Time budget in seconds.
    #[arg(short, long, default_value_t = 120)]
    pub timeout: u64,

    /// Pool server URL.
    #[arg(long, env = "COQPOOL_URL", default_value = "http://127.0.0.1:8080")]
    pub url: String,
}

/// Arguments for the verify-split command.
#[derive(Parser, Debug)]
pub struct VerifySplitArgs {
    pub split: String,

    /// First theorem index.
    #[arg(long, default_value_t = 0)]
    pub start: usize,

    /// One past the last theorem index (default: end of split).
    #[arg(long)]
    pub end: Option<usize>,

    /// Concurrent requests.
    #[arg(short, long, default_value_t = default_jobs())]
    pub jobs: usize,

    /// Time budget per theorem in seconds.
    #[arg(short, long, default_value_t = 120)]
    pub timeout: u64,

    /// Pool server URL.
    #[arg(long, env = "COQPOOL_URL", default_value = "http://127.0.0.1:8080")]
    pub url: String,
}

fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[derive(Parser, Debug)]
pub struct CountArgs {
    pub split: String,
}

#[derive(Parser, Debug)]
pub struct TheoremArgs {
    pub split: String,
    pub index: usize,
}

#[derive(Parser, Debug)]
pub struct RangeArgs {
    pub split: String,
    pub start: usize,
    pub end: usize,
}

/// Log format argument.
#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum LogFormatArg {
    Pretty,
    Compact,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Compact => LogFormat::Compact,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

/// Log file rotation argument.
#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum LogRotationArg {
    Hourly,
    Daily,
    Never,
}

impl From<LogRotationArg> for LogRotation {
    fn from(arg: LogRotationArg) -> Self {
        match arg {
            LogRotationArg::Hourly => LogRotation::Hourly,
            LogRotationArg::Daily => LogRotation::Daily,
            LogRotationArg::Never => LogRotation::Never,
        }
    }
}

/// Verbosity level for log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// -q: errors only.
    Quiet,
    /// The command's default level.
    Normal,
    /// -v
    Debug,
    /// -vv
    Trace,
}

impl Verbosity {
    /// Log level for a command whose default is `base`.
    pub fn level(self, base: Level) -> Level {
        match self {
            Verbosity::Quiet => Level::ERROR,
            Verbosity::Normal => base,
            Verbosity::Debug => Level::DEBUG,
            Verbosity::Trace => Level::TRACE,
        }
    }
}

impl Cli {
    /// Get the verbosity level based on -v and -q flags.
    pub fn verbosity(&self) -> Verbosity {
        if self.quiet {
            return Verbosity::Quiet;
        }
        match self.verbose {
            0 => Verbosity::Normal,
            1 => Verbosity::Debug,
            _ => Verbosity::Trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parsing() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_defaults() {
        let args = Cli::try_parse_from(["coqpool", "serve"]).unwrap();
        match args.command {
            Commands::Serve(serve) => {
                assert_eq!(serve.port, 8080);
                assert_eq!(serve.retry_interval_ms, 100);
                assert_eq!(serve.checker, "coqc");
                assert!(!serve.no_recycle_on_timeout);
                assert!(serve.worker_program.is_none());
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_serve_custom_worker() {
        let args = Cli::try_parse_from([
            "coqpool",
            "serve",
            "--capacity",
            "3",
            "--worker-program",
            "python3",
            "--worker-arg",
            "-m",
            "--worker-arg",
            "coqstoq.worker",
            "--worker-arg",
            "{port}",
        ])
        .unwrap();
        match args.command {
            Commands::Serve(serve) => {
                assert_eq!(serve.capacity, Some(3));
                assert_eq!(serve.worker_program, Some(PathBuf::from("python3")));
                assert_eq!(serve.worker_args, vec!["-m", "coqstoq.worker", "{port}"]);
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_worker_program_needs_args() {
        let result = Cli::try_parse_from(["coqpool", "serve", "--worker-program", "x"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_worker_command() {
        let args = Cli::try_parse_from([
            "coqpool", "worker", "test", "17", "/data/coqstoq", "--port", "4100",
        ])
        .unwrap();
        match args.command {
            Commands::Worker(worker) => {
                assert_eq!(worker.split, "test");
                assert_eq!(worker.idx, 17);
                assert_eq!(worker.coqstoq, PathBuf::from("/data/coqstoq"));
                assert_eq!(worker.port, 4100);
                assert_eq!(worker.host, "127.0.0.1");
            }
            _ => panic!("Expected Worker command"),
        }
    }

    #[test]
    fn test_check_requires_proof_source() {
        assert!(Cli::try_parse_from(["coqpool", "check", "val", "1"]).is_err());
        assert!(
            Cli::try_parse_from([
                "coqpool",
                "check",
                "val",
                "1",
                "--ground-truth",
                "--proof-file",
                "p.v"
            ])
            .is_err()
        );

        let args = Cli::try_parse_from(["coqpool", "check", "val", "1", "--ground-truth"]).unwrap();
        match args.command {
            Commands::Check(check) => {
                assert!(check.ground_truth);
                assert_eq!(check.timeout, 120);
            }
            _ => panic!("Expected Check command"),
        }
    }

    #[test]
    fn test_range_command() {
        let args = Cli::try_parse_from(["coqpool", "range", "val", "2", "5"]).unwrap();
        match args.command {
            Commands::Range(range) => {
                assert_eq!(range.split, "val");
                assert_eq!((range.start, range.end), (2, 5));
            }
            _ => panic!("Expected Range command"),
        }
    }

    #[test]
    fn test_global_options() {
        let args = Cli::try_parse_from([
            "coqpool",
            "count",
            "val",
            "-vv",
            "--coqstoq",
            "/data/coqstoq",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(args.verbosity(), Verbosity::Trace);
        assert_eq!(args.coqstoq, PathBuf::from("/data/coqstoq"));
        assert!(matches!(args.log_format, Some(LogFormatArg::Json)));
        assert!(!args.log_span_events);
    }

    #[test]
    fn test_log_file_options() {
        let args = Cli::try_parse_from([
            "coqpool",
            "serve",
            "--log-file",
            "/tmp/pool.log",
            "--log-rotation",
            "hourly",
            "--log-span-events",
        ])
        .unwrap();
        assert!(matches!(args.log_rotation, Some(LogRotationArg::Hourly)));
        assert_eq!(LogRotation::from(LogRotationArg::Never), LogRotation::Never);
        assert!(args.log_span_events);
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        let result = Cli::try_parse_from(["coqpool", "-v", "-q", "splits"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(Verbosity::Quiet.level(Level::INFO), Level::ERROR);
        assert_eq!(Verbosity::Normal.level(Level::WARN), Level::WARN);
        assert_eq!(Verbosity::Debug.level(Level::WARN), Level::DEBUG);
        assert_eq!(Verbosity::Trace.level(Level::INFO), Level::TRACE);
    }
}
