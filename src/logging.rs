//! Logging setup shared by the pool server, the workers and the CLI.
//!
//! Workers inherit the server's stderr, so their lines are interleaved with
//! the pool's. The worker preset leaves out targets and is compact, which keeps
//! the combined stream readable.
//!
//! # Environment Variables
//!
//! - `COQPOOL_LOG` - Log filter (overrides RUST_LOG)
//! - `COQPOOL_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `COQPOOL_LOG_FORMAT` - Output format: pretty, compact, json
//! - `COQPOOL_LOG_FILE` - Path to log file (in addition to stderr)
//! - `COQPOOL_LOG_ROTATION` - Log file rotation: hourly, daily, never
//! - `COQPOOL_LOG_SPAN_EVENTS` - Log span timings on close (1/true)
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! # Example
//!
//! ```no_run
//! use coqpool::logging::{LogConfig, init};
//!
//! init(LogConfig::for_server().with_env_overrides());
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, MakeWriter, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable multi-field format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON lines, for log aggregation
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Rotation of the log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    /// Single file, never rotated
    Never,
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "never" => Ok(Self::Never),
            _ => Err(format!(
                "Unknown log rotation: '{}'. Valid options: hourly, daily, never",
                s
            )),
        }
    }
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Logging configuration.
///
/// Use the builder methods to customize, then pass to [`init`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: INFO)
    pub level: Level,
    pub format: LogFormat,
    /// Also log to this file (stderr is always written)
    pub file_path: Option<PathBuf>,
    pub rotation: LogRotation,
    /// Log span timing on close
    pub span_events: bool,
    /// Custom filter string (overrides level if set)
    pub filter: Option<String>,
    pub show_target: bool,
    pub show_thread_ids: bool,
    pub show_line_numbers: bool,
    /// ANSI colors on stderr. Files never get colors.
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            file_path: None,
            rotation: LogRotation::Daily,
            span_events: false,
            filter: None,
            show_target: true,
            show_thread_ids: false,
            show_line_numbers: false,
            ansi: true,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for `coqpool serve`: INFO, pretty, with thread IDs since every
    /// in-flight check runs on its own blocking thread.
    pub fn for_server() -> Self {
        Self {
            show_thread_ids: true,
            ..Self::default()
        }
    }

    /// Preset for `coqpool worker`: compact lines without targets.
    pub fn for_worker() -> Self {
        Self {
            format: LogFormat::Compact,
            show_target: false,
            ..Self::default()
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }

    /// Apply environment variable overrides.
    ///
    /// Reads from:
    /// - `COQPOOL_LOG` or `RUST_LOG` for filter (only if filter not already set)
    /// - `COQPOOL_LOG_LEVEL` for level (only if no filter is set)
    /// - `COQPOOL_LOG_FORMAT` for format
    /// - `COQPOOL_LOG_FILE` for file path (only if no file is set)
    /// - `COQPOOL_LOG_ROTATION` for file rotation
    /// - `COQPOOL_LOG_SPAN_EVENTS` to log span close events
    ///
    /// Settings made on `self` before this call win over the environment for
    /// the filter and the file. Apply CLI flags after it.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var("COQPOOL_LOG") {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }

        if self.filter.is_none()
            && let Ok(level_str) = std::env::var("COQPOOL_LOG_LEVEL")
        {
            self.level = parse_level(&level_str).unwrap_or(self.level);
        }

        if let Ok(format) = std::env::var("COQPOOL_LOG_FORMAT")
            && let Ok(f) = format.parse()
        {
            self.format = f;
        }

        if self.file_path.is_none()
            && let Ok(path) = std::env::var("COQPOOL_LOG_FILE")
        {
            self.file_path = Some(PathBuf::from(path));
        }

        if let Ok(rotation) = std::env::var("COQPOOL_LOG_ROTATION") {
            match rotation.parse() {
                Ok(r) => self.rotation = r,
                Err(e) => eprintln!("Warning: {}", e),
            }
        }

        if let Ok(value) = std::env::var("COQPOOL_LOG_SPAN_EVENTS") {
            self.span_events = matches!(value.to_lowercase().as_str(), "1" | "true" | "yes");
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        let default = || EnvFilter::new(self.level.to_string().to_lowercase());
        match self.filter {
            Some(ref filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                default()
            }),
            None => default(),
        }
    }

    /// One formatting layer for `writer`.
    fn fmt_layer<W>(&self, writer: W, ansi: bool) -> Box<dyn Layer<Registry> + Send + Sync>
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let span_events = if self.span_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let layer = fmt::layer()
            .with_span_events(span_events)
            .with_target(self.show_target)
            .with_ansi(ansi)
            .with_writer(writer);

        match self.format {
            LogFormat::Json => layer.json().boxed(),
            LogFormat::Compact => layer
                .compact()
                .with_thread_ids(self.show_thread_ids)
                .with_line_number(self.show_line_numbers)
                .boxed(),
            LogFormat::Pretty => layer
                .with_thread_ids(self.show_thread_ids)
                .with_line_number(self.show_line_numbers)
                .boxed(),
        }
    }
}

/// Parse a log level string.
fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

fn file_appender(path: &Path, rotation: LogRotation) -> Option<RollingFileAppender> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("coqpool.log");

    match RollingFileAppender::builder()
        .rotation(rotation.into())
        .filename_prefix(file_name)
        .build(parent)
    {
        Ok(appender) => Some(appender),
        Err(e) => {
            eprintln!("Warning: cannot log to {}: {}", path.display(), e);
            None
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// Logs to stderr, and additionally to `config.file_path` when set. Call once
/// at startup; later calls are ignored.
pub fn init(config: LogConfig) {
    let mut layers = vec![config.fmt_layer(std::io::stderr, config.ansi)];
    if let Some(appender) = config
        .file_path
        .as_deref()
        .and_then(|path| file_appender(path, config.rotation))
    {
        layers.push(config.fmt_layer(appender, false));
    }

    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(config.build_filter())
        .try_init();
}
