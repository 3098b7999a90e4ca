//! Logging for Tunnel Vision.
//!
//! Structured logging on top of the `tracing` crate, with optional file
//! output and JSON formatting. Components log with field syntax
//! (`info!(tunnel = %name, ...)`) so batch reports stay greppable.

use tracing::Level;
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log initialization options.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Log level (default: INFO)
    pub level: Level,

    /// Whether to log to stdout (default: true)
    pub log_to_stdout: bool,

    /// Whether to log to a file (default: false)
    pub log_to_file: bool,

    /// Directory to store log files (default: "./logs")
    pub log_dir: String,

    /// Base filename for log files (default: "tunnelvision")
    pub log_file_name: String,

    /// Whether to use JSON format for logs (default: false)
    pub json_format: bool,

    /// Whether to include file and line information (default: false)
    pub include_file_line: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        LogOptions {
            level: Level::INFO,
            log_to_stdout: true,
            log_to_file: false,
            log_dir: "./logs".to_string(),
            log_file_name: "tunnelvision".to_string(),
            json_format: false,
            include_file_line: false,
        }
    }
}

/// Initialize logging with the given options.
///
/// Returns a guard that must be kept alive for the duration of the program
/// to ensure file logs are flushed properly.
pub fn init_logging(options: LogOptions) -> Option<WorkerGuard> {
    // Bridge `log` crate records into `tracing` so dependency logs are captured
    let _ = LogTracer::init();

    let filter = EnvFilter::from_default_env().add_directive(options.level.into());

    let mut layers = Vec::new();
    let mut guard = None;

    if options.log_to_stdout {
        let stdout_layer = fmt::layer()
            .with_file(options.include_file_line)
            .with_line_number(options.include_file_line)
            .with_target(true);

        let stdout_layer = if options.json_format {
            stdout_layer.json().boxed()
        } else {
            stdout_layer.boxed()
        };

        layers.push(stdout_layer);
    }

    if options.log_to_file {
        let file_appender =
            RollingFileAppender::new(Rotation::DAILY, &options.log_dir, &options.log_file_name);

        let (non_blocking, worker_guard) = NonBlocking::new(file_appender);
        guard = Some(worker_guard);

        let file_layer = fmt::layer()
            .with_file(options.include_file_line)
            .with_line_number(options.include_file_line)
            .with_target(true)
            .with_writer(non_blocking);

        let file_layer = if options.json_format {
            file_layer.json().boxed()
        } else {
            file_layer.boxed()
        };

        layers.push(file_layer);
    }

    // Set the global subscriber (ignore if already set in this process)
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(layers)
        .try_init();

    guard
}

/// Initialize logging with default options.
pub fn init_default_logging() -> Option<WorkerGuard> {
    init_logging(LogOptions::default())
}

/// Parse a textual level from a settings file, defaulting to INFO.
pub fn level_from_str(level: &str) -> Level {
    match level {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}
