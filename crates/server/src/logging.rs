//! Structured logging to a daily file under the data directory.
//!
//! Filter and format come from the command line (or their `CHATBRIDGE_LOG_*`
//! env vars); `RUST_LOG` is honored when no filter is given.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,tower_http=warn,hyper=warn,reqwest=warn";
const LOG_FILE: &str = "background.log";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// One JSON object per line
    #[default]
    Json,
    /// Multi-line, human readable
    Pretty,
}

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub filter: Option<String>,
    pub format: LogFormat,
}

/// Flushes buffered lines when dropped; hold it for the life of the process.
pub struct LoggingGuard {
    _worker: WorkerGuard,
}

/// Filter directives: explicit, then `RUST_LOG`, then the built-in default.
/// Malformed directives are an error rather than silently ignored.
pub fn filter_for(explicit: Option<&str>, rust_log: Option<&str>) -> anyhow::Result<EnvFilter> {
    let directives = explicit
        .or(rust_log)
        .filter(|d| !d.trim().is_empty())
        .unwrap_or(DEFAULT_FILTER);
    EnvFilter::try_new(directives)
        .map_err(|e| anyhow::anyhow!("invalid log filter {directives:?}: {e}"))
}

pub fn init_logging(log_dir: &Path, options: &LogOptions) -> anyhow::Result<LoggingGuard> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = filter_for(options.filter.as_deref(), rust_log.as_deref())?;
    let directives = filter.to_string();

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE);
    let (writer, worker) = tracing_appender::non_blocking(file_appender);

    let registry = tracing_subscriber::registry().with(filter);
    match options.format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .pretty()
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true),
            )
            .try_init()?,
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .json()
                    .flatten_event(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true)
                    .with_current_span(true),
            )
            .try_init()?,
    }

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        log_dir = %log_dir.display(),
        log_file = LOG_FILE,
        format = ?options.format,
        filter = %directives,
    );

    Ok(LoggingGuard { _worker: worker })
}
