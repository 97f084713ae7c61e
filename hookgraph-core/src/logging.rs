//! Logging infrastructure for hookgraph
//!
//! Logs go to `~/.local/state/hookgraph/hookgraph.log.<date>` (XDG state dir).
//! The hook binary must stay silent on stdout/stderr, so the log file is the
//! only place failures surface.

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    filter::Directive,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

const LOG_FILE_PREFIX: &str = "hookgraph.log";

/// HTTP client internals stay quiet unless RUST_LOG asks for them
const QUIET_DEPENDENCIES: &[&str] = &["hyper=warn", "hyper_util=warn", "reqwest=warn", "rustls=warn"];

/// Install the file subscriber under the XDG state directory.
///
/// The level comes from `[logging] level` unless `RUST_LOG` is set.
/// Files rotate daily and only `max_files` are kept.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
    init_in(&Config::state_dir(), config)
}

/// As [`init`], writing into `log_dir`.
pub fn init_in(log_dir: &Path, config: &LoggingConfig) -> Result<LoggingGuard> {
    std::fs::create_dir_all(log_dir)?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(config.max_files.max(1))
        .build(log_dir)
        .map_err(|e| Error::Config(format!("failed to create log appender: {}", e)))?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    // Every hook invocation is a fresh process; a second init only happens
    // when a host embeds the library, and the first subscriber then wins.
    let _ = tracing_subscriber::registry()
        .with(build_filter(config))
        .with(file_layer)
        .try_init();

    tracing::debug!(
        log_dir = %log_dir.display(),
        level = %config.level,
        pid = std::process::id(),
        "Logging initialized"
    );

    Ok(LoggingGuard { _guard: guard })
}

fn build_filter(config: &LoggingConfig) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let mut filter = EnvFilter::new(&config.level);
    for raw in QUIET_DEPENDENCIES {
        if let Ok(directive) = raw.parse::<Directive>() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Initialize logging for tests (logs to stdout)
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

/// Flushes buffered log lines when dropped; hold it for the life of `main`.
pub struct LoggingGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

/// Returns the log file path (without the date suffix)
pub fn log_file_path() -> PathBuf {
    Config::log_path()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_path() {
        assert!(log_file_path().ends_with(LOG_FILE_PREFIX));
    }

    #[test]
    fn test_init_creates_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("state/hookgraph");
        let guard = init_in(&log_dir, &LoggingConfig::default()).unwrap();
        assert!(log_dir.is_dir());
        drop(guard);
    }
}
