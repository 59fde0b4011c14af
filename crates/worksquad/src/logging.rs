//! Tracing setup.
//!
//! Agents and dev servers own the operator's terminal while attached, so the
//! full log goes to a daily-rolling file under `<data_dir>/logs`. Only
//! warnings and errors are echoed to stderr.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Prefix of the rolling log files.
pub const LOG_FILE_PREFIX: &str = "worksquad.log";

/// Builds the file filter: `RUST_LOG` wins, then `debug` when verbose, then
/// the configured level.
pub fn env_filter(log_level: &str, verbose: bool) -> EnvFilter {
    let level = if verbose { "debug" } else { log_level };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Installs the global subscriber. Dropping the returned guard flushes the
/// file writer, so keep it alive for the life of the process.
pub fn init(log_dir: &Path, log_level: &str, verbose: bool) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;

    let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(env_filter(log_level, verbose));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(LevelFilter::WARN);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
