//! Tracing setup for the binary.
//!
//! Events always go to a daily-rotating file under the log directory
//! (`<prefix>.YYYY-MM-DD`); a console layer can be stacked on top. The level
//! is `debug` or `info` unless `RUST_LOG` is set.

use anyhow::{Context, Result};
use camino::Utf8Path;
use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn level_filter(debug_mode: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug_mode { "debug" } else { "info" }))
}

// Shared by both entry points; fails if a global subscriber is already set.
fn install(
    log_dir: &Utf8Path,
    log_prefix: &str,
    debug_mode: bool,
    console_output: bool,
) -> Result<WorkerGuard> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir))?;

    let (writer, guard) = tracing_appender::non_blocking(rolling::daily(log_dir, log_prefix));

    let file = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);
    let console = console_output.then(|| fmt::layer().with_target(false));

    tracing_subscriber::registry()
        .with(level_filter(debug_mode))
        .with(file)
        .with(console)
        .try_init()
        .context("A tracing subscriber is already installed")?;

    tracing::info!(
        "Logging to {}/{}.* (debug={}, console={})",
        log_dir,
        log_prefix,
        debug_mode,
        console_output
    );
    Ok(guard)
}

/// File-only logging. Hold the returned guard until exit or buffered events
/// are lost.
pub fn setup_logging(
    log_dir: &Utf8Path,
    log_prefix: &str,
    debug_mode: bool,
) -> Result<WorkerGuard> {
    install(log_dir, log_prefix, debug_mode, false)
}

/// File logging plus, when `console_output` is set, a colored stderr layer.
pub fn setup_logging_with_console(
    log_dir: &Utf8Path,
    log_prefix: &str,
    debug_mode: bool,
    console_output: bool,
) -> Result<WorkerGuard> {
    install(log_dir, log_prefix, debug_mode, console_output)
}
