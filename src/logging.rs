use anyhow::{Context, Result};
use camino::Utf8Path;
use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Build the level filter.
///
/// `debug_mode` forces debug level; otherwise `RUST_LOG` is honoured and
/// falls back to info.
fn env_filter(debug_mode: bool) -> EnvFilter {
    if debug_mode {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Setup console logging only.
///
/// Under a service manager stdout ends up in the journal, so this is the
/// default for the daemon.
pub fn setup_console_logging(debug_mode: bool) -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(debug_mode))
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_target(false))
        .try_init()
        .context("Failed to initialize logging")?;

    tracing::debug!("Logging initialized: console, debug={}", debug_mode);
    Ok(())
}

/// Setup logging with a daily rotating file appender plus console output.
///
/// The log directory must not be inside the directory LogRunner buffers:
/// files opened before the bind mount would be written underneath it.
///
/// # Arguments
/// * `log_dir` - Directory for log files (e.g., "/var/lib/logrunner/logs")
/// * `log_prefix` - Prefix for log files (e.g., "logrunner")
/// * `debug_mode` - If true, use debug level; otherwise use info level
///
/// # Returns
/// A guard that must be held for the duration of the program to keep logging active
pub fn setup_logging_with_file(
    log_dir: &Utf8Path,
    log_prefix: &str,
    debug_mode: bool,
) -> Result<WorkerGuard> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create log directory: {}", log_dir))?;
    }

    let file_appender = rolling::daily(log_dir, log_prefix);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false) // No ANSI codes in log files
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_target(false);

    tracing_subscriber::registry()
        .with(env_filter(debug_mode))
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("Failed to initialize logging")?;

    tracing::info!(
        "Logging initialized: dir={}, prefix={}, debug={}",
        log_dir,
        log_prefix,
        debug_mode
    );

    Ok(guard)
}
