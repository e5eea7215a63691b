//! LogRunner - keeps a log directory in memory and rotates it to disk
//!
//! Main entry point for the daemon.
//!
//! # Overview
//!
//! The binary wires the library together:
//! - Logging infrastructure (console, plus daily rotated files with `--log-dir`)
//! - Configuration loading ([`ConfigManager`])
//! - The engine ([`logrunner::engine::run`]), which owns the tokio runtime and
//!   SIGTERM/SIGINT handling
//!
//! # Execution Flow
//!
//! 1. Parse the command line
//! 2. Initialize logging
//! 3. Load and validate `/etc/logrunner.conf` (or `--config`)
//! 4. Mount, seed, bind, then scan every 60 seconds until a signal arrives
//! 5. Unbind, copy the memory contents back and release the memory mount
//!
//! Requires root (or `CAP_SYS_ADMIN`) for the mounts. Meant to be started by
//! a service manager, see `dist/logrunner.service`.

use anyhow::Result;
use camino::Utf8PathBuf;
use clap::Parser;
use logrunner::config::DEFAULT_CONFIG_PATH;
use logrunner::{APP_NAME, ConfigManager, VERSION};
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "logrunner", version, about = "Buffer a log directory in memory and rotate it to disk")]
struct Cli {
    /// Settings file (INI by default, YAML/TOML/JSON by extension)
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: Utf8PathBuf,

    /// Log at debug level
    #[arg(short, long)]
    debug: bool,

    /// Also write daily rotated log files into this directory
    #[arg(long, value_name = "DIR")]
    log_dir: Option<Utf8PathBuf>,

    /// Write a YAML settings template to PATH and exit
    #[arg(long, value_name = "PATH")]
    write_default_config: Option<Utf8PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Held until main returns so buffered file output is flushed
    let _guard = match init_logging(&cli) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{:#}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(cli: &Cli) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    match &cli.log_dir {
        Some(dir) => logrunner::logging::setup_logging_with_file(dir, APP_NAME, cli.debug).map(Some),
        None => logrunner::logging::setup_console_logging(cli.debug).map(|()| None),
    }
}

fn run(cli: Cli) -> Result<()> {
    if let Some(path) = cli.write_default_config {
        return ConfigManager::new(&path).write_default_config();
    }

    tracing::info!("Starting {} v{}", APP_NAME, VERSION);

    let config = ConfigManager::new(&cli.config).load_engine_config()?;
    logrunner::engine::run(config)
}
