// Engine module
//
// The Engine ties the mount lifecycle, seeding, the scan loop and the
// shutdown sync together and owns the only mutable state of the process.

use crate::metrics::EngineMetrics;
use crate::models::{EngineConfig, MountState};
use crate::services::{
    CycleReport, MemoryOptions, MountController, MountOps, NixMounts, ScanLoop, SeedReport,
    ShutdownReport, TreeSeeder, scan, sync,
};
use anyhow::{Context, Result, bail};
use camino::Utf8Path;
use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::sync::watch;

/// Mode used when the active or archive directory has to be created.
pub const CREATED_DIR_MODE: u32 = 0o754;

/// Requests a cooperative stop of a running [`Engine`].
///
/// Cloneable and cheap; calling [`stop`](Self::stop) more than once is fine.
#[derive(Clone, Debug)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// The buffering engine.
///
/// Holds the immutable [`EngineConfig`], the [`MountController`] (and with
/// it the current [`MountState`]) and the stop flag. Dropping an engine that
/// has not been shut down runs the shutdown sync, so memory contents reach
/// the disk however the engine is left.
///
/// # Lifecycle
///
/// ```ignore
/// let mut engine = Engine::new(config);
/// let stop = engine.stop_handle();   // hand to the signal task
/// engine.run().await?;               // start, scan until stopped, shut down
/// ```
pub struct Engine {
    config: Arc<EngineConfig>,
    controller: MountController,
    metrics: Arc<EngineMetrics>,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
    scan_interval: Duration,
}

impl Engine {
    /// Create an engine using real kernel mounts.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_mounts(config, Box::new(NixMounts))
    }

    /// Create an engine with custom mount operations.
    pub fn with_mounts(config: EngineConfig, mounts: Box<dyn MountOps + Send>) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            config: Arc::new(config),
            controller: MountController::new(mounts),
            metrics: Arc::new(EngineMetrics::new()),
            stop_tx: Arc::new(stop_tx),
            stop_rx,
            scan_interval: scan::SCAN_INTERVAL,
        }
    }

    /// Override the pause between scan cycles.
    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn mount_state(&self) -> MountState {
        self.controller.state()
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    /// Bring the memory mount up: create missing directories, mount the
    /// memory filesystem, seed it and bind it over the active path.
    ///
    /// # Errors
    /// Every failure here is fatal, including a single entry that could not
    /// be seeded. Anything already mounted is released before the error is
    /// returned and the on-disk tree is left as it was.
    pub fn start(&mut self) -> Result<SeedReport> {
        if self.controller.state() != MountState::Unmounted {
            bail!("Engine cannot start while {}", self.controller.state());
        }

        let config = self.config.clone();
        let active = config.active_path.as_path();
        let archive = config.archive_path.as_path();
        ensure_directory(active)?;
        ensure_directory(archive)?;

        if !config.ignore.is_empty() {
            tracing::warn!(
                "Ignore filters match substrings anywhere in a name: folders {:?}, files {:?}",
                config.ignore.folders(),
                config.ignore.files()
            );
        }

        let options = MemoryOptions::matching(active, config.ram_budget_bytes)
            .with_context(|| format!("Failed to read attributes of {}", active))?;
        let memory = self
            .controller
            .mount(options)
            .context("Creation of memory mount failed")?
            .mount_point
            .clone();

        let report = match TreeSeeder::new().seed(active, archive, &memory) {
            Ok(report) => report,
            Err(e) => {
                self.abort_startup();
                return Err(e).with_context(|| format!("Failed to seed memory mount from {}", active));
            }
        };

        if let Err(e) = self.controller.bind(active) {
            self.abort_startup();
            return Err(e).context("Bind mount over the active path failed");
        }

        Ok(report)
    }

    /// Run one scan cycle. Only allowed while bind-mounted.
    pub fn run_cycle(&self) -> Result<CycleReport> {
        self.ensure_serving()?;
        Ok(self.scan_loop().run_cycle(&self.stop_rx))
    }

    /// Scan until the stop flag is set. Returns the number of cycles run.
    pub async fn serve(&self) -> Result<u64> {
        self.ensure_serving()?;
        let mut stop = self.stop_rx.clone();
        Ok(self.scan_loop().run(&mut stop).await)
    }

    /// Start, scan until stopped, then shut down.
    ///
    /// Shutdown runs whether scanning ended normally or with an error.
    pub async fn run(&mut self) -> Result<()> {
        self.start()?;
        tracing::info!("LogRunner is up, watching {}", self.config.active_path);

        let served = self.serve().await;
        self.shutdown();

        served.map(|cycles| tracing::debug!("Scan loop ran {} cycles", cycles))
    }

    /// Unbind, write memory contents back and release the memory mount.
    ///
    /// Safe to call any number of times; only the first call does anything.
    pub fn shutdown(&mut self) -> ShutdownReport {
        let report = sync::run(&mut self.controller);

        if report.released_memory {
            self.metrics.log_summary();
            if report.is_clean() {
                tracing::info!("LogRunner stopped successfully");
            } else {
                tracing::warn!("LogRunner stopped with {} errors", report.errors.len());
            }
        }

        report
    }

    fn abort_startup(&mut self) {
        let report = sync::run(&mut self.controller);
        for e in &report.errors {
            tracing::error!("Cleanup after failed startup: {}", e);
        }
    }

    fn ensure_serving(&self) -> Result<()> {
        let state = self.controller.state();
        if !state.is_serving() {
            bail!("Scan loop requires the bind mount, state is {}", state);
        }
        Ok(())
    }

    fn scan_loop(&self) -> ScanLoop {
        ScanLoop::new(self.config.clone(), self.metrics.clone()).with_interval(self.scan_interval)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.controller.state().is_torn_down() {
            self.shutdown();
        }
    }
}

fn ensure_directory(path: &Utf8Path) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    DirBuilder::new()
        .recursive(true)
        .mode(CREATED_DIR_MODE)
        .create(path)
        .with_context(|| format!("Failed to create directory: {}", path))?;
    tracing::info!("Created directory {}", path);
    Ok(())
}

/// SIGTERM and SIGINT listeners.
struct TerminationSignals {
    terminate: Signal,
    interrupt: Signal,
}

impl TerminationSignals {
    /// Must be called inside a tokio runtime context.
    fn register() -> io::Result<Self> {
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
        })
    }

    async fn recv(mut self) -> &'static str {
        tokio::select! {
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.interrupt.recv() => "SIGINT",
        }
    }
}

/// Blocking entry point for the process supervisor.
///
/// Builds the runtime, installs SIGTERM/SIGINT handling that requests a stop,
/// and runs the engine until it has shut down. A single worker thread
/// delivers signals while the engine itself runs on the calling thread, so a
/// stop is noticed between files even in the middle of a cycle.
pub fn run(config: EngineConfig) -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        tracing::warn!("Not running as root, mounting will most likely fail");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(1)
        .thread_name("logrunner-signals")
        .build()
        .context("Failed to build tokio runtime")?;

    let mut engine = Engine::new(config);
    let stop = engine.stop_handle();

    // Registered before anything is mounted, so the default disposition can
    // no longer kill the process with the memory mount in place.
    let signals = {
        let _guard = runtime.enter();
        TerminationSignals::register().context("Failed to install signal handlers")?
    };

    runtime.spawn(async move {
        let name = signals.recv().await;
        tracing::info!("Received {}, stopping", name);
        stop.stop();
    });

    let result = runtime.block_on(engine.run());
    drop(engine);

    runtime.shutdown_timeout(Duration::from_secs(5));
    result
}
