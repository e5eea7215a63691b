use crate::metrics::EngineMetrics;
use crate::models::EngineConfig;
use crate::services::evict::{Evictor, RetireOutcome};
use camino::{Utf8Path, Utf8PathBuf};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use walkdir::{DirEntry, WalkDir};

/// Pause between two full walks of the active directory.
pub const SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// A regular file found during a walk. Recomputed every cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedFile {
    /// Path relative to the active directory
    pub relative: Utf8PathBuf,
    pub live_path: Utf8PathBuf,
    /// Size when the file was visited
    pub size: u64,
}

/// What one walk of the active directory did
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Files looked at (ignored files are never counted)
    pub examined: usize,
    pub retired: Vec<RetireOutcome>,
    pub failed: usize,
    /// The walk stopped early because shutdown was requested
    pub interrupted: bool,
}

/// Fixed-interval polling loop over the active directory.
///
/// Each cycle walks the whole tree, skips ignored folders and files, and
/// retires every file whose size is at or above the threshold. Nothing is
/// remembered between cycles: a file truncated by the previous cycle is
/// simply below the threshold on the next one.
pub struct ScanLoop {
    config: Arc<EngineConfig>,
    evictor: Evictor,
    interval: Duration,
    metrics: Arc<EngineMetrics>,
}

impl ScanLoop {
    pub fn new(config: Arc<EngineConfig>, metrics: Arc<EngineMetrics>) -> Self {
        let evictor = Evictor::new(&config.active_path, &config.archive_path);
        Self {
            config,
            evictor,
            interval: SCAN_INTERVAL,
            metrics,
        }
    }

    /// Override the pause between cycles.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Lazily walk the active directory, yielding every file that is not
    /// excluded by the ignore filters.
    ///
    /// The walk is restartable: each call starts a fresh traversal.
    pub fn tracked_files(&self) -> impl Iterator<Item = TrackedFile> + '_ {
        WalkDir::new(&self.config.active_path)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| !self.is_ignored_folder(entry))
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!("Skipping unreadable entry: {}", e);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| self.track(&entry))
    }

    /// Run one full walk, retiring oversized files.
    ///
    /// Failures are isolated to the file they happened on. The stop flag is
    /// checked before each file.
    pub fn run_cycle(&self, stop: &watch::Receiver<bool>) -> CycleReport {
        let mut report = CycleReport::default();

        for file in self.tracked_files() {
            if *stop.borrow() {
                report.interrupted = true;
                break;
            }

            report.examined += 1;
            if file.size < self.config.size_threshold_bytes {
                continue;
            }

            tracing::debug!(
                "{} is {} bytes (threshold {}), retiring",
                file.live_path,
                file.size,
                self.config.size_threshold_bytes
            );

            match self.evictor.retire(&file.relative) {
                Ok(outcome) => {
                    self.metrics.record_retired(&outcome);
                    report.retired.push(outcome);
                }
                Err(e) => {
                    tracing::error!("Couldn't back up {}, retrying next cycle: {}", file.live_path, e);
                    self.metrics.record_failure();
                    report.failed += 1;
                }
            }
        }

        self.metrics.record_cycle();
        report
    }

    /// Run cycles until the stop flag turns true.
    ///
    /// The sleep between cycles is the only await point and ends early when
    /// the flag changes. Returns the number of cycles run.
    pub async fn run(&self, stop: &mut watch::Receiver<bool>) -> u64 {
        let mut cycles = 0;

        loop {
            if *stop.borrow() {
                break;
            }

            let report = self.run_cycle(stop);
            cycles += 1;

            tracing::debug!(
                "Cycle {} done: {} examined, {} retired, {} failed",
                cycles,
                report.examined,
                report.retired.len(),
                report.failed
            );
            self.metrics.log_periodic();

            if report.interrupted {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        tracing::warn!("Stop handle dropped, leaving scan loop");
                        break;
                    }
                }
            }
        }

        cycles
    }

    fn is_ignored_folder(&self, entry: &DirEntry) -> bool {
        entry.file_type().is_dir()
            && self
                .relative_of(entry.path())
                .is_some_and(|relative| self.config.ignore.is_ignored_folder(relative.as_str()))
    }

    fn track(&self, entry: &DirEntry) -> Option<TrackedFile> {
        let Some(name) = entry.file_name().to_str() else {
            tracing::warn!("Skipping non UTF-8 file name {}", entry.path().display());
            return None;
        };

        if self.config.ignore.is_ignored_file(name) {
            tracing::trace!("Ignoring {}", entry.path().display());
            return None;
        }

        let relative = self.relative_of(entry.path())?;
        let size = match entry.metadata() {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                tracing::warn!("Couldn't stat {}: {}", entry.path().display(), e);
                return None;
            }
        };

        Some(TrackedFile {
            live_path: self.config.active_path.join(&relative),
            relative,
            size,
        })
    }

    fn relative_of(&self, path: &Path) -> Option<Utf8PathBuf> {
        let relative = path.strip_prefix(&self.config.active_path).ok()?;
        Utf8Path::from_path(relative).map(Utf8Path::to_path_buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IgnoreSet;
    use std::fs;
    use tempfile::TempDir;

    fn scan_loop(threshold: u64, ignore: IgnoreSet) -> (TempDir, ScanLoop) {
        let temp_dir = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
        let active = root.join("active");
        fs::create_dir_all(&active).unwrap();

        let config = EngineConfig::new(active, root.join("archive"), threshold).with_ignore(ignore);
        let scan = ScanLoop::new(Arc::new(config), Arc::new(EngineMetrics::new()));
        (temp_dir, scan)
    }

    fn active(scan: &ScanLoop) -> &Utf8Path {
        &scan.config.active_path
    }

    #[test]
    fn test_tracked_files_applies_ignore_filters() {
        let (_temp_dir, scan) = scan_loop(10, IgnoreSet::from_lists("private", "wtmp"));
        let root = active(&scan).to_path_buf();
        fs::create_dir_all(root.join("app/private/deep")).unwrap();
        fs::write(root.join("app/server.log"), b"a").unwrap();
        fs::write(root.join("app/private/secret.log"), b"b").unwrap();
        fs::write(root.join("app/private/deep/more.log"), b"c").unwrap();
        fs::write(root.join("wtmp"), b"d").unwrap();
        fs::write(root.join("syslog"), b"e").unwrap();

        let mut relative: Vec<_> = scan.tracked_files().map(|f| f.relative).collect();
        relative.sort();

        assert_eq!(relative, vec![Utf8PathBuf::from("app/server.log"), Utf8PathBuf::from("syslog")]);
    }

    #[test]
    fn test_tracked_files_reads_fresh_sizes() {
        let (_temp_dir, scan) = scan_loop(10, IgnoreSet::default());
        let file = active(&scan).join("app.log");
        fs::write(&file, b"12345").unwrap();
        assert_eq!(scan.tracked_files().next().unwrap().size, 5);

        fs::write(&file, b"1234567890").unwrap();
        assert_eq!(scan.tracked_files().next().unwrap().size, 10);
    }

    #[test]
    fn test_run_cycle_retires_at_threshold() {
        let (_temp_dir, scan) = scan_loop(10, IgnoreSet::default());
        let root = active(&scan).to_path_buf();
        fs::write(root.join("small.log"), b"123456789").unwrap();
        fs::write(root.join("exact.log"), b"1234567890").unwrap();

        let (_tx, rx) = watch::channel(false);
        let report = scan.run_cycle(&rx);

        assert_eq!(report.examined, 2);
        assert_eq!(report.retired.len(), 1);
        assert_eq!(report.retired[0].relative, "exact.log");
        assert_eq!(fs::metadata(root.join("exact.log")).unwrap().len(), 0);
        assert_eq!(fs::metadata(root.join("small.log")).unwrap().len(), 9);
    }

    #[test]
    fn test_run_cycle_stops_when_flag_set() {
        let (_temp_dir, scan) = scan_loop(1, IgnoreSet::default());
        fs::write(active(&scan).join("app.log"), b"data").unwrap();

        let (_tx, rx) = watch::channel(true);
        let report = scan.run_cycle(&rx);

        assert!(report.interrupted);
        assert!(report.retired.is_empty());
        assert_eq!(fs::metadata(active(&scan).join("app.log")).unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_run_exits_when_stopped_during_sleep() {
        let (_temp_dir, scan) = scan_loop(1, IgnoreSet::default());
        let (tx, mut rx) = watch::channel(false);

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send_replace(true);
            tx
        });

        let cycles = tokio::time::timeout(Duration::from_secs(5), scan.run(&mut rx))
            .await
            .expect("scan loop did not stop");

        assert_eq!(cycles, 1);
        drop(stopper.await.unwrap());
    }
}
