// Engine metrics module
//
// Lightweight counters for eviction activity, logged per cycle and on shutdown

use crate::services::RetireOutcome;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Eviction metrics
///
/// Uses atomic operations so the counters can be read from the signal task
/// or tests without locks. Logged after every cycle at debug level and as a
/// summary on shutdown.
#[derive(Debug)]
pub struct EngineMetrics {
    /// Completed scan cycles
    pub cycles: AtomicU64,

    /// Files successfully retired to the archive
    pub files_retired: AtomicU64,

    /// Retirement attempts that failed and will be retried
    pub retire_failures: AtomicU64,

    /// Uncompressed bytes written to archives
    pub bytes_archived: AtomicU64,

    /// Bytes the archives occupy on disk
    pub bytes_compressed: AtomicU64,

    /// Bytes appended during eviction and kept in live files
    pub bytes_carried_over: AtomicU64,

    /// Total time spent retiring files in milliseconds
    pub total_retire_time_ms: AtomicU64,

    /// Engine start time
    start_time: Instant,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            cycles: AtomicU64::new(0),
            files_retired: AtomicU64::new(0),
            retire_failures: AtomicU64::new(0),
            bytes_archived: AtomicU64::new(0),
            bytes_compressed: AtomicU64::new(0),
            bytes_carried_over: AtomicU64::new(0),
            total_retire_time_ms: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_cycle(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful retirement
    pub fn record_retired(&self, outcome: &RetireOutcome) {
        self.files_retired.fetch_add(1, Ordering::Relaxed);
        self.bytes_archived
            .fetch_add(outcome.bytes_archived, Ordering::Relaxed);
        self.bytes_compressed
            .fetch_add(outcome.compressed_bytes, Ordering::Relaxed);
        self.bytes_carried_over
            .fetch_add(outcome.carried_over, Ordering::Relaxed);
        self.total_retire_time_ms
            .fetch_add(outcome.duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.retire_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Compressed size as a fraction of the archived size (0.0 when nothing was archived)
    pub fn compression_ratio(&self) -> f64 {
        let archived = self.bytes_archived.load(Ordering::Relaxed);
        let compressed = self.bytes_compressed.load(Ordering::Relaxed);
        if archived > 0 {
            compressed as f64 / archived as f64
        } else {
            0.0
        }
    }

    /// Log metrics summary
    pub fn log_summary(&self) {
        tracing::info!("=== Eviction Metrics Summary ===");
        tracing::info!("Uptime: {:.2}s", self.uptime().as_secs_f64());
        tracing::info!(
            "Cycles: {}, files retired: {}, failures: {}",
            self.cycles.load(Ordering::Relaxed),
            self.files_retired.load(Ordering::Relaxed),
            self.retire_failures.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Archived {} bytes into {} bytes (ratio {:.3}), {} bytes carried over",
            self.bytes_archived.load(Ordering::Relaxed),
            self.bytes_compressed.load(Ordering::Relaxed),
            self.compression_ratio(),
            self.bytes_carried_over.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Total retire time: {:.2}s",
            self.total_retire_time_ms.load(Ordering::Relaxed) as f64 / 1000.0
        );
    }

    /// Log periodic metrics (after each cycle)
    pub fn log_periodic(&self) {
        tracing::debug!(
            "Metrics: {} cycles, {} retired, {} failed, uptime {:.0}s",
            self.cycles.load(Ordering::Relaxed),
            self.files_retired.load(Ordering::Relaxed),
            self.retire_failures.load(Ordering::Relaxed),
            self.uptime().as_secs_f64()
        );
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
