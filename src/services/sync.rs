use crate::services::mount::MountController;
use crate::services::tree;
use camino::Utf8Path;
use std::fs;

/// What the shutdown sync did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Top-level directories written back (each replaced its on-disk copy)
    pub directories: usize,
    /// Regular files written back
    pub files: u64,
    /// Failures, in the order they happened
    pub errors: Vec<String>,
    /// The mounts were already torn down and nothing was done
    pub already_torn_down: bool,
    /// A memory mount existed and its release was attempted
    pub released_memory: bool,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Unwind the mounts and write the memory contents back to disk.
///
/// Order: remove the bind over the active path, copy every memory entry
/// onto the now visible on-disk directory, then release the memory mount.
/// Every step is best effort; a second call is a no-op.
pub fn run(controller: &mut MountController) -> ShutdownReport {
    if controller.state().is_torn_down() {
        return ShutdownReport {
            already_torn_down: true,
            ..Default::default()
        };
    }

    let mut report = ShutdownReport {
        released_memory: controller.handle().is_some(),
        ..Default::default()
    };
    let mount_errors = controller.restore(|memory, active| copy_back(memory, active, &mut report));

    for e in mount_errors {
        tracing::error!("{}", e);
        report.errors.push(e.to_string());
    }

    if !report.released_memory {
        return report;
    }

    tracing::info!(
        "Shutdown sync finished: {} directories, {} files restored, {} errors",
        report.directories,
        report.files,
        report.errors.len()
    );

    report
}

/// Copy every top-level entry of `memory_root` onto `active_path`.
///
/// Directories replace a same-named directory at the destination; files
/// overwrite. Failures are recorded and the remaining entries still copied.
pub fn copy_back(memory_root: &Utf8Path, active_path: &Utf8Path, report: &mut ShutdownReport) {
    let entries = match fs::read_dir(memory_root) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::error!("Couldn't list memory mount {}: {}", memory_root, e);
            report.errors.push(format!("list {}: {}", memory_root, e));
            return;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                report.errors.push(format!("read {}: {}", memory_root, e));
                continue;
            }
        };

        let source = entry.path();
        let target = active_path.as_std_path().join(entry.file_name());

        let result = match entry.file_type() {
            Ok(file_type) if file_type.is_dir() => tree::replace_dir(&source, &target).map(|files| {
                report.directories += 1;
                report.files += files;
            }),
            Ok(_) => tree::copy_entry(&source, &target).map(|files| report.files += files),
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            tracing::error!("Couldn't restore {} to {}: {}", source.display(), target.display(), e);
            report
                .errors
                .push(format!("restore {}: {}", source.display(), e));
        }
    }
}
