use crate::services::tree;
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while seeding the memory mount
///
/// Any of these aborts startup: a partial working copy must never be bound
/// over the active path, or shutdown would write it back over the complete
/// on-disk original.
#[derive(Error, Debug)]
pub enum SeedError {
    #[error("Failed to list {path}: {source}")]
    List { path: Utf8PathBuf, source: io::Error },

    #[error("Failed to migrate {}: {source}", path.display())]
    Entry { path: PathBuf, source: io::Error },
}

/// Result of migrating the active directory into the memory mount
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedReport {
    /// Top-level directories copied into memory
    pub directories: usize,
    /// Regular files copied into memory, including those inside directories
    pub files: u64,
    /// Pre-existing archives moved to the archive store
    pub archives_moved: usize,
}

/// Seeds the memory mount from the active directory before the bind mount
/// hides the original content.
///
/// Top-level directories are copied recursively, top-level files that are
/// already archives (`*.gz`, `*.gz.<n>`) are moved to the archive store, and
/// everything else is copied into memory.
pub struct TreeSeeder {
    /// Matches compressed archive names, including rotated generations
    archive_pattern: Regex,
}

impl TreeSeeder {
    pub fn new() -> Self {
        Self {
            archive_pattern: Regex::new(r"\.gz(\.\d+)?$").expect("Invalid archive regex"),
        }
    }

    /// Whether `file_name` is already a compressed archive.
    pub fn is_archive(&self, file_name: &str) -> bool {
        self.archive_pattern.is_match(file_name)
    }

    /// Migrate every top-level entry of `active_path`.
    ///
    /// An archive whose name is already taken in the archive store is moved
    /// under the next free `<name>.~N~` instead of replacing it.
    ///
    /// # Errors
    /// Stops at the first entry that cannot be migrated. Whatever was already
    /// copied into `memory_root` is incomplete and must be discarded.
    pub fn seed(
        &self,
        active_path: &Utf8Path,
        archive_path: &Utf8Path,
        memory_root: &Utf8Path,
    ) -> Result<SeedReport, SeedError> {
        let mut report = SeedReport::default();
        let list_error = |source| SeedError::List {
            path: active_path.to_path_buf(),
            source,
        };

        for entry in fs::read_dir(active_path).map_err(list_error)? {
            let entry = entry.map_err(list_error)?;
            let source = entry.path();
            let name = entry.file_name();

            let result = match entry.file_type() {
                Ok(file_type) if file_type.is_dir() => {
                    tree::copy_tree(&source, &memory_root.as_std_path().join(&name)).map(|files| {
                        report.directories += 1;
                        report.files += files;
                    })
                }
                Ok(file_type)
                    if file_type.is_file()
                        && name.to_str().is_some_and(|n| self.is_archive(n)) =>
                {
                    let target = free_archive_target(archive_path.as_std_path(), &name);
                    tree::move_file(&source, &target).map(|()| {
                        tracing::info!("Moved archive {} to {}", source.display(), target.display());
                        report.archives_moved += 1;
                    })
                }
                Ok(_) => tree::copy_entry(&source, &memory_root.as_std_path().join(&name))
                    .map(|files| report.files += files),
                Err(e) => Err(e),
            };

            result.map_err(|source_error| SeedError::Entry {
                path: source.clone(),
                source: source_error,
            })?;
        }

        tracing::info!(
            "Seeded memory mount from {}: {} directories, {} files, {} archives moved",
            active_path,
            report.directories,
            report.files,
            report.archives_moved
        );

        Ok(report)
    }
}

impl Default for TreeSeeder {
    fn default() -> Self {
        Self::new()
    }
}

// `name` itself when free, else the first unused `name.~N~`
fn free_archive_target(archive_dir: &Path, name: &OsStr) -> PathBuf {
    let target = archive_dir.join(name);
    if fs::symlink_metadata(&target).is_err() {
        return target;
    }

    let mut n = 1u32;
    loop {
        let mut candidate = name.to_os_string();
        candidate.push(format!(".~{}~", n));
        let candidate = archive_dir.join(candidate);
        if fs::symlink_metadata(&candidate).is_err() {
            tracing::warn!(
                "{} already exists, storing incoming archive as {}",
                target.display(),
                candidate.display()
            );
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    fn layout() -> (TempDir, Utf8PathBuf, Utf8PathBuf, Utf8PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
        let active = root.join("active");
        let archive = root.join("archive");
        let memory = root.join("memory");
        for dir in [&active, &archive, &memory] {
            fs::create_dir_all(dir).unwrap();
        }
        (temp_dir, active, archive, memory)
    }

    #[test]
    fn test_archive_pattern() {
        let seeder = TreeSeeder::new();

        assert!(seeder.is_archive("syslog.gz"));
        assert!(seeder.is_archive("syslog.1.gz"));
        assert!(seeder.is_archive("app.log.gz.3"));
        assert!(!seeder.is_archive("syslog"));
        assert!(!seeder.is_archive("syslog.1"));
        assert!(!seeder.is_archive("notes.gzip"));
        assert!(!seeder.is_archive("a.gz.bak"));
    }

    #[test]
    fn test_seed_classifies_entries() {
        let (_temp_dir, active, archive, memory) = layout();
        fs::write(active.join("syslog"), b"live").unwrap();
        fs::write(active.join("syslog.2.gz"), b"old").unwrap();
        fs::create_dir_all(active.join("nginx")).unwrap();
        fs::write(active.join("nginx/access.log"), b"GET /").unwrap();
        fs::write(active.join("nginx/access.log.1.gz"), b"older").unwrap();

        let report = TreeSeeder::new().seed(&active, &archive, &memory).unwrap();

        assert_eq!(report.directories, 1);
        assert_eq!(report.files, 3);
        assert_eq!(report.archives_moved, 1);

        // live files copied, originals untouched
        assert_eq!(fs::read(memory.join("syslog")).unwrap(), b"live");
        assert!(active.join("syslog").exists());

        // top-level archive moved, not duplicated
        assert_eq!(fs::read(archive.join("syslog.2.gz")).unwrap(), b"old");
        assert!(!active.join("syslog.2.gz").exists());
        assert!(!memory.join("syslog.2.gz").exists());

        // directories copied whole
        assert_eq!(fs::read(memory.join("nginx/access.log")).unwrap(), b"GET /");
        assert!(memory.join("nginx/access.log.1.gz").exists());
    }

    #[test]
    fn test_seed_missing_active_path_fails() {
        let (_temp_dir, active, archive, memory) = layout();
        let missing = active.join("nope");
        let err = TreeSeeder::new().seed(&missing, &archive, &memory).unwrap_err();
        assert!(matches!(err, SeedError::List { .. }));
    }

    #[test]
    fn test_seed_stops_on_entry_failure() {
        let (_temp_dir, active, archive, memory) = layout();
        fs::create_dir_all(active.join("nginx")).unwrap();
        fs::write(active.join("nginx/access.log"), b"GET /").unwrap();
        // a plain file where the directory copy has to go
        fs::write(memory.join("nginx"), b"in the way").unwrap();

        let err = TreeSeeder::new().seed(&active, &archive, &memory).unwrap_err();

        match err {
            SeedError::Entry { path, .. } => assert!(path.ends_with("nginx")),
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(fs::read(active.join("nginx/access.log")).unwrap(), b"GET /");
    }

    #[test]
    fn test_seed_keeps_existing_archive() {
        let (_temp_dir, active, archive, memory) = layout();
        fs::write(archive.join("syslog.gz"), b"generation zero").unwrap();
        fs::write(archive.join("syslog.gz.~1~"), b"earlier stray").unwrap();
        fs::write(active.join("syslog.gz"), b"stray").unwrap();

        let report = TreeSeeder::new().seed(&active, &archive, &memory).unwrap();

        assert_eq!(report.archives_moved, 1);
        assert_eq!(fs::read(archive.join("syslog.gz")).unwrap(), b"generation zero");
        assert_eq!(fs::read(archive.join("syslog.gz.~1~")).unwrap(), b"earlier stray");
        assert_eq!(fs::read(archive.join("syslog.gz.~2~")).unwrap(), b"stray");
        assert!(!active.join("syslog.gz").exists());
    }
}
