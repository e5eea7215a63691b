use anyhow::{Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

/// Top-level layout of the settings file.
///
/// The traditional configuration is an INI file with a single `[config]`
/// section; YAML and TOML files use the same shape with a `config` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub config: LogRunnerSettings,
}

/// Raw settings as written by the administrator.
///
/// Units follow the configuration file: `size` is in kilobytes and `ramsize`
/// in megabytes. Ignore lists are comma-separated substrings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRunnerSettings {
    /// Directory whose logs are held in memory
    #[serde(default = "default_path")]
    pub path: String,

    /// Root of the persistent archive store
    #[serde(default = "default_gzpath")]
    pub gzpath: String,

    /// Eviction threshold in KB
    #[serde(default = "default_size")]
    pub size: u64,

    /// Capacity of the memory mount in MB
    #[serde(default = "default_ramsize")]
    pub ramsize: u64,

    #[serde(default = "default_ignore_folders")]
    pub ignore_folders: String,

    #[serde(default)]
    pub ignore_files: String,
}

impl Default for LogRunnerSettings {
    fn default() -> Self {
        Self {
            path: default_path(),
            gzpath: default_gzpath(),
            size: default_size(),
            ramsize: default_ramsize(),
            ignore_folders: default_ignore_folders(),
            ignore_files: String::new(),
        }
    }
}

fn default_path() -> String {
    "/var/log".to_string()
}

fn default_gzpath() -> String {
    "/var/lib/logrunner/archive".to_string()
}

fn default_size() -> u64 {
    1024
}

fn default_ramsize() -> u64 {
    25
}

// journald keeps binary files open with mmap, truncating them corrupts the journal
fn default_ignore_folders() -> String {
    "journal".to_string()
}

/// Substring filters for folders and files that must never be evicted.
///
/// Matching is loose: a folder (by its path relative to the
/// active directory) or a file (by its name) is ignored when ANY configured
/// substring occurs anywhere inside it. `"log"` therefore ignores `syslog`,
/// `catalog.txt` and every folder below `blog/`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreSet {
    folders: IndexSet<String>,
    files: IndexSet<String>,
}

impl IgnoreSet {
    pub fn new<F, G, S, T>(folders: F, files: G) -> Self
    where
        F: IntoIterator<Item = S>,
        G: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            folders: clean(folders.into_iter().map(Into::into)),
            files: clean(files.into_iter().map(Into::into)),
        }
    }

    /// Build from the comma-separated lists used in the settings file.
    pub fn from_lists(folders: &str, files: &str) -> Self {
        Self::new(folders.split(','), files.split(','))
    }

    /// True when `relative_dir` contains any ignored-folder substring.
    pub fn is_ignored_folder(&self, relative_dir: &str) -> bool {
        self.folders.iter().any(|s| relative_dir.contains(s.as_str()))
    }

    /// True when `file_name` contains any ignored-file substring.
    pub fn is_ignored_file(&self, file_name: &str) -> bool {
        self.files.iter().any(|s| file_name.contains(s.as_str()))
    }

    pub fn folders(&self) -> &IndexSet<String> {
        &self.folders
    }

    pub fn files(&self) -> &IndexSet<String> {
        &self.files
    }

    pub fn is_empty(&self) -> bool {
        self.folders.is_empty() && self.files.is_empty()
    }
}

// An empty substring would match every path, so blanks are dropped.
fn clean(items: impl Iterator<Item = String>) -> IndexSet<String> {
    items
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Validated engine settings. Immutable for the lifetime of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Directory overlaid by the memory mount
    pub active_path: Utf8PathBuf,

    /// Root of the archive store on persistent storage
    pub archive_path: Utf8PathBuf,

    /// Files at or above this size are evicted
    pub size_threshold_bytes: u64,

    /// Capacity of the memory mount
    pub ram_budget_bytes: u64,

    pub ignore: IgnoreSet,
}

impl EngineConfig {
    /// Create a config with the default memory budget and no ignore filters.
    pub fn new<P, Q>(active_path: P, archive_path: Q, size_threshold_bytes: u64) -> Self
    where
        P: Into<Utf8PathBuf>,
        Q: Into<Utf8PathBuf>,
    {
        Self {
            active_path: active_path.into(),
            archive_path: archive_path.into(),
            size_threshold_bytes,
            ram_budget_bytes: default_ramsize() * 1024 * 1024,
            ignore: IgnoreSet::default(),
        }
    }

    pub fn with_ignore(mut self, ignore: IgnoreSet) -> Self {
        self.ignore = ignore;
        self
    }

    pub fn with_ram_budget_bytes(mut self, bytes: u64) -> Self {
        self.ram_budget_bytes = bytes;
        self
    }

    /// Validate raw settings and convert units.
    ///
    /// # Errors
    /// - relative paths
    /// - zero `size` or `ramsize`
    /// - an archive path inside the active path (archives would live in memory)
    pub fn from_settings(settings: &LogRunnerSettings) -> Result<Self> {
        let active_path = Utf8PathBuf::from(settings.path.trim());
        let archive_path = Utf8PathBuf::from(settings.gzpath.trim());

        for (key, path) in [("path", &active_path), ("gzpath", &archive_path)] {
            if !path.is_absolute() {
                bail!("Setting '{}' must be an absolute path, got '{}'", key, path);
            }
        }

        if settings.size == 0 {
            bail!("Setting 'size' must be greater than zero");
        }
        if settings.ramsize == 0 {
            bail!("Setting 'ramsize' must be greater than zero");
        }

        if is_within(&archive_path, &active_path) {
            bail!(
                "Archive path {} must not be inside the active path {}",
                archive_path,
                active_path
            );
        }

        Ok(Self {
            active_path,
            archive_path,
            size_threshold_bytes: settings.size.saturating_mul(1024),
            ram_budget_bytes: settings.ramsize.saturating_mul(1024 * 1024),
            ignore: IgnoreSet::from_lists(&settings.ignore_folders, &settings.ignore_files),
        })
    }
}

fn is_within(path: &Utf8Path, root: &Utf8Path) -> bool {
    path.starts_with(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let settings = LogRunnerSettings::default();
        assert_eq!(settings.path, "/var/log");
        assert_eq!(settings.size, 1024);
        assert_eq!(settings.ramsize, 25);
        assert_eq!(settings.ignore_folders, "journal");
    }

    #[test]
    fn test_from_settings_converts_units() {
        let settings = LogRunnerSettings {
            size: 4,
            ramsize: 2,
            ..Default::default()
        };
        let config = EngineConfig::from_settings(&settings).unwrap();

        assert_eq!(config.size_threshold_bytes, 4096);
        assert_eq!(config.ram_budget_bytes, 2 * 1024 * 1024);
        assert!(config.ignore.folders().contains("journal"));
    }

    #[test]
    fn test_from_settings_rejects_nested_archive() {
        let settings = LogRunnerSettings {
            path: "/var/log".to_string(),
            gzpath: "/var/log/archive".to_string(),
            ..Default::default()
        };
        assert!(EngineConfig::from_settings(&settings).is_err());
    }

    #[test]
    fn test_from_settings_allows_sibling_with_shared_prefix() {
        let settings = LogRunnerSettings {
            path: "/var/log".to_string(),
            gzpath: "/var/logarchive".to_string(),
            ..Default::default()
        };
        assert!(EngineConfig::from_settings(&settings).is_ok());
    }

    #[test]
    fn test_from_settings_rejects_relative_and_zero() {
        let relative = LogRunnerSettings {
            path: "logs".to_string(),
            ..Default::default()
        };
        assert!(EngineConfig::from_settings(&relative).is_err());

        let zero = LogRunnerSettings {
            size: 0,
            ..Default::default()
        };
        assert!(EngineConfig::from_settings(&zero).is_err());
    }

    #[test]
    fn test_ignore_set_parses_lists() {
        let ignore = IgnoreSet::from_lists(" journal , private,,", "wtmp,lastlog, ");
        assert_eq!(ignore.folders().len(), 2);
        assert_eq!(ignore.files().len(), 2);
        assert!(!ignore.is_empty());
    }

    #[test]
    fn test_ignore_set_substring_match() {
        let ignore = IgnoreSet::from_lists("cache", "tmp");

        assert!(ignore.is_ignored_folder("app/cache"));
        assert!(ignore.is_ignored_folder("precached"));
        assert!(!ignore.is_ignored_folder("app/logs"));

        assert!(ignore.is_ignored_file("wtmp"));
        assert!(ignore.is_ignored_file("tmp.log"));
        assert!(!ignore.is_ignored_file("syslog"));
    }

    #[test]
    fn test_empty_ignore_set_matches_nothing() {
        let ignore = IgnoreSet::from_lists("", "");
        assert!(ignore.is_empty());
        assert!(!ignore.is_ignored_folder("anything"));
        assert!(!ignore.is_ignored_file("anything"));
    }
}
