use crate::models::{EngineConfig, SettingsFile};
use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, Environment, File, FileFormat};
use std::fs;

/// Location of the settings file when none is given on the command line.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/logrunner.conf";

/// Prefix for environment overrides, e.g. `LOGRUNNER_CONFIG__SIZE=2048`.
pub const ENV_PREFIX: &str = "LOGRUNNER";

/// Configuration manager for loading the LogRunner settings file.
///
/// The file format is chosen by extension:
/// - `.yaml` / `.yml` → YAML
/// - `.toml` → TOML
/// - `.json` → JSON
/// - anything else (including the traditional `logrunner.conf`) → INI
///
/// Environment variables prefixed with [`ENV_PREFIX`] are layered on top of
/// the file.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_path: Utf8PathBuf,
}

impl ConfigManager {
    /// Create a ConfigManager for the given settings file.
    pub fn new<P: AsRef<Utf8Path>>(config_path: P) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
        }
    }

    /// Load the raw settings file merged with environment overrides.
    ///
    /// # Errors
    /// Fails when the file is missing or cannot be parsed.
    pub fn load_settings(&self) -> Result<SettingsFile> {
        if !self.config_path.exists() {
            bail!("Couldn't find the config file at {}", self.config_path);
        }

        let format = file_format(&self.config_path);
        let settings = Config::builder()
            .add_source(File::new(self.config_path.as_str(), format).required(true))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read config: {}", self.config_path))?;

        let file: SettingsFile = settings
            .try_deserialize()
            .with_context(|| format!("Failed to parse config: {}", self.config_path))?;

        tracing::info!("Loaded config from {} ({:?})", self.config_path, format);
        Ok(file)
    }

    /// Load and validate the settings into an [`EngineConfig`].
    pub fn load_engine_config(&self) -> Result<EngineConfig> {
        let file = self.load_settings()?;
        let config = EngineConfig::from_settings(&file.config)
            .with_context(|| format!("Invalid config: {}", self.config_path))?;

        tracing::info!(
            "Engine config - path: {}, gzpath: {}, threshold: {} bytes, ram budget: {} bytes",
            config.active_path,
            config.archive_path,
            config.size_threshold_bytes,
            config.ram_budget_bytes
        );
        Ok(config)
    }

    /// Write a default settings template as YAML.
    ///
    /// Only YAML destinations are supported so the written file reads back
    /// with the same format.
    pub fn write_default_config(&self) -> Result<()> {
        if !matches!(file_format(&self.config_path), FileFormat::Yaml) {
            bail!(
                "Default config can only be written as YAML (.yaml/.yml), got {}",
                self.config_path
            );
        }

        if let Some(parent) = self.config_path.parent() {
            if !parent.as_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {}", parent))?;
            }
        }

        let yaml_string = serde_yaml_ng::to_string(&SettingsFile::default())
            .context("Failed to serialize default config to YAML")?;

        fs::write(&self.config_path, yaml_string)
            .with_context(|| format!("Failed to write config: {}", self.config_path))?;

        tracing::info!("Saved default config to {}", self.config_path);
        Ok(())
    }

    /// Get the settings file path.
    pub fn config_path(&self) -> &Utf8Path {
        &self.config_path
    }
}

fn file_format(path: &Utf8Path) -> FileFormat {
    match path.extension().map(str::to_ascii_lowercase).as_deref() {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("toml") => FileFormat::Toml,
        Some("json") => FileFormat::Json,
        _ => FileFormat::Ini,
    }
}
