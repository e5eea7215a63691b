//! Data models for LogRunner.
//!
//! This module contains the core data structures shared by the engine:
//! - [`LogRunnerSettings`]: Raw settings as read from `/etc/logrunner.conf` (or YAML/TOML)
//! - [`EngineConfig`]: Validated, immutable settings handed to the engine
//! - [`IgnoreSet`]: Folder and file substrings excluded from eviction
//! - [`MountState`]: Lifecycle state of the memory mount
//!
//! # Architecture Note
//!
//! Settings are deserialized once at startup and validated into an
//! [`EngineConfig`]. Nothing in this module is mutated after the engine starts.

pub mod config;
pub mod mount_state;

pub use config::{EngineConfig, IgnoreSet, LogRunnerSettings, SettingsFile};
pub use mount_state::MountState;
