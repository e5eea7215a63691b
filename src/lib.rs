// LogRunner - RAM-backed log buffering with compressed rotation
//
// This is the library crate containing the engine, its services and data structures.
// The binary crate (main.rs) provides the daemon entry point.

pub mod config;
pub mod engine;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod services;

// Re-export commonly used types for convenience
pub use config::ConfigManager;
pub use engine::{Engine, StopHandle};
pub use metrics::EngineMetrics;
pub use models::{EngineConfig, IgnoreSet, LogRunnerSettings, MountState};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
