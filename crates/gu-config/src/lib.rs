//! General Update configuration loading and validation.
//!
//! This crate provides:
//! - Typed Rust structs for `updater.json`
//! - Config resolution (CLI → env → XDG → system → defaults)
//! - Semantic validation with stable error codes
//! - Config snapshots recorded alongside diagnostics

pub mod resolve;
pub mod snapshot;
pub mod updater;
pub mod validate;

pub use resolve::{load_config, resolve_config_path, ConfigSource, LoadedConfig};
pub use snapshot::ConfigSnapshot;
pub use updater::{
    AppConfig, DriverConfig, FetchConfig, FilterConfig, PathsConfig, Readiness, RecoveryConfig,
    ServerConfig, SourceConfig, UpdaterConfig, WatchdogConfig,
};
pub use validate::{validate_config, ValidationError, ValidationResult};

/// Schema version for configuration files.
pub const CONFIG_SCHEMA_VERSION: &str = "1.0.0";

/// Standard config file name.
pub const CONFIG_FILENAME: &str = "updater.json";

/// Application directory name used under XDG/data/cache roots.
pub const APP_DIR_NAME: &str = "general_update";
