//! Configuration resolution and loading.
//!
//! Resolution order: CLI argument → environment variables → XDG path →
//! system path → built-in defaults.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::updater::UpdaterConfig;
use crate::validate::{ValidationError, ValidationResult};
use crate::{APP_DIR_NAME, CONFIG_FILENAME};

/// Where the configuration file was found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigSource {
    /// Explicitly provided via CLI argument.
    CliArgument,

    /// Set via environment variable.
    Environment,

    /// Found in XDG config directory.
    XdgConfig,

    /// Found in /etc/general_update/.
    SystemConfig,

    /// Using built-in defaults.
    #[default]
    BuiltinDefault,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::CliArgument => write!(f, "CLI argument"),
            ConfigSource::Environment => write!(f, "environment variable"),
            ConfigSource::XdgConfig => write!(f, "XDG config"),
            ConfigSource::SystemConfig => write!(f, "system config"),
            ConfigSource::BuiltinDefault => write!(f, "builtin default"),
        }
    }
}

/// Environment variable naming the config file directly.
pub const ENV_CONFIG_PATH: &str = "GU_CONFIG";
/// Environment variable naming a directory containing `updater.json`.
pub const ENV_CONFIG_DIR: &str = "GU_CONFIG_DIR";

/// A loaded configuration with provenance.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: UpdaterConfig,
    pub path: Option<PathBuf>,
    pub source: ConfigSource,
    /// SHA-256 of the file content (None for built-in defaults).
    pub hash: Option<String>,
}

/// Resolve the configuration file path.
///
/// An explicit CLI path is returned even if it does not exist, so loading
/// reports the missing file instead of silently falling back to defaults.
pub fn resolve_config_path(cli_path: Option<&Path>) -> (Option<PathBuf>, ConfigSource) {
    // 1. CLI argument
    if let Some(path) = cli_path {
        return (Some(path.to_path_buf()), ConfigSource::CliArgument);
    }

    // 2. Environment variable (direct path)
    if let Ok(env_path) = std::env::var(ENV_CONFIG_PATH) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return (Some(path), ConfigSource::Environment);
        }
    }

    // 3. Environment variable (config dir)
    if let Ok(config_dir) = std::env::var(ENV_CONFIG_DIR) {
        let path = PathBuf::from(config_dir).join(CONFIG_FILENAME);
        if path.exists() {
            return (Some(path), ConfigSource::Environment);
        }
    }

    // 4. XDG config directory
    if let Some(xdg_config) = dirs::config_dir() {
        let path = xdg_config.join(APP_DIR_NAME).join(CONFIG_FILENAME);
        if path.exists() {
            return (Some(path), ConfigSource::XdgConfig);
        }
    }

    // 5. System config
    let system_path = PathBuf::from("/etc").join(APP_DIR_NAME).join(CONFIG_FILENAME);
    if system_path.exists() {
        return (Some(system_path), ConfigSource::SystemConfig);
    }

    (None, ConfigSource::BuiltinDefault)
}

/// Resolve and load the configuration.
pub fn load_config(cli_path: Option<&Path>) -> ValidationResult<LoadedConfig> {
    let (path, source) = resolve_config_path(cli_path);
    let Some(path) = path else {
        return Ok(LoadedConfig {
            config: UpdaterConfig::default(),
            path: None,
            source,
            hash: None,
        });
    };
    let mut loaded = load_config_file(&path)?;
    loaded.source = source;
    Ok(loaded)
}

/// Load one configuration file.
pub fn load_config_file(path: &Path) -> ValidationResult<LoadedConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ValidationError::IoError(format!("{}: {}", path.display(), e)))?;
    let config = UpdaterConfig::from_json(&content)
        .map_err(|e| ValidationError::ParseError(format!("{}: {}", path.display(), e)))?;

    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());

    Ok(LoadedConfig {
        config,
        path: Some(path.to_path_buf()),
        source: ConfigSource::CliArgument,
        hash: Some(hex::encode(hasher.finalize())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cli_path_wins() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("custom.json");
        std::fs::write(&path, r#"{"app": {"name": "cli"}}"#).unwrap();

        let loaded = load_config(Some(&path)).unwrap();
        assert_eq!(loaded.source, ConfigSource::CliArgument);
        assert_eq!(loaded.config.app.name, "cli");
        assert_eq!(loaded.hash.as_ref().map(|h| h.len()), Some(64));
    }

    #[test]
    fn test_missing_cli_path_is_an_error() {
        let temp = TempDir::new().unwrap();
        let err = load_config(Some(&temp.path().join("absent.json"))).unwrap_err();
        assert_eq!(err.code(), 60);
    }

    #[test]
    fn test_parse_error_reports_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = load_config_file(&path).unwrap_err();
        assert_eq!(err.code(), 61);
        assert!(err.to_string().contains("broken.json"));
    }
}
