//! Configuration snapshots.
//!
//! A snapshot captures the configuration a session ran with; it is printed
//! by `config show` and stored inside crash diagnostics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resolve::LoadedConfig;

/// A frozen snapshot of configuration state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    /// When this snapshot was taken.
    pub timestamp: DateTime<Utc>,

    /// Schema version of the configuration.
    pub schema_version: String,

    /// Path the configuration was loaded from.
    #[serde(default)]
    pub config_path: Option<String>,

    /// Where the configuration was found.
    pub config_source: String,

    /// SHA-256 of the configuration file content.
    #[serde(default)]
    pub config_hash: Option<String>,

    /// Key configuration values for quick reference.
    pub summary: ConfigSummary,
}

/// Summary of key configuration values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSummary {
    pub app_name: String,
    pub current_version: String,
    pub install_dir: String,
    pub state_dir: String,
    pub source_kind: String,
    pub fetch_workers: usize,
    pub watchdog_enabled: bool,
    pub drivers_enabled: bool,
}

impl ConfigSnapshot {
    /// Snapshot a loaded configuration.
    pub fn from_loaded(loaded: &LoadedConfig) -> Self {
        let cfg = &loaded.config;
        Self {
            timestamp: Utc::now(),
            schema_version: cfg.schema_version.clone(),
            config_path: loaded.path.as_ref().map(|p| p.display().to_string()),
            config_source: loaded.source.to_string(),
            config_hash: loaded.hash.clone(),
            summary: ConfigSummary {
                app_name: cfg.app.name.clone(),
                current_version: cfg.app.current_version.clone(),
                install_dir: cfg.paths.install_dir.display().to_string(),
                state_dir: cfg.state_dir().display().to_string(),
                source_kind: cfg.source.kind().to_string(),
                fetch_workers: cfg.fetch.workers,
                watchdog_enabled: cfg.watchdog.enabled,
                drivers_enabled: cfg.drivers.enabled,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::ConfigSource;
    use crate::UpdaterConfig;

    #[test]
    fn test_snapshot_of_defaults() {
        let loaded = LoadedConfig {
            config: UpdaterConfig::default(),
            path: None,
            source: ConfigSource::BuiltinDefault,
            hash: None,
        };
        let snap = ConfigSnapshot::from_loaded(&loaded);
        assert_eq!(snap.config_source, "builtin default");
        assert_eq!(snap.summary.source_kind, "directory");
        assert!(snap.config_hash.is_none());

        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains(r#""fetch_workers":4"#));
    }
}
