//! Typed `updater.json` configuration.
//!
//! Every section carries serde defaults so a partial file is valid input;
//! semantic checks live in [`crate::validate`].

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

use crate::{APP_DIR_NAME, CONFIG_SCHEMA_VERSION};

/// Root configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    pub schema_version: String,
    pub app: AppConfig,
    pub paths: PathsConfig,
    pub source: SourceConfig,
    pub fetch: FetchConfig,
    pub watchdog: WatchdogConfig,
    pub recovery: RecoveryConfig,
    pub drivers: DriverConfig,
    pub files: FilterConfig,
    pub server: ServerConfig,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION.to_string(),
            app: AppConfig::default(),
            paths: PathsConfig::default(),
            source: SourceConfig::default(),
            fetch: FetchConfig::default(),
            watchdog: WatchdogConfig::default(),
            recovery: RecoveryConfig::default(),
            drivers: DriverConfig::default(),
            files: FilterConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl UpdaterConfig {
    /// Parse from JSON text.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Directory holding journals, flags and failure records.
    pub fn state_dir(&self) -> PathBuf {
        self.paths
            .state_dir
            .clone()
            .unwrap_or_else(|| data_root().join("state"))
    }

    /// Directory packages are downloaded and unpacked into.
    pub fn staging_dir(&self) -> PathBuf {
        self.paths.staging_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from(".").join(".cache"))
                .join(APP_DIR_NAME)
                .join("staging")
        })
    }

    /// Directory pre-update copies of replaced files are kept in.
    pub fn backup_dir(&self) -> PathBuf {
        self.paths
            .backup_dir
            .clone()
            .unwrap_or_else(|| data_root().join("backup"))
    }

    /// Directory crash diagnostics are written to.
    pub fn diagnostics_dir(&self) -> PathBuf {
        self.paths
            .diagnostics_dir
            .clone()
            .unwrap_or_else(|| data_root().join("diagnostics"))
    }

    /// Absolute path of the main executable.
    pub fn main_executable_path(&self) -> PathBuf {
        self.paths.install_dir.join(&self.app.main_executable)
    }
}

fn data_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(".").join(".local"))
        .join(APP_DIR_NAME)
}

/// The application being updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Display name; also the base of the target identity.
    pub name: String,
    /// Main executable, relative to `paths.install_dir`.
    pub main_executable: String,
    /// Arguments passed on relaunch.
    pub launch_args: Vec<String>,
    /// Version currently installed.
    pub current_version: String,
    /// Optional script run before the relaunch (e.g. to fix permissions).
    pub launch_script: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "app".to_string(),
            main_executable: String::new(),
            launch_args: Vec::new(),
            current_version: "0.0.0".to_string(),
            launch_script: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub install_dir: PathBuf,
    pub state_dir: Option<PathBuf>,
    pub staging_dir: Option<PathBuf>,
    pub backup_dir: Option<PathBuf>,
    pub diagnostics_dir: Option<PathBuf>,
}

/// Where version metadata and packages come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Local or mounted directory containing `versions.json` and packages.
    Directory { path: PathBuf },
    /// HTTP endpoint returning the same `versions.json` document.
    Http {
        metadata_url: String,
        #[serde(default = "default_http_timeout_secs")]
        timeout_secs: u64,
    },
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Directory {
            path: PathBuf::from("updates"),
        }
    }
}

impl SourceConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceConfig::Directory { .. } => "directory",
            SourceConfig::Http { .. } => "http",
        }
    }
}

fn default_http_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Bounded worker pool size for parallel package downloads.
    pub workers: usize,
    /// Retries for transient I/O, per package.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

/// When a relaunched target counts as started successfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Readiness {
    /// The target stays alive for this long.
    AliveFor { secs: u64 },
    /// The target creates this file (relative paths resolve against the install dir).
    MarkerFile { path: PathBuf },
}

impl Default for Readiness {
    fn default() -> Self {
        Readiness::AliveFor { secs: 5 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Supervise the target after launch.
    pub enabled: bool,
    pub poll_interval_ms: u64,
    /// The target must become ready within this window.
    pub startup_timeout_secs: u64,
    pub readiness: Readiness,
    /// Exit codes treated as a normal exit.
    pub expected_exit_codes: Vec<i32>,
    /// In PID-only mode the exit status is unknown; treat such exits as failures.
    pub unknown_exit_is_failure: bool,
    /// Bytes of captured stdout/stderr kept for diagnostics.
    pub capture_output_bytes: usize,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 500,
            startup_timeout_secs: 30,
            readiness: Readiness::default(),
            expected_exit_codes: vec![0],
            unknown_exit_is_failure: false,
            capture_output_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Flag poll interval of the recovery agent.
    pub poll_interval_secs: u64,
    /// Archived journals of confirmed sessions to keep per target.
    pub journal_retention: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            journal_retention: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Install drivers shipped in packages.
    pub enabled: bool,
    /// Package-relative directory holding driver files.
    pub directory: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: "drivers".to_string(),
        }
    }
}

/// Package entries an update never installs, removes or backs up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Exact file names, matched at any depth.
    pub blacklist_files: Vec<String>,
    /// Extensions with their leading dot, matched case-insensitively.
    pub blacklist_formats: Vec<String>,
    /// Top-level directories of the install left alone.
    pub skip_directories: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            blacklist_files: Vec::new(),
            blacklist_formats: [".patch", ".7z", ".zip", ".rar", ".tar", ".json"]
                .iter()
                .map(|f| f.to_string())
                .collect(),
            skip_directories: Vec::new(),
        }
    }
}

impl FilterConfig {
    /// Whether the install-relative path `rel` is filtered out.
    pub fn is_excluded(&self, rel: &Path) -> bool {
        let name = rel.file_name().and_then(|n| n.to_str());
        if name.is_some_and(|n| self.blacklist_files.iter().any(|b| b == n)) {
            return true;
        }
        let ext = rel.extension().and_then(|e| e.to_str());
        if ext.is_some_and(|e| {
            self.blacklist_formats
                .iter()
                .any(|f| f.strip_prefix('.').unwrap_or(f).eq_ignore_ascii_case(e))
        }) {
            return true;
        }
        match rel.components().next() {
            Some(Component::Normal(top)) if rel.components().count() > 1 => self
                .skip_directories
                .iter()
                .any(|d| Path::new(d.trim_end_matches('/')) == Path::new(top)),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address of the restore endpoint.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:9217".to_string(),
        }
    }
}
