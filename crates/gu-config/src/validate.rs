//! Configuration validation errors and semantic validation.

use std::path::{Component, Path};
use thiserror::Error;

use crate::updater::{Readiness, SourceConfig, UpdaterConfig};

/// Validation result type.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Semantic validation failed: {0}")]
    SemanticError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },
}

impl ValidationError {
    /// Error code for structured error reporting.
    pub fn code(&self) -> u32 {
        match self {
            ValidationError::IoError(_) => 60,
            ValidationError::ParseError(_) => 61,
            ValidationError::SemanticError(_) => 63,
            ValidationError::MissingField(_) => 64,
            ValidationError::InvalidValue { .. } => 65,
            ValidationError::VersionMismatch { .. } => 66,
        }
    }
}

fn invalid(field: &str, message: impl Into<String>) -> ValidationError {
    ValidationError::InvalidValue {
        field: field.to_string(),
        message: message.into(),
    }
}

/// Validate an updater configuration semantically.
pub fn validate_config(config: &UpdaterConfig) -> ValidationResult<()> {
    if config.schema_version != crate::CONFIG_SCHEMA_VERSION {
        return Err(ValidationError::VersionMismatch {
            expected: crate::CONFIG_SCHEMA_VERSION.to_string(),
            actual: config.schema_version.clone(),
        });
    }

    if config.app.name.trim().is_empty() {
        return Err(ValidationError::MissingField("app.name".to_string()));
    }
    if config.app.main_executable.trim().is_empty() {
        return Err(ValidationError::MissingField(
            "app.main_executable".to_string(),
        ));
    }
    if !is_contained_relative(Path::new(&config.app.main_executable)) {
        return Err(invalid(
            "app.main_executable",
            "must be a relative path inside the install directory",
        ));
    }
    if config.paths.install_dir.as_os_str().is_empty() {
        return Err(ValidationError::MissingField(
            "paths.install_dir".to_string(),
        ));
    }

    if let SourceConfig::Http {
        metadata_url,
        timeout_secs,
    } = &config.source
    {
        if !(metadata_url.starts_with("http://") || metadata_url.starts_with("https://")) {
            return Err(invalid(
                "source.metadata_url",
                format!("must be an http(s) URL, got '{}'", metadata_url),
            ));
        }
        if *timeout_secs == 0 {
            return Err(invalid("source.timeout_secs", "must be > 0"));
        }
    }

    let fetch = &config.fetch;
    if fetch.workers == 0 || fetch.workers > 64 {
        return Err(invalid(
            "fetch.workers",
            format!("must be in [1, 64], got {}", fetch.workers),
        ));
    }
    if fetch.initial_backoff_ms > fetch.max_backoff_ms {
        return Err(ValidationError::SemanticError(format!(
            "fetch.initial_backoff_ms ({}) exceeds fetch.max_backoff_ms ({})",
            fetch.initial_backoff_ms, fetch.max_backoff_ms
        )));
    }

    let watchdog = &config.watchdog;
    if watchdog.poll_interval_ms == 0 {
        return Err(invalid("watchdog.poll_interval_ms", "must be > 0"));
    }
    if watchdog.startup_timeout_secs == 0 {
        return Err(invalid("watchdog.startup_timeout_secs", "must be > 0"));
    }
    if watchdog.expected_exit_codes.is_empty() {
        return Err(invalid(
            "watchdog.expected_exit_codes",
            "at least one exit code must count as normal",
        ));
    }
    if let Readiness::AliveFor { secs } = watchdog.readiness {
        if secs > watchdog.startup_timeout_secs {
            return Err(ValidationError::SemanticError(format!(
                "watchdog.readiness.secs ({}) exceeds watchdog.startup_timeout_secs ({})",
                secs, watchdog.startup_timeout_secs
            )));
        }
    }

    if config.recovery.poll_interval_secs == 0 {
        return Err(invalid("recovery.poll_interval_secs", "must be > 0"));
    }

    if !is_contained_relative(Path::new(&config.drivers.directory)) {
        return Err(invalid(
            "drivers.directory",
            "must be a relative path inside the package",
        ));
    }

    for dir in &config.files.skip_directories {
        if dir.trim().is_empty() || !is_contained_relative(Path::new(dir)) {
            return Err(invalid(
                "files.skip_directories",
                format!("'{}' must be a relative directory inside the install", dir),
            ));
        }
    }

    if config.server.bind.parse::<std::net::SocketAddr>().is_err() {
        return Err(invalid(
            "server.bind",
            format!("not a socket address: '{}'", config.server.bind),
        ));
    }

    Ok(())
}

/// True when `path` is relative and never climbs above its base.
fn is_contained_relative(path: &Path) -> bool {
    let mut depth: i32 = 0;
    for component in path.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}
