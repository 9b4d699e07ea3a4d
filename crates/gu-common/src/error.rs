//! Error types for General Update.
//!
//! Two layers:
//! - [`FailureClass`]: the failure taxonomy every update or restore error is
//!   classified into. It decides propagation (retry inside fetch, abort the
//!   session, roll back in-process, defer to the recovery agent).
//! - [`Error`]: the unified CLI-facing error with stable codes, category,
//!   recoverability hints, and suggested actions for agents.
//!
//! # Agent-Facing Output
//!
//! Errors serialize to structured JSON:
//! ```json
//! {
//!   "code": 31,
//!   "category": "pipeline",
//!   "failure_class": "corruption",
//!   "message": "digest mismatch for app-1.2.0.zip",
//!   "recoverable": false,
//!   "suggested_action": "abort"
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Result type alias for General Update operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy for the update/rollback subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Network or transfer blip while fetching. Retried with backoff inside Fetch only.
    TransientIo,
    /// Digest mismatch or unreadable package. Aborts before anything destructive.
    Corruption,
    /// The journal could not be persisted. Fatal to the session.
    JournalWriteFailure,
    /// A forward operation failed. Triggers in-process rollback.
    ApplyFailure,
    /// The relaunched target exited abnormally. Deferred to the recovery agent.
    TargetCrash,
    /// An undo step failed during restore. Leaves the flag in restore-pending.
    UndoFailure,
    /// Invalid configuration or unsupported host.
    Configuration,
    /// Cooperative cancellation was observed.
    Cancelled,
}

impl FailureClass {
    /// Only transient I/O is retried, and only inside the fetch stage.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureClass::TransientIo)
    }

    /// Whether this failure leaves durable state that needs a restore.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::TransientIo => "transient_io",
            FailureClass::Corruption => "corruption",
            FailureClass::JournalWriteFailure => "journal_write_failure",
            FailureClass::ApplyFailure => "apply_failure",
            FailureClass::TargetCrash => "target_crash",
            FailureClass::UndoFailure => "undo_failure",
            FailureClass::Configuration => "configuration",
            FailureClass::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error categories for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Configuration file and host errors.
    Config,
    /// Journal persistence errors.
    Journal,
    /// Fetch/verify/backup/apply/launch errors.
    Pipeline,
    /// Target supervision errors.
    Watchdog,
    /// Restore errors.
    Recovery,
    /// File I/O and serialization errors.
    Io,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Journal => write!(f, "journal"),
            ErrorCategory::Pipeline => write!(f, "pipeline"),
            ErrorCategory::Watchdog => write!(f, "watchdog"),
            ErrorCategory::Recovery => write!(f, "recovery"),
            ErrorCategory::Io => write!(f, "io"),
        }
    }
}

/// Suggested actions for agents to take in response to errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedAction {
    /// Retry the operation (possibly with backoff).
    Retry,
    /// Fix the configuration file.
    FixConfig,
    /// Run the recovery agent or a one-shot restore.
    RunRestore,
    /// Wait for a resource to become available.
    Wait,
    /// Request elevated privileges.
    Elevate,
    /// Abort the operation.
    Abort,
    /// Manual intervention required.
    ManualIntervention,
}

impl std::fmt::Display for SuggestedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SuggestedAction::Retry => write!(f, "retry"),
            SuggestedAction::FixConfig => write!(f, "fix_config"),
            SuggestedAction::RunRestore => write!(f, "run_restore"),
            SuggestedAction::Wait => write!(f, "wait"),
            SuggestedAction::Elevate => write!(f, "elevate"),
            SuggestedAction::Abort => write!(f, "abort"),
            SuggestedAction::ManualIntervention => write!(f, "manual_intervention"),
        }
    }
}

/// Unified error type for General Update.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (10-19)
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    // Journal errors (20-29)
    #[error("journal write failed: {0}")]
    JournalWrite(String),

    #[error("journal corrupted: {0}")]
    JournalCorrupted(String),

    // Pipeline errors (30-39)
    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("digest mismatch for {artifact}: expected {expected}, got {actual}")]
    DigestMismatch {
        artifact: String,
        expected: String,
        actual: String,
    },

    #[error("apply failed: {0}")]
    Apply(String),

    #[error("launch failed: {0}")]
    Launch(String),

    #[error("update cancelled")]
    Cancelled,

    // Watchdog errors (40-49)
    #[error("target {target} is already monitored")]
    AlreadyMonitored { target: String },

    #[error("target {target} crashed: {reason}")]
    TargetCrash { target: String, reason: String },

    #[error("process {pid} not found")]
    ProcessNotFound { pid: u32 },

    // Recovery errors (50-59)
    #[error("recovery pending for target {target}")]
    RecoveryPending { target: String },

    #[error("undo failed: {0}")]
    Undo(String),

    #[error("lock unavailable: {0}")]
    LockUnavailable(String),

    // I/O errors (60-69)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("permission denied: {path}")]
    PermissionDenied { path: String },
}

impl Error {
    /// Returns the error code for this error type.
    ///
    /// Error codes are stable and grouped by category:
    /// - 10-19: Configuration errors
    /// - 20-29: Journal errors
    /// - 30-39: Pipeline errors
    /// - 40-49: Watchdog errors
    /// - 50-59: Recovery errors
    /// - 60-69: I/O errors
    pub fn code(&self) -> u32 {
        match self {
            Error::Config(_) => 10,
            Error::InvalidConfig(_) => 11,
            Error::UnsupportedPlatform(_) => 12,
            Error::JournalWrite(_) => 20,
            Error::JournalCorrupted(_) => 21,
            Error::Fetch(_) => 30,
            Error::DigestMismatch { .. } => 31,
            Error::Apply(_) => 32,
            Error::Launch(_) => 33,
            Error::Cancelled => 34,
            Error::AlreadyMonitored { .. } => 40,
            Error::TargetCrash { .. } => 41,
            Error::ProcessNotFound { .. } => 42,
            Error::RecoveryPending { .. } => 50,
            Error::Undo(_) => 51,
            Error::LockUnavailable(_) => 52,
            Error::Io(_) => 60,
            Error::Json(_) => 61,
            Error::PermissionDenied { .. } => 62,
        }
    }

    /// Returns the error category for grouping and filtering.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) | Error::InvalidConfig(_) | Error::UnsupportedPlatform(_) => {
                ErrorCategory::Config
            }
            Error::JournalWrite(_) | Error::JournalCorrupted(_) => ErrorCategory::Journal,
            Error::Fetch(_)
            | Error::DigestMismatch { .. }
            | Error::Apply(_)
            | Error::Launch(_)
            | Error::Cancelled => ErrorCategory::Pipeline,
            Error::AlreadyMonitored { .. }
            | Error::TargetCrash { .. }
            | Error::ProcessNotFound { .. } => ErrorCategory::Watchdog,
            Error::RecoveryPending { .. } | Error::Undo(_) | Error::LockUnavailable(_) => {
                ErrorCategory::Recovery
            }
            Error::Io(_) | Error::Json(_) | Error::PermissionDenied { .. } => ErrorCategory::Io,
        }
    }

    /// Classify into the failure taxonomy, when the error belongs to it.
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self {
            Error::Config(_) | Error::InvalidConfig(_) | Error::UnsupportedPlatform(_) => {
                Some(FailureClass::Configuration)
            }
            Error::JournalWrite(_) => Some(FailureClass::JournalWriteFailure),
            Error::JournalCorrupted(_) => Some(FailureClass::Corruption),
            Error::Fetch(_) => Some(FailureClass::TransientIo),
            Error::DigestMismatch { .. } => Some(FailureClass::Corruption),
            Error::Apply(_) | Error::Launch(_) => Some(FailureClass::ApplyFailure),
            Error::Cancelled => Some(FailureClass::Cancelled),
            Error::TargetCrash { .. } => Some(FailureClass::TargetCrash),
            Error::Undo(_) => Some(FailureClass::UndoFailure),
            _ => None,
        }
    }

    /// Returns whether this error is potentially recoverable.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Config(_) | Error::InvalidConfig(_) => true,
            Error::UnsupportedPlatform(_) => false,

            Error::JournalWrite(_) => true, // Free disk space, fix permissions
            Error::JournalCorrupted(_) => false,

            Error::Fetch(_) => true,
            Error::DigestMismatch { .. } => false,
            Error::Apply(_) => true, // Rolled back in-process; retry the update
            Error::Launch(_) => true,
            Error::Cancelled => true,

            Error::AlreadyMonitored { .. } => false,
            Error::TargetCrash { .. } => true, // Recovery agent restores
            Error::ProcessNotFound { .. } => false,

            Error::RecoveryPending { .. } => true,
            Error::Undo(_) => true, // Undo is retry-safe
            Error::LockUnavailable(_) => true,

            Error::Io(_) => true,
            Error::Json(_) => false,
            Error::PermissionDenied { .. } => true,
        }
    }

    /// Returns the suggested action for agents.
    pub fn suggested_action(&self) -> SuggestedAction {
        match self {
            Error::Config(_) | Error::InvalidConfig(_) => SuggestedAction::FixConfig,
            Error::UnsupportedPlatform(_) => SuggestedAction::Abort,
            Error::JournalWrite(_) => SuggestedAction::ManualIntervention,
            Error::JournalCorrupted(_) => SuggestedAction::ManualIntervention,
            Error::Fetch(_) => SuggestedAction::Retry,
            Error::DigestMismatch { .. } => SuggestedAction::Abort,
            Error::Apply(_) | Error::Launch(_) | Error::Cancelled => SuggestedAction::Retry,
            Error::AlreadyMonitored { .. } => SuggestedAction::Wait,
            Error::TargetCrash { .. } => SuggestedAction::RunRestore,
            Error::ProcessNotFound { .. } => SuggestedAction::Abort,
            Error::RecoveryPending { .. } => SuggestedAction::RunRestore,
            Error::Undo(_) => SuggestedAction::RunRestore,
            Error::LockUnavailable(_) => SuggestedAction::Wait,
            Error::Io(_) => SuggestedAction::Retry,
            Error::Json(_) => SuggestedAction::ManualIntervention,
            Error::PermissionDenied { .. } => SuggestedAction::Elevate,
        }
    }

    /// Returns a human-readable remediation hint.
    pub fn remediation(&self) -> &'static str {
        match self {
            Error::Config(_) | Error::InvalidConfig(_) => {
                "Run 'gu-core config validate' and fix the reported fields in updater.json."
            }
            Error::UnsupportedPlatform(_) => {
                "This host is not a supported update target."
            }
            Error::JournalWrite(_) => {
                "Check disk space and permissions on the state directory. Nothing was modified."
            }
            Error::JournalCorrupted(_) => {
                "Inspect the journal with 'gu-core journal show'. Restore the state directory from backup if unreadable."
            }
            Error::Fetch(_) => "Check connectivity to the package source and retry.",
            Error::DigestMismatch { .. } => {
                "The downloaded package does not match its published digest. Nothing was modified."
            }
            Error::Apply(_) => {
                "The update was rolled back. Check write permissions on the install directory and retry."
            }
            Error::Launch(_) => {
                "The new version could not be started and was rolled back. Check the main executable setting."
            }
            Error::Cancelled => "The update was cancelled and rolled back.",
            Error::AlreadyMonitored { .. } => {
                "Another watchdog supervises this target. Wait for it to finish."
            }
            Error::TargetCrash { .. } => {
                "The recovery agent will restore the previous version. Run 'gu-core restore' to do it now."
            }
            Error::ProcessNotFound { .. } => "The process exited before supervision started.",
            Error::RecoveryPending { .. } => {
                "A previous update failed. Run 'gu-core restore' or wait for the recovery agent."
            }
            Error::Undo(_) => {
                "Restore is pending retry. Fix the reported path and run 'gu-core restore' again."
            }
            Error::LockUnavailable(_) => "Another updater process holds the lock. Retry later.",
            Error::Io(_) => "Check disk space and permissions, then retry.",
            Error::Json(_) => "A state or config file contains invalid JSON.",
            Error::PermissionDenied { .. } => "Run with privileges that can write the target path.",
        }
    }

    /// Returns a short headline for human-readable output.
    pub fn headline(&self) -> &'static str {
        match self {
            Error::Config(_) => "Configuration Error",
            Error::InvalidConfig(_) => "Invalid Configuration",
            Error::UnsupportedPlatform(_) => "Unsupported Platform",
            Error::JournalWrite(_) => "Journal Write Failed",
            Error::JournalCorrupted(_) => "Journal Corrupted",
            Error::Fetch(_) => "Fetch Failed",
            Error::DigestMismatch { .. } => "Package Corrupted",
            Error::Apply(_) => "Apply Failed",
            Error::Launch(_) => "Launch Failed",
            Error::Cancelled => "Update Cancelled",
            Error::AlreadyMonitored { .. } => "Already Monitored",
            Error::TargetCrash { .. } => "Target Crashed",
            Error::ProcessNotFound { .. } => "Process Not Found",
            Error::RecoveryPending { .. } => "Recovery Pending",
            Error::Undo(_) => "Restore Failed",
            Error::LockUnavailable(_) => "Lock Unavailable",
            Error::Io(_) => "I/O Error",
            Error::Json(_) => "JSON Parse Error",
            Error::PermissionDenied { .. } => "Permission Denied",
        }
    }

    /// Format for human-facing output (headline, reason, fix).
    pub fn to_human(&self) -> String {
        format!(
            "✗ {}\n  Reason: {}\n  Fix: {}",
            self.headline(),
            self,
            self.remediation()
        )
    }
}

/// Structured error response for JSON output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredError {
    /// Stable error code.
    pub code: u32,

    /// Error category for grouping.
    pub category: ErrorCategory,

    /// Failure taxonomy class, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_class: Option<FailureClass>,

    /// Human-readable error message.
    pub message: String,

    /// Whether the error is potentially recoverable.
    pub recoverable: bool,

    /// Suggested action for agents.
    pub suggested_action: SuggestedAction,

    /// Additional structured context (e.g., pid, path).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

impl From<&Error> for StructuredError {
    fn from(err: &Error) -> Self {
        let mut context = HashMap::new();

        match err {
            Error::ProcessNotFound { pid } => {
                context.insert("pid".to_string(), serde_json::json!(pid));
            }
            Error::AlreadyMonitored { target }
            | Error::TargetCrash { target, .. }
            | Error::RecoveryPending { target } => {
                context.insert("target".to_string(), serde_json::json!(target));
            }
            Error::DigestMismatch {
                artifact,
                expected,
                actual,
            } => {
                context.insert("artifact".to_string(), serde_json::json!(artifact));
                context.insert("expected".to_string(), serde_json::json!(expected));
                context.insert("actual".to_string(), serde_json::json!(actual));
            }
            Error::PermissionDenied { path } => {
                context.insert("path".to_string(), serde_json::json!(path));
            }
            _ => {}
        }

        StructuredError {
            code: err.code(),
            category: err.category(),
            failure_class: err.failure_class(),
            message: err.to_string(),
            recoverable: err.is_recoverable(),
            suggested_action: err.suggested_action(),
            context,
        }
    }
}

impl StructuredError {
    /// Add additional context to the error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"code":{},"error":"serialization_failed"}}"#, self.code)
        })
    }
}
