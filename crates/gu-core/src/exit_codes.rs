//! Exit codes for the gu-core CLI.
//!
//! Exit code ranges:
//! - 0-4: Operational outcomes (parse outcome from code, not output)
//! - 10-19: User/environment errors (recoverable by user action)
//! - 20-29: Internal errors

use gu_common::{Error, ErrorCategory};

/// Exit codes for gu-core operations.
///
/// These codes are a stable contract for supervisors and installers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    // Operational outcomes (0-4)
    /// Session succeeded, nothing pending, or restore completed.
    Clean = 0,
    /// Update session aborted; in-process rollback ran.
    Aborted = 1,
    /// The failure flag is raised; a restore must run first.
    RecoveryPending = 2,
    /// The supervised target exited abnormally; failure flag raised.
    TargetCrashed = 3,
    /// A restore attempt failed; the flag stays in-restore for a retry.
    RestoreFailed = 4,

    // User / environment errors (10-19)
    /// Invalid arguments.
    ArgsError = 10,
    /// Config file missing, unreadable, or invalid.
    ConfigError = 11,
    /// Permission denied.
    PermissionError = 12,
    /// Host platform has no strategy.
    PlatformError = 13,
    /// Lock contention (another session, watchdog, or restore holds it).
    LockError = 14,

    // Internal errors (20-29)
    /// Internal error (bug).
    InternalError = 20,
    /// I/O error.
    IoError = 21,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        matches!(self, ExitCode::Clean)
    }

    /// Codes 0-4 describe outcomes, not faults of the invocation.
    pub fn is_operational(self) -> bool {
        (0..=4).contains(&self.as_i32())
    }

    pub fn is_user_error(self) -> bool {
        (10..=19).contains(&self.as_i32())
    }

    pub fn is_internal_error(self) -> bool {
        (20..=29).contains(&self.as_i32())
    }

    pub fn code_name(&self) -> &'static str {
        match self {
            ExitCode::Clean => "OK_CLEAN",
            ExitCode::Aborted => "OK_ABORTED",
            ExitCode::RecoveryPending => "OK_RECOVERY_PENDING",
            ExitCode::TargetCrashed => "OK_TARGET_CRASHED",
            ExitCode::RestoreFailed => "ERR_RESTORE_FAILED",
            ExitCode::ArgsError => "ERR_ARGS",
            ExitCode::ConfigError => "ERR_CONFIG",
            ExitCode::PermissionError => "ERR_PERMISSION",
            ExitCode::PlatformError => "ERR_PLATFORM",
            ExitCode::LockError => "ERR_LOCK",
            ExitCode::InternalError => "ERR_INTERNAL",
            ExitCode::IoError => "ERR_IO",
        }
    }

    /// Map a library error onto the CLI contract.
    pub fn for_error(error: &Error) -> Self {
        match error {
            Error::UnsupportedPlatform(_) => ExitCode::PlatformError,
            Error::LockUnavailable(_) | Error::AlreadyMonitored { .. } => ExitCode::LockError,
            Error::RecoveryPending { .. } => ExitCode::RecoveryPending,
            Error::TargetCrash { .. } => ExitCode::TargetCrashed,
            Error::Undo(_) => ExitCode::RestoreFailed,
            Error::PermissionDenied { .. } => ExitCode::PermissionError,
            Error::Io(_) => ExitCode::IoError,
            Error::ProcessNotFound { .. } => ExitCode::ArgsError,
            other => match other.category() {
                ErrorCategory::Config => ExitCode::ConfigError,
                ErrorCategory::Io => ExitCode::IoError,
                _ => ExitCode::InternalError,
            },
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code.as_i32()
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code_name(), self.as_i32())
    }
}
