//! Stable event names and correlation context for structured logs.
//!
//! Every log line emitted by the pipeline, watchdog, and recovery agent
//! carries an event name from [`event_names`] as its tracing target, plus
//! the correlation fields held in [`LogContext`].

use serde::{Deserialize, Serialize};

/// Subsystem stage an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Startup and configuration.
    Init,
    Fetch,
    Verify,
    Backup,
    Apply,
    Launch,
    /// In-process LIFO rollback after a pipeline failure.
    Rollback,
    /// Watchdog supervision of the relaunched target.
    Watch,
    /// Recovery agent restore cycles.
    Recover,
    /// Restore endpoint.
    Serve,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Init => "init",
            Stage::Fetch => "fetch",
            Stage::Verify => "verify",
            Stage::Backup => "backup",
            Stage::Apply => "apply",
            Stage::Launch => "launch",
            Stage::Rollback => "rollback",
            Stage::Watch => "watch",
            Stage::Recover => "recover",
            Stage::Serve => "serve",
        };
        write!(f, "{}", s)
    }
}

/// Standard event names used in logging.
pub mod event_names {
    // Session lifecycle
    pub const SESSION_STARTED: &str = "update.session_started";
    pub const SESSION_FINISHED: &str = "update.session_finished";
    pub const UPDATE_NOT_NEEDED: &str = "update.not_needed";

    // Fetch / verify
    pub const FETCH_STARTED: &str = "update.fetch_started";
    pub const FETCH_RETRY: &str = "update.fetch_retry";
    pub const FETCH_FINISHED: &str = "update.fetch_finished";
    pub const VERIFY_MISMATCH: &str = "update.verify_mismatch";
    pub const VERIFY_FINISHED: &str = "update.verify_finished";

    // Backup / apply / launch
    pub const BACKUP_COMMITTED: &str = "update.backup_committed";
    pub const APPLY_COMMITTED: &str = "update.apply_committed";
    pub const APPLY_FAILED: &str = "update.apply_failed";
    pub const LAUNCH_STARTED: &str = "update.launch_started";
    pub const LAUNCH_FAILED: &str = "update.launch_failed";

    // In-process rollback
    pub const ROLLBACK_STARTED: &str = "update.rollback_started";
    pub const ROLLBACK_FINISHED: &str = "update.rollback_finished";
    pub const ROLLBACK_FAILED: &str = "update.rollback_failed";

    // Journal
    pub const JOURNAL_PUSHED: &str = "journal.pushed";
    pub const JOURNAL_POPPED: &str = "journal.popped";
    pub const JOURNAL_ARCHIVED: &str = "journal.archived";
    pub const JOURNAL_WRITE_FAILED: &str = "journal.write_failed";

    // Watchdog
    pub const WATCH_STARTED: &str = "watchdog.started";
    pub const WATCH_READY: &str = "watchdog.ready";
    pub const WATCH_EXIT_NORMAL: &str = "watchdog.exit_normal";
    pub const WATCH_EXIT_ABNORMAL: &str = "watchdog.exit_abnormal";
    pub const WATCH_FLAG_RAISED: &str = "watchdog.flag_raised";
    pub const WATCH_DUMP_FAILED: &str = "watchdog.dump_failed";

    // Recovery agent
    pub const RECOVERY_CYCLE: &str = "recovery.cycle";
    pub const RECOVERY_STARTED: &str = "recovery.started";
    pub const RECOVERY_BATCH_UNDONE: &str = "recovery.batch_undone";
    pub const RECOVERY_FINISHED: &str = "recovery.finished";
    pub const RECOVERY_FAILED: &str = "recovery.failed";
    pub const RECOVERY_SKIPPED: &str = "recovery.skipped";

    // Restore endpoint
    pub const SERVE_STARTED: &str = "serve.started";
    pub const SERVE_RESTORE: &str = "serve.restore";
    pub const SERVE_REJECTED: &str = "serve.rejected";

    // Config / init
    pub const CONFIG_LOADED: &str = "config.loaded";
    pub const CONFIG_ERROR: &str = "config.error";
}

/// Correlation context carried through a single invocation.
#[derive(Debug, Clone)]
pub struct LogContext {
    pub run_id: String,
    pub host_id: String,
    pub session_id: Option<String>,
    pub target_id: Option<String>,
}

impl LogContext {
    pub fn new(run_id: impl Into<String>, host_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            host_id: host_id.into(),
            session_id: None,
            target_id: None,
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_target_id(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_serialization() {
        assert_eq!(serde_json::to_string(&Stage::Rollback).unwrap(), "\"rollback\"");
        assert_eq!(Stage::Recover.to_string(), "recover");
    }

    #[test]
    fn test_event_names_are_namespaced() {
        for name in [
            event_names::BACKUP_COMMITTED,
            event_names::JOURNAL_PUSHED,
            event_names::WATCH_FLAG_RAISED,
            event_names::RECOVERY_FINISHED,
        ] {
            assert!(name.contains('.'), "{name} lacks a namespace");
        }
    }

    #[test]
    fn test_context_builders() {
        let ctx = LogContext::new("run-abc", "host-1")
            .with_session_id("gu-20260115-143022-a7xq")
            .with_target_id("editor-1a2b3c4d");
        assert_eq!(ctx.session_id.as_deref(), Some("gu-20260115-143022-a7xq"));
        assert_eq!(ctx.target_id.as_deref(), Some("editor-1a2b3c4d"));
    }
}
