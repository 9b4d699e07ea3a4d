//! Update pipeline: `Fetch → Verify → Backup → Apply → Launch`.
//!
//! Stages run strictly in order over one [`UpdateContext`]. Each stage
//! receives the rest of the chain as [`Next`] and may decline to call it,
//! which ends the session early (no newer version, for instance).
//!
//! Only Backup and Apply commit batches, Backup first. When a later stage
//! fails, the engine undoes this session's committed batches newest first
//! and pops each from the journal before reporting `Aborted`. If that
//! in-process rollback itself fails, the failure flag is raised so the
//! recovery agent finishes the job.

mod context;
mod fetch;
mod plan;
mod stages;

pub use context::{Download, UpdateContext};
pub use fetch::FetchStage;
pub use plan::{DriverInstall, FilePlan, StagedPackage, DRIVERS_DIR, VERSION_MARKER};
pub use stages::{ApplyStage, BackupStage, LaunchStage, VerifyStage};

use crate::archive::ArchiveError;
use crate::cancel::CancelToken;
use crate::events::{event_names as progress, ObserverList, Phase, ProgressEmitter, ProgressEvent};
use crate::executor::{Executor, ExecutorError};
use crate::journal::{Journal, JournalError};
use crate::lock::LockError;
use crate::log_event;
use crate::logging::{event_names, generate_run_id, get_host_id, LogContext, Stage as LogStage};
use crate::platform::{PlatformError, PlatformStrategy, ProcessHandle};
use crate::recovery::{ExitReason, FailureFlag, FailureRecord, RecoveryError};
use crate::source::{PackageSource, SourceError};
use crate::store::{sort_by_age, LockKind, StateStore};
use gu_common::{FailureClass, SessionId, TargetId};
use gu_config::UpdaterConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot read version metadata: {0}")]
    Metadata(#[source] SourceError),

    #[error("download of {package} failed: {source}")]
    Fetch {
        package: String,
        #[source]
        source: SourceError,
    },

    #[error("digest mismatch for {package}: expected {expected}, got {actual}")]
    DigestMismatch {
        package: String,
        expected: String,
        actual: String,
    },

    #[error("cannot unpack {package}: {source}")]
    Archive {
        package: String,
        #[source]
        source: ArchiveError,
    },

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error("{stage} failed: {source}")]
    Execute {
        stage: String,
        #[source]
        source: ExecutorError,
    },

    #[error(transparent)]
    Launch(PlatformError),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("update cancelled")]
    Cancelled,

    #[error("recovery pending for target {0}")]
    RecoveryPending(TargetId),

    #[error("another update session holds the lock for {0}")]
    Busy(TargetId),

    #[error(transparent)]
    Lock(LockError),

    #[error(transparent)]
    Flag(#[from] RecoveryError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            PipelineError::Metadata(_) | PipelineError::Fetch { .. } => FailureClass::TransientIo,
            PipelineError::DigestMismatch { .. } | PipelineError::Archive { .. } => {
                FailureClass::Corruption
            }
            PipelineError::Journal(e) => e.class(),
            PipelineError::Execute { source, .. } => source.class(),
            PipelineError::Launch(_) | PipelineError::Io { .. } | PipelineError::Internal(_) => {
                FailureClass::ApplyFailure
            }
            PipelineError::Cancelled => FailureClass::Cancelled,
            PipelineError::RecoveryPending(_) => FailureClass::TargetCrash,
            PipelineError::Busy(_) | PipelineError::Lock(_) => FailureClass::Configuration,
            PipelineError::Flag(e) => e.class(),
        }
    }

    pub fn abort_reason(&self) -> AbortReason {
        match self {
            PipelineError::Metadata(_) | PipelineError::Fetch { .. } => AbortReason::FetchFailed,
            PipelineError::Launch(_) => AbortReason::LaunchFailure,
            PipelineError::RecoveryPending(_) => AbortReason::RecoveryPending,
            PipelineError::Busy(_) | PipelineError::Lock(_) => AbortReason::SessionBusy,
            _ => match self.class() {
                FailureClass::Corruption => AbortReason::Corruption,
                FailureClass::JournalWriteFailure => AbortReason::JournalWriteFailure,
                FailureClass::Cancelled => AbortReason::Cancelled,
                FailureClass::Configuration => AbortReason::Configuration,
                _ => AbortReason::ApplyFailure,
            },
        }
    }
}

/// Why a session ended without succeeding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    FetchFailed,
    Corruption,
    JournalWriteFailure,
    ApplyFailure,
    LaunchFailure,
    Cancelled,
    RecoveryPending,
    SessionBusy,
    Configuration,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AbortReason::FetchFailed => "fetch_failed",
            AbortReason::Corruption => "corruption",
            AbortReason::JournalWriteFailure => "journal_write_failure",
            AbortReason::ApplyFailure => "apply_failure",
            AbortReason::LaunchFailure => "launch_failure",
            AbortReason::Cancelled => "cancelled",
            AbortReason::RecoveryPending => "recovery_pending",
            AbortReason::SessionBusy => "session_busy",
            AbortReason::Configuration => "configuration",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum SessionOutcome {
    Succeeded,
    Aborted(AbortReason),
}

/// What the in-process rollback did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackSummary {
    pub batches: usize,
    pub operations: usize,
    /// Set when rollback stopped early; the failure flag was raised.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Undo problems hit while the failing batch unwound itself.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub unwind_errors: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub target_id: TargetId,
    pub outcome: SessionOutcome,
    pub from_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_version: Option<String>,
    pub batches_committed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_class: Option<FailureClass>,
    pub duration_ms: u64,
    /// The started target, handed to the watchdog by the caller.
    #[serde(skip)]
    pub process: Option<ProcessHandle>,
}

impl SessionReport {
    fn new(session_id: SessionId, target_id: TargetId, from_version: String) -> Self {
        Self {
            session_id,
            target_id,
            outcome: SessionOutcome::Succeeded,
            from_version,
            to_version: None,
            batches_committed: 0,
            rollback: None,
            error: None,
            failure_class: None,
            duration_ms: 0,
            process: None,
        }
    }

    fn abort(mut self, error: &PipelineError) -> Self {
        self.outcome = SessionOutcome::Aborted(error.abort_reason());
        self.error = Some(error.to_string());
        self.failure_class = Some(error.class());
        self
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == SessionOutcome::Succeeded
    }

    /// An update was installed (not merely "already up to date").
    pub fn updated(&self) -> bool {
        self.succeeded() && self.to_version.is_some()
    }
}

/// One pipeline stage.
pub trait Stage: Send + Sync {
    fn name(&self) -> LogStage;
    fn run(&self, ctx: &mut UpdateContext<'_>, next: Next<'_>) -> Result<(), PipelineError>;
}

/// The remainder of the stage chain.
pub struct Next<'s> {
    stages: &'s [Box<dyn Stage>],
}

impl<'s> Next<'s> {
    pub fn new(stages: &'s [Box<dyn Stage>]) -> Self {
        Self { stages }
    }

    /// Run the next stage, checking for cancellation first.
    pub fn run(self, ctx: &mut UpdateContext<'_>) -> Result<(), PipelineError> {
        let Some((stage, rest)) = self.stages.split_first() else {
            return Ok(());
        };
        if ctx.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        tracing::debug!(stage = %stage.name(), "entering stage");
        stage.run(ctx, Next { stages: rest })
    }
}

/// The standard stage chain.
pub fn default_stages() -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(FetchStage),
        Box::new(VerifyStage),
        Box::new(BackupStage),
        Box::new(ApplyStage),
        Box::new(LaunchStage),
    ]
}

/// Drives update sessions for one installation.
pub struct UpdateEngine {
    config: UpdaterConfig,
    strategy: PlatformStrategy,
    source: Box<dyn PackageSource>,
    store: StateStore,
    observers: ObserverList,
    stages: Vec<Box<dyn Stage>>,
    launch: bool,
}

impl UpdateEngine {
    pub fn new(config: UpdaterConfig, strategy: PlatformStrategy, source: Box<dyn PackageSource>) -> Self {
        let store = StateStore::new(config.state_dir());
        Self {
            config,
            strategy,
            source,
            store,
            observers: ObserverList::new(),
            stages: default_stages(),
            launch: true,
        }
    }

    /// Do not start the target after applying.
    pub fn without_launch(mut self) -> Self {
        self.launch = false;
        self
    }

    pub fn register_observer(&self, observer: Arc<dyn ProgressEmitter>) {
        self.observers.register(observer);
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn strategy(&self) -> &PlatformStrategy {
        &self.strategy
    }

    pub fn target_id(&self) -> TargetId {
        TargetId::for_install(&self.config.app.name, &self.config.paths.install_dir)
    }

    pub fn open_journal(&self) -> Result<Journal, JournalError> {
        Journal::open(&self.store, &self.target_id())
    }

    /// Installed version: the marker file when present, else the configured one.
    pub fn current_version(&self) -> String {
        std::fs::read_to_string(self.config.paths.install_dir.join(VERSION_MARKER))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.config.app.current_version.clone())
    }

    /// Run one session against the target's journal.
    pub fn run(&self, cancel: &CancelToken) -> SessionReport {
        match self.open_journal() {
            Ok(mut journal) => self.run_with_journal(&mut journal, cancel),
            Err(e) => {
                let report = SessionReport::new(SessionId::new(), self.target_id(), self.current_version());
                report.abort(&PipelineError::Journal(e))
            }
        }
    }

    pub fn run_with_journal(&self, journal: &mut Journal, cancel: &CancelToken) -> SessionReport {
        let started = Instant::now();
        let session_id = SessionId::new();
        let target = self.target_id();
        let log = LogContext::new(generate_run_id(), get_host_id())
            .with_session_id(session_id.as_str())
            .with_target_id(target.as_str());
        let mut report = SessionReport::new(session_id.clone(), target.clone(), self.current_version());

        log_event!(
            log,
            INFO,
            event_names::SESSION_STARTED,
            LogStage::Init,
            "update session started",
            from_version = report.from_version.as_str()
        );

        // Held for the whole session.
        let _update_lock = match self.store.try_lock(&target, LockKind::Update) {
            Ok(lock) => lock,
            Err(LockError::Unavailable(_)) => {
                return self.finish(report.abort(&PipelineError::Busy(target)), &log, started)
            }
            Err(e) => return self.finish(report.abort(&PipelineError::Lock(e)), &log, started),
        };
        if let Err(e) = self.preflight(&target, journal) {
            return self.finish(report.abort(&e), &log, started);
        }
        let retention = self.config.recovery.journal_retention;
        if let Err(e) = journal.begin_session(&session_id, retention) {
            return self.finish(report.abort(&PipelineError::Journal(e)), &log, started);
        }
        prune_backups(
            &self.config.backup_dir().join(target.as_str()),
            &session_id,
            retention,
        );

        let mut ctx = UpdateContext::new(
            session_id,
            target,
            &self.config,
            &self.strategy,
            self.source.as_ref(),
            journal,
            &self.observers,
            cancel.clone(),
            log.clone(),
            report.from_version.clone(),
        );
        ctx.launch = self.launch;

        let result = Next::new(&self.stages).run(&mut ctx);
        report.batches_committed = ctx.batches.len();
        report.to_version = ctx.target_version.clone();

        match result {
            Ok(()) => {
                report.process = ctx.launched.take();
            }
            Err(e) => {
                let unwind_errors = match &e {
                    PipelineError::Execute { source, .. } => source.unwind_errors().to_vec(),
                    _ => Vec::new(),
                };
                report = report.abort(&e);
                if !ctx.batches.is_empty() {
                    let mut summary = rollback(&mut ctx, &self.store);
                    summary.unwind_errors = unwind_errors;
                    if summary.error.is_none() {
                        let _ = std::fs::remove_dir_all(&ctx.backup_root);
                    }
                    report.rollback = Some(summary);
                }
                ctx.emit_event(
                    ProgressEvent::new(progress::SESSION_ABORTED, Phase::Session)
                        .with_detail("reason", e.abort_reason())
                        .with_detail("error", e.to_string()),
                );
            }
        }
        if let Err(e) = std::fs::remove_dir_all(&ctx.staging) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(path = %ctx.staging.display(), error = %e, "staging not removed");
            }
        }
        drop(ctx);
        self.finish(report, &log, started)
    }

    /// Refuse to start while a failure is pending restore.
    fn preflight(&self, target: &TargetId, journal: &Journal) -> Result<(), PipelineError> {
        if journal.target() != target {
            return Err(PipelineError::Internal(format!(
                "journal for {} passed to session for {}",
                journal.target(),
                target
            )));
        }
        let state = FailureFlag::new(&self.store, target).load()?;
        if !state.is_clear() {
            return Err(PipelineError::RecoveryPending(target.clone()));
        }
        Ok(())
    }

    fn finish(&self, mut report: SessionReport, log: &LogContext, started: Instant) -> SessionReport {
        report.duration_ms = started.elapsed().as_millis() as u64;
        match report.outcome {
            SessionOutcome::Succeeded => log_event!(
                log,
                INFO,
                event_names::SESSION_FINISHED,
                LogStage::Init,
                "update session succeeded",
                to_version = tracing::field::debug(&report.to_version),
                batches = report.batches_committed,
                duration_ms = report.duration_ms
            ),
            SessionOutcome::Aborted(reason) => log_event!(
                log,
                WARN,
                event_names::SESSION_FINISHED,
                LogStage::Init,
                "update session aborted",
                reason = tracing::field::display(reason),
                error = tracing::field::debug(&report.error),
                duration_ms = report.duration_ms
            ),
        }
        report
    }
}

/// Undo this session's batches newest first, popping each from the journal.
fn rollback(ctx: &mut UpdateContext<'_>, store: &StateStore) -> RollbackSummary {
    log_event!(
        ctx.log,
        WARN,
        event_names::ROLLBACK_STARTED,
        LogStage::Rollback,
        "rolling back session",
        batches = ctx.batches.len()
    );
    let executor = Executor::new(ctx.strategy);
    let mut summary = RollbackSummary::default();

    while let Some(mut batch) = ctx.batches.pop() {
        let result = executor
            .run_backward(&mut batch)
            .map_err(|e| e.to_string())
            .and_then(|undone| ctx.journal.pop().map(|_| undone).map_err(|e| e.to_string()));
        match result {
            Ok(undone) => {
                summary.batches += 1;
                summary.operations += undone;
            }
            Err(error) => {
                log_event!(
                    ctx.log,
                    ERROR,
                    event_names::ROLLBACK_FAILED,
                    LogStage::Rollback,
                    "rollback failed; deferring to recovery agent",
                    stage = batch.stage.as_str(),
                    error = error.as_str()
                );
                escalate(ctx, store, &error);
                summary.error = Some(error);
                return summary;
            }
        }
    }

    log_event!(
        ctx.log,
        INFO,
        event_names::ROLLBACK_FINISHED,
        LogStage::Rollback,
        "session rolled back",
        batches = summary.batches,
        operations = summary.operations
    );
    ctx.emit_event(
        ProgressEvent::new(progress::ROLLBACK_COMPLETED, Phase::Rollback)
            .with_detail("batches", summary.batches),
    );
    summary
}

/// Hand an unfinished rollback to the recovery agent.
/// Drop backup session directories under `dir` beyond the newest
/// `retention`, matching the archived journals they belong to. `current`
/// is never counted or removed.
fn prune_backups(dir: &Path, current: &SessionId, retention: usize) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "cannot list backup sessions");
            return;
        }
    };
    let mut sessions: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .map(|e| e.path())
        .filter(|p| p.file_name().and_then(|n| n.to_str()) != Some(current.as_str()))
        .collect();
    if sessions.len() <= retention {
        return;
    }
    sort_by_age(&mut sessions, "", "");
    for old in &sessions[..sessions.len() - retention] {
        match std::fs::remove_dir_all(old) {
            Ok(()) => tracing::debug!(path = %old.display(), "backup session pruned"),
            Err(e) => tracing::warn!(path = %old.display(), error = %e, "cannot prune backup session"),
        }
    }
}

fn escalate(ctx: &UpdateContext<'_>, store: &StateStore, error: &str) {
    let record = FailureRecord::new(
        ctx.target_id.clone(),
        ExitReason::RollbackFailed {
            error: error.to_string(),
        },
        ctx.journal.snapshot(),
    );
    if let Err(e) = FailureFlag::new(store, &ctx.target_id).raise(&record) {
        tracing::error!(error = %e, "cannot raise failure flag after rollback failure");
    }
}
