//! Shared mutable state threaded through the pipeline stages.

use super::plan::{FilePlan, StagedPackage};
use crate::cancel::CancelToken;
use crate::events::{Phase, ProgressEmitter, ProgressEvent};
use crate::journal::Journal;
use crate::logging::LogContext;
use crate::operation::Batch;
use crate::platform::{PlatformStrategy, ProcessHandle};
use crate::source::{PackageDescriptor, PackageSource};
use gu_common::{SessionId, TargetId};
use gu_config::UpdaterConfig;
use std::path::PathBuf;

/// A package downloaded into the session's staging area.
#[derive(Debug, Clone)]
pub struct Download {
    pub descriptor: PackageDescriptor,
    pub path: PathBuf,
}

pub struct UpdateContext<'a> {
    pub session_id: SessionId,
    pub target_id: TargetId,
    pub config: &'a UpdaterConfig,
    pub strategy: &'a PlatformStrategy,
    pub source: &'a dyn PackageSource,
    pub journal: &'a mut Journal,
    emitter: &'a dyn ProgressEmitter,
    pub cancel: CancelToken,
    pub log: LogContext,

    pub install_dir: PathBuf,
    /// `<staging_dir>/<session>`; removed when the session ends.
    pub staging: PathBuf,
    /// `<backup_dir>/<target>/<session>`; kept while the session can be restored.
    pub backup_root: PathBuf,

    pub current_version: String,
    pub target_version: Option<String>,
    pub pending: Vec<PackageDescriptor>,
    pub downloads: Vec<Download>,
    pub staged: Vec<StagedPackage>,
    pub plan: Option<FilePlan>,
    /// Batches this session committed, oldest first.
    pub batches: Vec<Batch>,
    pub launch: bool,
    pub launched: Option<ProcessHandle>,
}

impl<'a> UpdateContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session_id: SessionId,
        target_id: TargetId,
        config: &'a UpdaterConfig,
        strategy: &'a PlatformStrategy,
        source: &'a dyn PackageSource,
        journal: &'a mut Journal,
        emitter: &'a dyn ProgressEmitter,
        cancel: CancelToken,
        log: LogContext,
        current_version: String,
    ) -> Self {
        let staging = config.staging_dir().join(session_id.as_str());
        let backup_root = config
            .backup_dir()
            .join(target_id.as_str())
            .join(session_id.as_str());
        Self {
            install_dir: config.paths.install_dir.clone(),
            staging,
            backup_root,
            session_id,
            target_id,
            config,
            strategy,
            source,
            journal,
            emitter,
            cancel,
            log,
            current_version,
            target_version: None,
            pending: Vec::new(),
            downloads: Vec::new(),
            staged: Vec::new(),
            plan: None,
            batches: Vec::new(),
            launch: true,
            launched: None,
        }
    }

    pub fn emit(&self, event: &str, phase: Phase) {
        self.emit_event(ProgressEvent::new(event, phase));
    }

    pub fn emit_event(&self, event: ProgressEvent) {
        self.emitter
            .emit(event.with_session_id(self.session_id.as_str()));
    }

    pub fn emitter(&self) -> &'a dyn ProgressEmitter {
        self.emitter
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.staging.join("downloads")
    }

    pub fn unpack_dir(&self, version: &str) -> PathBuf {
        self.staging.join("unpacked").join(version)
    }
}
