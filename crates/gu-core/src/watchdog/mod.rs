//! Process watchdog.
//!
//! Supervises a relaunched target until it exits. A normal exit ends the
//! session; an abnormal one writes a diagnostics bundle (best effort), a
//! failure record referencing the current journal, and raises the failure
//! flag. The watchdog never restores anything itself.

mod diagnostics;
mod probe;

pub use probe::{ChildProbe, ExitDetail, PidProbe, ProbeStatus, ProcessProbe};

use crate::cancel::CancelToken;
use crate::journal::{Journal, JournalSnapshot};
use crate::lock::{FileLock, LockError};
use crate::logging::event_names;
use crate::platform::ProcessHandle;
use crate::recovery::{ExitReason, FailureFlag, FailureRecord, RecoveryError};
use crate::store::{LockKind, StateStore};
use chrono::{DateTime, Utc};
use gu_common::{FailureClass, TargetId};
use gu_config::{Readiness, UpdaterConfig, WatchdogConfig};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum WatchdogError {
    #[error("target {0} is already monitored")]
    AlreadyMonitored(TargetId),

    #[error("process {0} not found")]
    ProcessNotFound(u32),

    #[error("cannot attach to pid {pid}: {reason}")]
    InvalidPid { pid: u32, reason: String },

    #[error("{0}")]
    Unsupported(String),

    #[error(transparent)]
    Lock(LockError),

    #[error("cannot poll process {pid}: {source}")]
    Probe {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot raise failure flag: {0}")]
    Flag(#[from] RecoveryError),
}

impl WatchdogError {
    pub fn class(&self) -> FailureClass {
        match self {
            WatchdogError::AlreadyMonitored(_)
            | WatchdogError::ProcessNotFound(_)
            | WatchdogError::InvalidPid { .. }
            | WatchdogError::Unsupported(_) => FailureClass::Configuration,
            WatchdogError::Lock(_) | WatchdogError::Probe { .. } => FailureClass::TransientIo,
            WatchdogError::Flag(e) => e.class(),
        }
    }
}

impl From<WatchdogError> for gu_common::Error {
    fn from(err: WatchdogError) -> Self {
        match err {
            WatchdogError::AlreadyMonitored(target) => gu_common::Error::AlreadyMonitored {
                target: target.to_string(),
            },
            WatchdogError::ProcessNotFound(pid) => gu_common::Error::ProcessNotFound { pid },
            err @ WatchdogError::InvalidPid { .. } => gu_common::Error::InvalidConfig(err.to_string()),
            WatchdogError::Unsupported(message) => gu_common::Error::UnsupportedPlatform(message),
            WatchdogError::Lock(e) => e.into(),
            WatchdogError::Flag(e) => e.into(),
            WatchdogError::Probe { source, .. } => gu_common::Error::Io(source),
        }
    }
}

/// One supervised target; holds the target's monitor lock while alive.
#[derive(Debug, Serialize)]
pub struct MonitorSession {
    pub target_id: TargetId,
    pub pid: u32,
    pub working_directory: PathBuf,
    pub dump_path: PathBuf,
    pub fail_record_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout_log: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_log: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    #[serde(skip)]
    _lock: FileLock,
}

/// How a supervision ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    NormalExit { code: Option<i32> },
    Failed { record: Box<FailureRecord> },
    /// Shutdown requested; the target keeps running unsupervised.
    Stopped,
}

pub struct Watchdog {
    store: StateStore,
    config: WatchdogConfig,
    install_dir: PathBuf,
    diagnostics_dir: PathBuf,
    dump_name: String,
    shutdown: CancelToken,
}

impl Watchdog {
    pub fn new(store: &StateStore, config: &UpdaterConfig) -> Self {
        Self {
            store: store.clone(),
            config: config.watchdog.clone(),
            install_dir: config.paths.install_dir.clone(),
            diagnostics_dir: config.diagnostics_dir(),
            dump_name: dump_file_name(&config.app.name, &config.app.current_version),
            shutdown: CancelToken::new(),
        }
    }

    pub fn with_shutdown(mut self, token: CancelToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Name the dump after the version actually running.
    pub fn with_version(mut self, app_name: &str, version: &str) -> Self {
        self.dump_name = dump_file_name(app_name, version);
        self
    }

    /// Take the monitor lock for `target`.
    pub fn acquire(&self, target: &TargetId, handle: &ProcessHandle) -> Result<MonitorSession, WatchdogError> {
        let lock = match self.store.try_lock(target, LockKind::Monitor) {
            Ok(lock) => lock,
            Err(LockError::Unavailable(_)) => {
                return Err(WatchdogError::AlreadyMonitored(target.clone()))
            }
            Err(e) => return Err(WatchdogError::Lock(e)),
        };
        Ok(MonitorSession {
            target_id: target.clone(),
            pid: handle.pid,
            working_directory: handle.working_dir.clone(),
            dump_path: self.diagnostics_dir.join(&self.dump_name),
            fail_record_path: self.store.failure_path(target),
            stdout_log: handle.stdout_log.clone(),
            stderr_log: handle.stderr_log.clone(),
            started_at: Utc::now(),
            _lock: lock,
        })
    }

    /// Supervise a started process: exact status for our own child, pid-only otherwise.
    pub fn supervise(&self, target: &TargetId, mut handle: ProcessHandle) -> Result<WatchOutcome, WatchdogError> {
        match handle.take_child() {
            Some(child) => {
                let session = self.acquire(target, &handle)?;
                self.watch(session, &mut ChildProbe::new(child))
            }
            None => {
                let mut probe = PidProbe::new(handle.pid).map_err(|e| match e.kind() {
                    std::io::ErrorKind::Unsupported => WatchdogError::Unsupported(e.to_string()),
                    _ => WatchdogError::InvalidPid {
                        pid: handle.pid,
                        reason: e.to_string(),
                    },
                })?;
                if !probe.is_alive() {
                    return Err(WatchdogError::ProcessNotFound(handle.pid));
                }
                let session = self.acquire(target, &handle)?;
                self.watch(session, &mut probe)
            }
        }
    }

    /// Poll until the target exits or shutdown is requested.
    pub fn watch(&self, session: MonitorSession, probe: &mut dyn ProcessProbe) -> Result<WatchOutcome, WatchdogError> {
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(10));
        let timeout = Duration::from_secs(self.config.startup_timeout_secs);
        let started = Instant::now();
        let mut ready = false;

        info!(
            target: event_names::WATCH_STARTED,
            target_id = %session.target_id,
            pid = session.pid,
            "supervising target"
        );

        loop {
            if self.shutdown.is_cancelled() {
                info!(target_id = %session.target_id, pid = session.pid, "watchdog stopped");
                return Ok(WatchOutcome::Stopped);
            }

            let status = probe.poll().map_err(|source| WatchdogError::Probe {
                pid: session.pid,
                source,
            })?;

            if let ProbeStatus::Exited(detail) = status {
                return match self.classify(detail, ready) {
                    None => {
                        let code = match detail {
                            ExitDetail::Code(code) => Some(code),
                            _ => None,
                        };
                        info!(
                            target: event_names::WATCH_EXIT_NORMAL,
                            target_id = %session.target_id,
                            pid = session.pid,
                            code = ?code,
                            "target exited normally"
                        );
                        Ok(WatchOutcome::NormalExit { code })
                    }
                    Some(reason) => self.fail(&session, reason),
                };
            }

            if !ready {
                if self.is_ready(started.elapsed()) {
                    ready = true;
                    info!(
                        target: event_names::WATCH_READY,
                        target_id = %session.target_id,
                        pid = session.pid,
                        after_ms = started.elapsed().as_millis() as u64,
                        "target ready"
                    );
                } else if started.elapsed() >= timeout {
                    warn!(
                        target_id = %session.target_id,
                        pid = session.pid,
                        "target not ready in time; terminating"
                    );
                    probe.terminate();
                    return self.fail(
                        &session,
                        ExitReason::StartupTimeout {
                            after_secs: self.config.startup_timeout_secs,
                        },
                    );
                }
            }

            std::thread::sleep(poll);
        }
    }

    fn is_ready(&self, elapsed: Duration) -> bool {
        match &self.config.readiness {
            Readiness::AliveFor { secs } => elapsed >= Duration::from_secs(*secs),
            Readiness::MarkerFile { path } => resolve_marker(&self.install_dir, path).exists(),
        }
    }

    /// `None` for a normal exit, otherwise the failure reason.
    fn classify(&self, detail: ExitDetail, ready: bool) -> Option<ExitReason> {
        match detail {
            ExitDetail::Code(code) if self.config.expected_exit_codes.contains(&code) => None,
            ExitDetail::Code(code) if !ready => Some(ExitReason::ExitedBeforeReady { code: Some(code) }),
            ExitDetail::Code(code) => Some(ExitReason::UnexpectedCode { code }),
            ExitDetail::Signal(signal) => Some(ExitReason::Signaled { signal }),
            ExitDetail::Unknown if !ready => Some(ExitReason::ExitedBeforeReady { code: None }),
            ExitDetail::Unknown if self.config.unknown_exit_is_failure => Some(ExitReason::UnknownStatus),
            ExitDetail::Unknown => None,
        }
    }

    fn fail(&self, session: &MonitorSession, reason: ExitReason) -> Result<WatchOutcome, WatchdogError> {
        warn!(
            target: event_names::WATCH_EXIT_ABNORMAL,
            target_id = %session.target_id,
            pid = session.pid,
            reason = %reason,
            "target failed"
        );

        let diagnostics = match diagnostics::write_dump(
            &self.store,
            session,
            &reason,
            self.config.capture_output_bytes,
        ) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(
                    target: event_names::WATCH_DUMP_FAILED,
                    target_id = %session.target_id,
                    error = %e,
                    "diagnostics bundle not written"
                );
                None
            }
        };

        let snapshot = match Journal::open(&self.store, &session.target_id) {
            Ok(journal) => journal.snapshot().clone(),
            Err(e) => {
                debug!(error = %e, "journal unreadable for failure record");
                JournalSnapshot::empty(session.target_id.clone())
            }
        };
        let record = FailureRecord::new(session.target_id.clone(), reason, &snapshot)
            .with_pid(session.pid)
            .with_diagnostics(diagnostics);

        let flag = FailureFlag::new(&self.store, &session.target_id);
        match flag.raise(&record) {
            Ok(true) => error!(
                target: event_names::WATCH_FLAG_RAISED,
                target_id = %session.target_id,
                batches = record.journal_reference.batch_count,
                "failure flag raised; recovery agent will restore"
            ),
            Ok(false) => info!(target_id = %session.target_id, "failure flag already raised"),
            Err(e) => return Err(e.into()),
        }
        Ok(WatchOutcome::Failed {
            record: Box::new(record),
        })
    }
}

fn dump_file_name(app: &str, version: &str) -> String {
    let clean = |s: &str| -> String {
        s.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect()
    };
    format!("{}_{}_fail.zip", clean(app), clean(version))
}

fn resolve_marker(install_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        install_dir.join(path)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::platform::LaunchRequest;
    use crate::recovery::FlagState;
    use gu_bundle::DumpReader;
    use std::process::{Command, Stdio};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: StateStore,
        config: UpdaterConfig,
        target: TargetId,
    }

    fn fixture(readiness: Readiness, timeout_secs: u64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = UpdaterConfig::default();
        config.app.name = "editor".to_string();
        config.app.current_version = "1.5.0".to_string();
        config.paths.install_dir = dir.path().join("install");
        config.paths.state_dir = Some(dir.path().join("state"));
        config.paths.diagnostics_dir = Some(dir.path().join("diag"));
        config.watchdog.poll_interval_ms = 20;
        config.watchdog.readiness = readiness;
        config.watchdog.startup_timeout_secs = timeout_secs;
        std::fs::create_dir_all(&config.paths.install_dir).unwrap();
        let store = StateStore::new(config.state_dir());
        Fixture {
            _dir: dir,
            store,
            config,
            target: TargetId::from_name("editor"),
        }
    }

    fn spawn(script: &str, logs: &Path) -> ProcessHandle {
        std::fs::create_dir_all(logs).unwrap();
        let child = Command::new("sh")
            .args(["-c", script])
            .stdout(Stdio::from(std::fs::File::create(logs.join("stdout.log")).unwrap()))
            .stderr(Stdio::from(std::fs::File::create(logs.join("stderr.log")).unwrap()))
            .spawn()
            .unwrap();
        let request = LaunchRequest {
            executable: "sh".into(),
            args: Vec::new(),
            working_dir: logs.to_path_buf(),
            launch_script: None,
            output_dir: Some(logs.to_path_buf()),
        };
        ProcessHandle::from_child(child, &request)
    }

    #[test]
    fn test_normal_exit_leaves_flag_clear() {
        let fx = fixture(Readiness::AliveFor { secs: 0 }, 5);
        let watchdog = Watchdog::new(&fx.store, &fx.config);
        let handle = spawn("sleep 0.2; exit 0", &fx.config.paths.install_dir.join("logs"));
        let outcome = watchdog.supervise(&fx.target, handle).unwrap();
        assert_eq!(outcome, WatchOutcome::NormalExit { code: Some(0) });
        assert!(FailureFlag::new(&fx.store, &fx.target).load().unwrap().is_clear());
    }

    #[test]
    fn test_crash_raises_flag_and_dumps() {
        let fx = fixture(Readiness::AliveFor { secs: 0 }, 5);
        let watchdog = Watchdog::new(&fx.store, &fx.config);
        let handle = spawn(
            "echo 'fatal: bad plugin' >&2; sleep 0.2; kill -SEGV $$",
            &fx.config.paths.install_dir.join("logs"),
        );
        let outcome = watchdog.supervise(&fx.target, handle).unwrap();
        let WatchOutcome::Failed { record } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(record.exit_reason, ExitReason::Signaled { signal: libc::SIGSEGV });

        let flag = FailureFlag::new(&fx.store, &fx.target);
        assert!(matches!(flag.load().unwrap(), FlagState::Raised { .. }));
        assert_eq!(flag.record().unwrap().unwrap().exit_reason, record.exit_reason);

        let dump = record.diagnostics_path.clone().unwrap();
        assert!(dump.ends_with("editor_1.5.0_fail.zip"));
        let mut reader = DumpReader::open(&dump).unwrap();
        assert!(reader.damaged().is_empty());
        let stderr = reader.entry("logs/stderr.log").unwrap();
        assert!(String::from_utf8_lossy(&stderr).contains("bad plugin"));
    }

    #[test]
    fn test_unexpected_code_after_ready() {
        let fx = fixture(Readiness::AliveFor { secs: 0 }, 5);
        let watchdog = Watchdog::new(&fx.store, &fx.config);
        let handle = spawn("sleep 0.2; exit 7", &fx.config.paths.install_dir.join("logs"));
        let WatchOutcome::Failed { record } = watchdog.supervise(&fx.target, handle).unwrap() else {
            panic!("expected failure");
        };
        assert_eq!(record.exit_reason, ExitReason::UnexpectedCode { code: 7 });
    }

    #[test]
    fn test_startup_timeout_kills_hung_target() {
        let fx = fixture(
            Readiness::MarkerFile {
                path: "ready.marker".into(),
            },
            1,
        );
        let watchdog = Watchdog::new(&fx.store, &fx.config);
        let handle = spawn("sleep 30", &fx.config.paths.install_dir.join("logs"));
        let started = Instant::now();
        let WatchOutcome::Failed { record } = watchdog.supervise(&fx.target, handle).unwrap() else {
            panic!("expected failure");
        };
        assert_eq!(record.exit_reason, ExitReason::StartupTimeout { after_secs: 1 });
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_marker_file_readiness() {
        let fx = fixture(
            Readiness::MarkerFile {
                path: "ready.marker".into(),
            },
            5,
        );
        let marker = fx.config.paths.install_dir.join("ready.marker");
        let script = format!("touch '{}'; sleep 0.3; exit 0", marker.display());
        let watchdog = Watchdog::new(&fx.store, &fx.config);
        let handle = spawn(&script, &fx.config.paths.install_dir.join("logs"));
        assert_eq!(
            watchdog.supervise(&fx.target, handle).unwrap(),
            WatchOutcome::NormalExit { code: Some(0) }
        );
    }

    #[test]
    fn test_second_session_is_refused() {
        let fx = fixture(Readiness::AliveFor { secs: 0 }, 5);
        let watchdog = Watchdog::new(&fx.store, &fx.config);
        let handle = ProcessHandle::external(std::process::id(), "self".into(), ".".into());
        let _first = watchdog.acquire(&fx.target, &handle).unwrap();
        assert!(matches!(
            watchdog.acquire(&fx.target, &handle),
            Err(WatchdogError::AlreadyMonitored(_))
        ));
    }

    #[test]
    fn test_shutdown_stops_supervision() {
        let fx = fixture(Readiness::AliveFor { secs: 0 }, 5);
        let token = CancelToken::new();
        token.cancel();
        let watchdog = Watchdog::new(&fx.store, &fx.config).with_shutdown(token);
        let handle = ProcessHandle::external(std::process::id(), "self".into(), ".".into());
        assert_eq!(watchdog.supervise(&fx.target, handle).unwrap(), WatchOutcome::Stopped);
    }

    #[test]
    fn test_attach_refuses_pid_zero_without_locking() {
        let fx = fixture(Readiness::AliveFor { secs: 0 }, 5);
        let watchdog = Watchdog::new(&fx.store, &fx.config);
        let handle = ProcessHandle::external(0, "self".into(), ".".into());
        let err = watchdog.supervise(&fx.target, handle).unwrap_err();
        assert!(matches!(err, WatchdogError::InvalidPid { pid: 0, .. }));
        assert_eq!(err.class(), FailureClass::Configuration);
        assert!(!fx.store.lock_path(&fx.target, LockKind::Monitor).exists());
    }

    #[test]
    fn test_dump_file_name_is_sanitized() {
        assert_eq!(dump_file_name("My App", "2.0.0"), "My_App_2.0.0_fail.zip");
    }
}
