//! Per-platform update strategies.
//!
//! The host is detected once per process and mapped onto a closed set of
//! platforms. Every platform shares the same filesystem primitives; they
//! differ in executable naming, launch mechanism, and driver handling.

pub mod driver;
pub mod fs;
pub mod launch;

pub use driver::{CommandOutput, CommandRunner, DriverRegistrar, RecordingCommandRunner, SystemCommandRunner};
pub use launch::{LaunchOutcome, LaunchRequest, ProcessHandle};

use crate::cancel::CancelToken;
use crate::digest;
use crate::executor::{Executor, ExecutorError, InterpretError, OperationInterpreter};
use crate::operation::{Batch, ForwardPayload, Operation, OperationKind, UndoPayload};
use crate::source::{PackageSource, PackageDescriptor, SourceError};
use gu_common::SessionId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("unsupported platform: {0}")]
    Unsupported(String),

    #[error("cannot launch {executable}: {message}")]
    Launch { executable: PathBuf, message: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PlatformError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        PlatformError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl From<PlatformError> for gu_common::Error {
    fn from(err: PlatformError) -> Self {
        match err {
            PlatformError::Unsupported(what) => gu_common::Error::UnsupportedPlatform(what),
            PlatformError::Launch { .. } => gu_common::Error::Launch(err.to_string()),
            PlatformError::Io { source, .. } => gu_common::Error::Io(source),
        }
    }
}

/// Supported host platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostPlatform {
    Windows,
    Linux,
    MacOs,
    Android,
    Ios,
}

impl HostPlatform {
    /// The platform this binary runs on.
    pub fn detect() -> Result<Self, PlatformError> {
        Self::from_os(std::env::consts::OS)
            .ok_or_else(|| PlatformError::Unsupported(std::env::consts::OS.to_string()))
    }

    pub fn from_os(os: &str) -> Option<Self> {
        match os {
            "windows" => Some(HostPlatform::Windows),
            "linux" => Some(HostPlatform::Linux),
            "macos" => Some(HostPlatform::MacOs),
            "android" => Some(HostPlatform::Android),
            "ios" => Some(HostPlatform::Ios),
            _ => None,
        }
    }
}

impl std::fmt::Display for HostPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HostPlatform::Windows => "windows",
            HostPlatform::Linux => "linux",
            HostPlatform::MacOs => "macos",
            HostPlatform::Android => "android",
            HostPlatform::Ios => "ios",
        };
        write!(f, "{}", s)
    }
}

/// A live file to copy into the backup area before it is touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupTarget {
    pub artifact_id: String,
    pub live: PathBuf,
    pub backup: PathBuf,
}

/// A registered driver to export before it is replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverBackup {
    pub name: String,
    pub export_dir: PathBuf,
}

/// Strategy for one host platform, fixed for a session.
#[derive(Debug, Clone)]
pub struct PlatformStrategy {
    host: HostPlatform,
    drivers: DriverRegistrar,
}

impl PlatformStrategy {
    /// Strategy for the running host.
    pub fn for_host() -> Result<Self, PlatformError> {
        Ok(Self::resolve(HostPlatform::detect()?))
    }

    pub fn resolve(host: HostPlatform) -> Self {
        Self::with_runner(host, Arc::new(SystemCommandRunner))
    }

    /// Strategy whose host commands go through `runner`.
    pub fn with_runner(host: HostPlatform, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            host,
            drivers: DriverRegistrar::new(host, runner),
        }
    }

    pub fn host(&self) -> HostPlatform {
        self.host
    }

    pub fn drivers(&self) -> &DriverRegistrar {
        &self.drivers
    }

    /// Path of the main executable inside the install directory.
    pub fn executable_path(&self, install_dir: &Path, main_executable: &Path) -> PathBuf {
        let path = install_dir.join(main_executable);
        if self.host == HostPlatform::Windows && path.extension().is_none() {
            path.with_extension("exe")
        } else {
            path
        }
    }

    /// Download one package into `dest_dir`.
    ///
    /// The download lands in a `.partial` file renamed into place on success.
    pub fn fetch(
        &self,
        source: &dyn PackageSource,
        descriptor: &PackageDescriptor,
        dest_dir: &Path,
        progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<PathBuf, SourceError> {
        std::fs::create_dir_all(dest_dir)?;
        let dest = dest_dir.join(descriptor.file_name());
        let partial = dest.with_extension("zip.partial");
        let result = (|| {
            let mut file = std::fs::File::create(&partial)?;
            source.fetch_package(&descriptor.url, &mut file, progress)?;
            file.sync_all()?;
            std::fs::rename(&partial, &dest)?;
            Ok::<_, SourceError>(())
        })();
        if let Err(e) = result {
            let _ = std::fs::remove_file(&partial);
            return Err(e);
        }
        Ok(dest)
    }

    pub fn verify(&self, artifact: &Path, expected_digest: &str) -> std::io::Result<bool> {
        let actual = digest::compute_digest(artifact)?;
        Ok(digest::digests_match(&actual, expected_digest))
    }

    /// Build the backup batch for the files and drivers an update will touch.
    pub fn backup(&self, session: &SessionId, files: &[BackupTarget], drivers: &[DriverBackup]) -> Batch {
        let mut batch = Batch::new("backup", session.clone());
        for target in files {
            batch.push(Operation::new(
                OperationKind::Backup,
                target.artifact_id.clone(),
                ForwardPayload::CopyFile {
                    from: target.live.clone(),
                    to: target.backup.clone(),
                },
                // Copying out leaves the live file untouched.
                UndoPayload::Noop,
            ));
        }
        if self.drivers.extension().is_some() {
            for driver in drivers {
                batch.push(Operation::new(
                    OperationKind::Backup,
                    format!("driver:{}", driver.name),
                    ForwardPayload::ExportArtifact {
                        name: driver.name.clone(),
                        destination: driver.export_dir.clone(),
                    },
                    UndoPayload::Noop,
                ));
            }
        }
        batch
    }

    /// Run a committed batch forward.
    pub fn apply(&self, batch: &mut Batch, cancel: &CancelToken) -> Result<(), ExecutorError> {
        Executor::new(self).run_forward(batch, cancel)
    }

    pub fn launch(&self, request: &LaunchRequest) -> Result<LaunchOutcome, PlatformError> {
        launch::launch(self.host, request)
    }
}

impl OperationInterpreter for PlatformStrategy {
    fn forward(&self, op: &Operation) -> Result<(), InterpretError> {
        match &op.forward {
            ForwardPayload::CopyFile { from, to } => {
                fs::replace_file(from, to).map_err(|e| InterpretError::io(to, e))
            }
            ForwardPayload::RemoveFile { path } => {
                fs::remove_if_exists(path).map_err(|e| InterpretError::io(path, e))
            }
            ForwardPayload::RegisterArtifact { source, .. } => self.drivers.install(source),
            ForwardPayload::ExportArtifact { name, destination } => {
                self.drivers.export(name, destination).map(|_| ())
            }
            ForwardPayload::Journaled => Err(InterpretError::NotReplayable(op.artifact_id.clone())),
        }
    }

    fn undo(&self, undo: &UndoPayload) -> Result<(), InterpretError> {
        match undo {
            UndoPayload::RestoreFile { backup, target } => {
                if !backup.is_file() {
                    warn!(
                        backup = %backup.display(),
                        target = %target.display(),
                        "backup missing; cannot restore"
                    );
                    return Err(InterpretError::io(
                        backup,
                        std::io::Error::new(std::io::ErrorKind::NotFound, "backup copy is missing"),
                    ));
                }
                fs::replace_file(backup, target).map_err(|e| InterpretError::io(target, e))
            }
            UndoPayload::RemoveFile { path } => {
                fs::remove_if_exists(path).map_err(|e| InterpretError::io(path, e))
            }
            UndoPayload::DeregisterArtifact { name, reinstall } => {
                self.drivers.uninstall(name)?;
                if let Some(export) = reinstall.as_ref().filter(|p| p.exists()) {
                    self.drivers.install(export)?;
                }
                Ok(())
            }
            UndoPayload::Noop => Ok(()),
        }
    }
}
