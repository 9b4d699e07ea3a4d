//! What an update changes on disk, derived from the staged packages.

use crate::operation::{Batch, ForwardPayload, Operation, OperationKind, UndoPayload};
use crate::platform::{BackupTarget, DriverBackup, DriverRegistrar};
use crate::source::PackageDescriptor;
use gu_common::SessionId;
use gu_config::FilterConfig;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Marker file recording the installed version.
pub const VERSION_MARKER: &str = ".general_update_version";

/// Directory inside a package holding driver files.
pub const DRIVERS_DIR: &str = "drivers";

/// A verified package unpacked into the staging area.
#[derive(Debug, Clone)]
pub struct StagedPackage {
    pub descriptor: PackageDescriptor,
    pub root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DriverInstall {
    pub name: String,
    pub source: PathBuf,
    /// Exported copy of the currently registered driver, when there is one.
    pub export_dir: Option<PathBuf>,
}

/// Merged effect of every staged package, later versions winning.
#[derive(Debug, Clone, Default)]
pub struct FilePlan {
    /// Relative install path to the staged file that replaces it.
    pub installs: BTreeMap<PathBuf, PathBuf>,
    /// Relative install paths to delete.
    pub removals: BTreeSet<PathBuf>,
    pub drivers: Vec<DriverInstall>,
}

/// Reject absolute paths and `..` so every plan entry stays in the install dir.
fn safe_relative(path: &Path) -> bool {
    !path.as_os_str().is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)))
}

impl FilePlan {
    /// Merge staged packages in ascending version order.
    ///
    /// Entries `filter` excludes are neither installed nor removed, so they
    /// are never backed up either.
    pub fn build(
        staged: &[StagedPackage],
        marker: Option<&Path>,
        drivers: Option<(&DriverRegistrar, &str)>,
        filter: &FilterConfig,
    ) -> std::io::Result<Self> {
        let mut plan = FilePlan::default();
        for package in staged {
            for rel in &package.descriptor.remove {
                let rel = PathBuf::from(rel);
                if !safe_relative(&rel) {
                    warn!(package = %package.descriptor.name, path = %rel.display(), "ignoring unsafe removal");
                    continue;
                }
                if filter.is_excluded(&rel) {
                    debug!(package = %package.descriptor.name, path = %rel.display(), "removal filtered");
                    continue;
                }
                plan.installs.remove(&rel);
                plan.removals.insert(rel);
            }
            for rel in crate::platform::fs::list_files(&package.root)? {
                if filter.is_excluded(&rel) {
                    debug!(package = %package.descriptor.name, path = %rel.display(), "file filtered");
                    continue;
                }
                if let Some((registrar, dir)) = drivers {
                    if rel.starts_with(dir) {
                        let is_driver = registrar
                            .extension()
                            .is_some_and(|ext| rel.extension().is_some_and(|e| e == ext));
                        if is_driver {
                            let source = package.root.join(&rel);
                            let name = registrar.artifact_name(&source);
                            plan.drivers.retain(|d| d.name != name);
                            plan.drivers.push(DriverInstall {
                                name,
                                source,
                                export_dir: None,
                            });
                        }
                        continue;
                    }
                }
                plan.removals.remove(&rel);
                plan.installs.insert(rel.clone(), package.root.join(&rel));
            }
        }
        if let Some(marker) = marker {
            plan.installs.insert(PathBuf::from(VERSION_MARKER), marker.to_path_buf());
        }
        Ok(plan)
    }

    pub fn is_empty(&self) -> bool {
        self.installs.is_empty() && self.removals.is_empty() && self.drivers.is_empty()
    }

    /// Live files the update will overwrite or delete that exist now.
    pub fn backup_targets(&self, install_dir: &Path, backup_root: &Path) -> Vec<BackupTarget> {
        self.installs
            .keys()
            .chain(self.removals.iter())
            .filter(|rel| install_dir.join(rel).is_file())
            .map(|rel| BackupTarget {
                artifact_id: rel.to_string_lossy().into_owned(),
                live: install_dir.join(rel),
                backup: backup_root.join("files").join(rel),
            })
            .collect()
    }

    /// Export slots for drivers already registered with the host.
    pub fn driver_backups(&mut self, registrar: &DriverRegistrar, backup_root: &Path) -> Vec<DriverBackup> {
        let mut backups = Vec::new();
        for driver in &mut self.drivers {
            match registrar.is_registered(&driver.name) {
                Ok(true) => {
                    let export_dir = backup_root.join(DRIVERS_DIR).join(&driver.name);
                    driver.export_dir = Some(export_dir.clone());
                    backups.push(DriverBackup {
                        name: driver.name.clone(),
                        export_dir,
                    });
                }
                Ok(false) => {}
                Err(e) => warn!(driver = %driver.name, error = %e, "cannot query driver; not exported"),
            }
        }
        backups
    }

    /// The apply batch: deletions, then file installs, then drivers.
    pub fn apply_batch(&self, session: &SessionId, install_dir: &Path, backup_root: &Path) -> Batch {
        let mut batch = Batch::new("apply", session.clone());
        let undo_for = |rel: &Path| {
            let live = install_dir.join(rel);
            let backup = backup_root.join("files").join(rel);
            if live.is_file() {
                UndoPayload::RestoreFile { backup, target: live }
            } else {
                UndoPayload::RemoveFile { path: live }
            }
        };

        for rel in &self.removals {
            let live = install_dir.join(rel);
            if !live.is_file() {
                continue;
            }
            batch.push(Operation::new(
                OperationKind::Delete,
                rel.to_string_lossy(),
                ForwardPayload::RemoveFile { path: live },
                undo_for(rel),
            ));
        }
        for (rel, staged) in &self.installs {
            batch.push(Operation::new(
                OperationKind::Apply,
                rel.to_string_lossy(),
                ForwardPayload::CopyFile {
                    from: staged.clone(),
                    to: install_dir.join(rel),
                },
                undo_for(rel),
            ));
        }
        for driver in &self.drivers {
            batch.push(Operation::new(
                OperationKind::Install,
                format!("driver:{}", driver.name),
                ForwardPayload::RegisterArtifact {
                    name: driver.name.clone(),
                    source: driver.source.clone(),
                },
                UndoPayload::DeregisterArtifact {
                    name: driver.name.clone(),
                    reinstall: driver.export_dir.as_ref().map(|d| d.join(&driver.name)),
                },
            ));
        }
        batch
    }
}
