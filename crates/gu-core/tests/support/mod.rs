//! Shared fixtures for gu-core integration tests.
//!
//! Not every test binary uses every helper.
#![allow(dead_code)]

use gu_config::{FetchConfig, PathsConfig, SourceConfig, UpdaterConfig};
use gu_core::executor::{InterpretError, OperationInterpreter};
use gu_core::operation::{ForwardPayload, Operation, OperationKind, UndoPayload};
use gu_core::source::{PackageDescriptor, VersionManifest, METADATA_FILE};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;
use zip::write::{FileOptions, ZipWriter};

/// One isolated installation: install dir, state, staging, backups, and a
/// directory package source, all under a temp root.
pub struct Fixture {
    pub root: TempDir,
    published: Vec<PackageDescriptor>,
}

impl Fixture {
    pub fn new() -> Self {
        let root = TempDir::new().expect("temp dir");
        for dir in ["install", "state", "staging", "backup", "diagnostics", "updates"] {
            fs::create_dir_all(root.path().join(dir)).expect("fixture dir");
        }
        Self {
            root,
            published: Vec::new(),
        }
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.path().join(rel)
    }

    pub fn install_dir(&self) -> PathBuf {
        self.path("install")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.path("state")
    }

    pub fn config(&self) -> UpdaterConfig {
        let mut config = UpdaterConfig::default();
        config.app.name = "editor".to_string();
        config.app.main_executable = "app.sh".to_string();
        config.app.current_version = "1.0.0".to_string();
        config.paths = PathsConfig {
            install_dir: self.install_dir(),
            state_dir: Some(self.state_dir()),
            staging_dir: Some(self.path("staging")),
            backup_dir: Some(self.path("backup")),
            diagnostics_dir: Some(self.path("diagnostics")),
        };
        config.source = SourceConfig::Directory {
            path: self.path("updates"),
        };
        config.fetch = FetchConfig {
            workers: 2,
            max_retries: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        };
        config.watchdog.poll_interval_ms = 20;
        config.watchdog.startup_timeout_secs = 5;
        config
    }

    /// Write `updater.json` under the fixture root and return its path.
    pub fn write_config(&self) -> PathBuf {
        let path = self.path("updater.json");
        fs::write(
            &path,
            serde_json::to_vec_pretty(&self.config()).expect("config json"),
        )
        .expect("write config");
        path
    }

    /// Write a live file into the install directory.
    pub fn install(&self, rel: &str, content: &[u8]) {
        let path = self.install_dir().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("install parent");
        }
        fs::write(path, content).expect("install file");
    }

    pub fn read_installed(&self, rel: &str) -> Vec<u8> {
        fs::read(self.install_dir().join(rel)).expect("installed file")
    }

    /// Publish a package and rewrite `versions.json`.
    ///
    /// With `tamper`, the published digest does not match the bytes.
    pub fn publish(&mut self, version: &str, entries: &[(&str, &[u8], u32)], tamper: bool) {
        let file_name = format!("editor-{}.zip", version);
        let path = self.path("updates").join(&file_name);
        write_zip(&path, entries);
        let mut digest = sha256_file(&path);
        if tamper {
            digest = "0".repeat(64);
        }
        self.published.push(PackageDescriptor {
            name: "editor".to_string(),
            version: version.to_string(),
            digest,
            url: file_name,
            size: fs::metadata(&path).ok().map(|m| m.len()),
            remove: Vec::new(),
        });
        let manifest = VersionManifest {
            versions: self.published.clone(),
        };
        fs::write(
            self.path("updates").join(METADATA_FILE),
            serde_json::to_vec_pretty(&manifest).expect("manifest json"),
        )
        .expect("write manifest");
    }
}

/// Write a zip whose entries carry the given unix modes.
pub fn write_zip(path: &Path, entries: &[(&str, &[u8], u32)]) {
    let mut zip = ZipWriter::new(File::create(path).expect("zip file"));
    for (name, data, mode) in entries {
        let options: FileOptions<'_, ()> = FileOptions::default().unix_permissions(*mode);
        zip.start_file(*name, options).expect("zip entry");
        zip.write_all(data).expect("zip data");
    }
    zip.finish().expect("zip finish");
}

pub fn sha256_file(path: &Path) -> String {
    let bytes = fs::read(path).expect("read for digest");
    hex::encode(Sha256::digest(&bytes))
}

/// Operation whose undo is labelled by `name`.
pub fn labelled_op(name: &str) -> Operation {
    Operation::new(
        OperationKind::Apply,
        name,
        ForwardPayload::RemoveFile { path: name.into() },
        UndoPayload::RemoveFile { path: name.into() },
    )
}

/// Records `fwd:<artifact>` / `undo:<path>` calls and the highest number of
/// undo calls seen running at once.
#[derive(Default)]
pub struct TracingInterpreter {
    calls: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    undo_delay: Duration,
}

impl TracingInterpreter {
    pub fn with_undo_delay(delay: Duration) -> Self {
        Self {
            undo_delay: delay,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn undo_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with("undo:"))
            .collect()
    }

    pub fn max_concurrent_undo(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn record(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

impl OperationInterpreter for TracingInterpreter {
    fn forward(&self, op: &Operation) -> Result<(), InterpretError> {
        self.record(format!("fwd:{}", op.artifact_id));
        Ok(())
    }

    fn undo(&self, undo: &UndoPayload) -> Result<(), InterpretError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let label = match undo {
            UndoPayload::RemoveFile { path } => path.to_string_lossy().into_owned(),
            UndoPayload::RestoreFile { target, .. } => target.to_string_lossy().into_owned(),
            UndoPayload::DeregisterArtifact { name, .. } => name.clone(),
            UndoPayload::Noop => "noop".to_string(),
        };
        self.record(format!("undo:{}", label));
        if !self.undo_delay.is_zero() {
            std::thread::sleep(self.undo_delay);
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}
