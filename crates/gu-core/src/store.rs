//! Per-target durable state directory.
//!
//! Layout under the state root:
//!
//! ```text
//! <state_dir>/<target_id>/
//!     journal.json               live journal (LIFO batch stack)
//!     journal.<session>.json     archived journals
//!     flag.json                  failure flag
//!     failure.json               failure record
//!     *.lock                     advisory locks (see crate::lock)
//! ```
//!
//! All writes go through [`StateStore::write_json_atomic`]: temp file,
//! fsync, rename, then fsync of the directory.

use crate::lock::{FileLock, LockError};
use chrono::{DateTime, NaiveDateTime, Utc};
use gu_common::TargetId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

pub const JOURNAL_FILE: &str = "journal.json";
pub const FLAG_FILE: &str = "flag.json";
pub const FAILURE_FILE: &str = "failure.json";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Named per-target locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Update,
    Monitor,
    Restore,
    Flag,
}

impl LockKind {
    fn file_name(self) -> &'static str {
        match self {
            LockKind::Update => "update.lock",
            LockKind::Monitor => "monitor.lock",
            LockKind::Restore => "restore.lock",
            LockKind::Flag => "flag.lock",
        }
    }
}

/// Root of all durable updater state.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn target_dir(&self, target: &TargetId) -> PathBuf {
        self.root.join(target.as_str())
    }

    pub fn journal_path(&self, target: &TargetId) -> PathBuf {
        self.target_dir(target).join(JOURNAL_FILE)
    }

    pub fn archived_journal_path(&self, target: &TargetId, session: &str) -> PathBuf {
        self.target_dir(target).join(format!("journal.{}.json", session))
    }

    pub fn flag_path(&self, target: &TargetId) -> PathBuf {
        self.target_dir(target).join(FLAG_FILE)
    }

    pub fn failure_path(&self, target: &TargetId) -> PathBuf {
        self.target_dir(target).join(FAILURE_FILE)
    }

    pub fn lock_path(&self, target: &TargetId, kind: LockKind) -> PathBuf {
        self.target_dir(target).join(kind.file_name())
    }

    pub fn try_lock(&self, target: &TargetId, kind: LockKind) -> Result<FileLock, LockError> {
        FileLock::try_acquire(&self.lock_path(target, kind))
    }

    pub fn lock(&self, target: &TargetId, kind: LockKind) -> Result<FileLock, LockError> {
        FileLock::acquire(&self.lock_path(target, kind))
    }

    /// Targets that have a state directory.
    pub fn list_targets(&self) -> Result<Vec<TargetId>, StoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.root, e)),
        };
        let mut targets: Vec<TargetId> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|e| e.file_name().to_str().and_then(TargetId::parse))
            .collect();
        targets.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(targets)
    }

    /// Archived journals for a target, oldest first.
    pub fn archived_journals(&self, target: &TargetId) -> Result<Vec<PathBuf>, StoreError> {
        let dir = self.target_dir(target);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };
        let mut archives: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| {
                        n.starts_with("journal.") && n.ends_with(".json") && n != JOURNAL_FILE
                            && !n.contains(".tmp.")
                    })
            })
            .collect();
        sort_by_age(&mut archives, "journal.", ".json");
        Ok(archives)
    }

    /// Read a JSON document; `Ok(None)` when the file does not exist.
    pub fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, StoreError> {
        let content = match fs::read(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(path, e)),
        };
        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|source| StoreError::Json {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Durably replace `path` with the pretty JSON encoding of `value`.
    pub fn write_json_atomic<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StoreError> {
        write_json_atomic(path, value)
    }

    /// Remove a file, treating "already gone" as success.
    pub fn remove(&self, path: &Path) -> Result<(), StoreError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }
}

pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }
    let content = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("state.json");
    let tmp_path = path.with_file_name(format!(
        "{}.tmp.{}.{}",
        file_name,
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let written = (|| {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&content)?;
        file.sync_all()
    })();
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(StoreError::io(&tmp_path, e));
    }
    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(StoreError::io(path, e));
    }
    if let Some(parent) = parent {
        sync_dir(parent);
    }
    Ok(())
}

/// Flush the directory entry so the rename itself survives power loss.
#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

/// Sort oldest first by the timestamp embedded in each name
/// (`gu-YYYYMMDD-HHMMSS-xxxx` or `unscoped-YYYYMMDD-HHMMSS-mmm`, after
/// stripping `prefix` and `suffix`). Names without one fall back to their
/// modification time.
pub fn sort_by_age(paths: &mut [PathBuf], prefix: &str, suffix: &str) {
    paths.sort_by_cached_key(|path| {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let stem = name
            .strip_prefix(prefix)
            .and_then(|n| n.strip_suffix(suffix))
            .unwrap_or(name);
        let at = name_timestamp(stem)
            .or_else(|| modified_at(path))
            .unwrap_or(NaiveDateTime::MIN);
        (at, name.to_string())
    });
}

fn name_timestamp(stem: &str) -> Option<NaiveDateTime> {
    let rest = stem
        .strip_prefix("gu-")
        .or_else(|| stem.strip_prefix("unscoped-"))?;
    NaiveDateTime::parse_from_str(rest.get(..15)?, "%Y%m%d-%H%M%S").ok()
}

fn modified_at(path: &Path) -> Option<NaiveDateTime> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    Some(DateTime::<Utc>::from(modified).naive_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Doc {
        n: u32,
    }

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let target = TargetId::from_name("editor");
        let path = store.flag_path(&target);

        assert_eq!(store.read_json::<Doc>(&path).unwrap(), None);
        store.write_json_atomic(&path, &Doc { n: 7 }).unwrap();
        assert_eq!(store.read_json::<Doc>(&path).unwrap(), Some(Doc { n: 7 }));

        let leftovers = fs::read_dir(store.target_dir(&target))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_failed_rename_keeps_previous_content() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let path = dir.path().join("doc.json");
        store.write_json_atomic(&path, &Doc { n: 1 }).unwrap();

        // A non-empty directory at the destination makes the rename fail.
        let blocked = dir.path().join("blocked.json");
        fs::create_dir_all(blocked.join("inner")).unwrap();
        assert!(store.write_json_atomic(&blocked, &Doc { n: 2 }).is_err());
        assert_eq!(store.read_json::<Doc>(&path).unwrap(), Some(Doc { n: 1 }));
    }

    #[test]
    fn test_invalid_json_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let path = dir.path().join("bad.json");
        fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            store.read_json::<Doc>(&path),
            Err(StoreError::Json { .. })
        ));
    }

    #[test]
    fn test_list_targets_and_archives() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        assert!(store.list_targets().unwrap().is_empty());

        let a = TargetId::from_name("alpha");
        let b = TargetId::from_name("beta");
        fs::create_dir_all(store.target_dir(&b)).unwrap();
        fs::create_dir_all(store.target_dir(&a)).unwrap();
        fs::create_dir_all(dir.path().join(".hidden")).unwrap();
        assert_eq!(store.list_targets().unwrap(), vec![a.clone(), b]);

        let older = store.archived_journal_path(&a, "gu-20260101-000000-aaaa");
        let newer = store.archived_journal_path(&a, "gu-20260201-000000-bbbb");
        store.write_json_atomic(&newer, &Doc { n: 2 }).unwrap();
        store.write_json_atomic(&older, &Doc { n: 1 }).unwrap();
        store.write_json_atomic(&store.journal_path(&a), &Doc { n: 3 }).unwrap();
        assert_eq!(store.archived_journals(&a).unwrap(), vec![older, newer]);
    }

    #[test]
    fn test_archives_order_by_embedded_time_across_kinds() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let t = TargetId::from_name("alpha");

        // Lexically "unscoped-" sorts after "gu-" whatever the dates.
        let oldest = store.archived_journal_path(&t, "unscoped-20250101-000000-000");
        let middle = store.archived_journal_path(&t, "gu-20260101-000000-zzzz");
        let newest = store.archived_journal_path(&t, "unscoped-20270101-000000-000");
        for path in [&newest, &oldest, &middle] {
            store.write_json_atomic(path, &Doc { n: 1 }).unwrap();
        }
        assert_eq!(store.archived_journals(&t).unwrap(), vec![oldest, middle, newest]);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let path = dir.path().join("failure.json");
        fs::write(&path, b"{}").unwrap();
        store.remove(&path).unwrap();
        store.remove(&path).unwrap();
        assert!(!path.exists());
    }
}
