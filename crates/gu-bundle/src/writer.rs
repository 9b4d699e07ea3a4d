//! Dump writer.

use crate::{DumpEntry, DumpError, DumpManifest, EntryKind, Result, MANIFEST_ENTRY};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Cursor, Seek, Write};
use std::path::{Component, Path};
use tracing::{debug, info};
use zip::write::{FileOptions, ZipWriter};
use zip::CompressionMethod;

/// Collects entries in memory, then writes the archive in one pass.
pub struct DumpWriter {
    manifest: DumpManifest,
    entries: BTreeMap<String, (EntryKind, Vec<u8>)>,
}

impl DumpWriter {
    pub fn new(target_id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            manifest: DumpManifest::new(target_id, host),
            entries: BTreeMap::new(),
        }
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.manifest.session_id = Some(session_id.into());
        self
    }

    pub fn updater_version(mut self, version: impl Into<String>) -> Self {
        self.manifest.updater_version = Some(version.into());
        self
    }

    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.manifest.summary = Some(summary.into());
        self
    }

    pub fn session<T: Serialize>(&mut self, session: &T) -> Result<()> {
        self.json("session.json", EntryKind::Session, session)
    }

    pub fn exit<T: Serialize>(&mut self, reason: &T) -> Result<()> {
        self.json("exit.json", EntryKind::Exit, reason)
    }

    pub fn journal<T: Serialize>(&mut self, snapshot: &T) -> Result<()> {
        self.json("journal.json", EntryKind::Journal, snapshot)
    }

    /// Captured output stream, stored as `logs/<stream>.log`.
    pub fn log(&mut self, stream: &str, data: Vec<u8>) -> Result<()> {
        self.put(format!("logs/{}.log", stream), EntryKind::Log, data)
    }

    /// Free-form entry; its kind follows from the name.
    pub fn note(&mut self, name: impl Into<String>, data: Vec<u8>) -> Result<()> {
        let name = name.into();
        let kind = EntryKind::for_name(&name);
        self.put(name, kind, data)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn json<T: Serialize>(&mut self, name: &str, kind: EntryKind, value: &T) -> Result<()> {
        self.put(name.to_string(), kind, serde_json::to_vec_pretty(value)?)
    }

    fn put(&mut self, name: String, kind: EntryKind, data: Vec<u8>) -> Result<()> {
        if !entry_name_allowed(&name) {
            return Err(DumpError::EntryName(name));
        }
        debug!(entry = %name, bytes = data.len(), "dump entry staged");
        self.entries.insert(name, (kind, data));
        Ok(())
    }

    /// Write the dump to `path`.
    ///
    /// The archive goes to a sibling temp file first and is renamed into
    /// place, so `path` never names a partial dump.
    pub fn write(self, path: &Path) -> Result<DumpManifest> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dump.zip".to_string());
        let partial = path.with_file_name(format!(".{}.partial-{}", name, std::process::id()));

        let result = File::create(&partial)
            .map_err(DumpError::from)
            .and_then(|file| self.encode(file))
            .and_then(|(file, manifest)| {
                file.sync_all()?;
                std::fs::rename(&partial, path)?;
                Ok(manifest)
            });
        if result.is_err() {
            let _ = std::fs::remove_file(&partial);
        }
        let manifest = result?;

        info!(
            path = %path.display(),
            entries = manifest.entries.len(),
            bytes = manifest.payload_len(),
            "crash dump written"
        );
        Ok(manifest)
    }

    /// Encode the dump in memory.
    pub fn to_bytes(self) -> Result<(Vec<u8>, DumpManifest)> {
        let (cursor, manifest) = self.encode(Cursor::new(Vec::new()))?;
        Ok((cursor.into_inner(), manifest))
    }

    fn encode<W: Write + Seek>(self, sink: W) -> Result<(W, DumpManifest)> {
        if self.entries.is_empty() {
            return Err(DumpError::Empty);
        }
        let mut manifest = self.manifest;
        manifest.entries = self
            .entries
            .iter()
            .map(|(name, (kind, data))| DumpEntry::describe(name.clone(), *kind, data))
            .collect();

        let options: FileOptions<'_, ()> = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(0o600);
        let mut zip = ZipWriter::new(sink);
        zip.start_file(MANIFEST_ENTRY, options)?;
        zip.write_all(&serde_json::to_vec_pretty(&manifest)?)?;
        for (name, (_, data)) in &self.entries {
            zip.start_file(name.as_str(), options)?;
            zip.write_all(data)?;
        }
        Ok((zip.finish()?, manifest))
    }
}

fn entry_name_allowed(name: &str) -> bool {
    !name.is_empty()
        && name != MANIFEST_ENTRY
        && !name.contains('\\')
        && Path::new(name)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}
