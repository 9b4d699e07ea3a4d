//! Dump reader. Every entry read is checked against the manifest.

use crate::{DumpError, DumpManifest, Result, MANIFEST_ENTRY};
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::{Cursor, Read, Seek};
use std::path::Path;
use tracing::{debug, warn};
use zip::ZipArchive;

pub struct DumpReader<R: Read + Seek> {
    manifest: DumpManifest,
    archive: ZipArchive<R>,
}

impl DumpReader<File> {
    pub fn open(path: &Path) -> Result<Self> {
        Self::new(File::open(path)?)
    }
}

impl DumpReader<Cursor<Vec<u8>>> {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Self::new(Cursor::new(bytes))
    }
}

impl<R: Read + Seek> DumpReader<R> {
    pub fn new(source: R) -> Result<Self> {
        let mut archive = ZipArchive::new(source)?;
        let manifest: DumpManifest = {
            let file = archive
                .by_name(MANIFEST_ENTRY)
                .map_err(|_| DumpError::NoManifest(MANIFEST_ENTRY))?;
            serde_json::from_reader(file)?
        };
        manifest.check()?;
        debug!(
            target_id = %manifest.target_id,
            entries = manifest.entries.len(),
            "crash dump opened"
        );
        Ok(Self { manifest, archive })
    }

    pub fn manifest(&self) -> &DumpManifest {
        &self.manifest
    }

    pub fn target_id(&self) -> &str {
        &self.manifest.target_id
    }

    /// Bytes of `name`, refused when they do not match the manifest.
    pub fn entry(&mut self, name: &str) -> Result<Vec<u8>> {
        let recorded = self
            .manifest
            .entry(name)
            .cloned()
            .ok_or_else(|| DumpError::NoEntry(name.to_string()))?;
        let mut data = Vec::new();
        self.archive
            .by_name(name)
            .map_err(|_| DumpError::NoEntry(name.to_string()))?
            .read_to_end(&mut data)?;
        if !recorded.matches(&data) {
            return Err(DumpError::EntryDigest {
                entry: name.to_string(),
                recorded: recorded.sha256,
                actual: crate::manifest::sha256_hex(&data),
            });
        }
        Ok(data)
    }

    pub fn json<T: DeserializeOwned>(&mut self, name: &str) -> Result<T> {
        Ok(serde_json::from_slice(&self.entry(name)?)?)
    }

    /// Names of entries that are missing or fail their digest.
    pub fn damaged(&mut self) -> Vec<String> {
        let names: Vec<String> = self.manifest.entries.iter().map(|e| e.name.clone()).collect();
        names
            .into_iter()
            .filter(|name| match self.entry(name) {
                Ok(_) => false,
                Err(e) => {
                    warn!(entry = %name, error = %e, "dump entry damaged");
                    true
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DumpWriter, EntryKind};

    fn sample() -> Vec<u8> {
        let mut dump = DumpWriter::new("editor-1a2b3c4d", "host-abc").session_id("gu-20260115-143022-a7xq");
        dump.exit(&serde_json::json!({"kind": "signaled", "signal": 11})).unwrap();
        dump.log("stdout", b"starting\n".to_vec()).unwrap();
        dump.to_bytes().unwrap().0
    }

    #[test]
    fn test_json_entry() {
        let mut reader = DumpReader::from_bytes(sample()).unwrap();
        assert_eq!(reader.target_id(), "editor-1a2b3c4d");
        let exit: serde_json::Value = reader.json("exit.json").unwrap();
        assert_eq!(exit["signal"], 11);
        assert_eq!(reader.manifest().entries_of(EntryKind::Log).count(), 1);
    }

    #[test]
    fn test_intact_dump_has_no_damage() {
        assert!(DumpReader::from_bytes(sample()).unwrap().damaged().is_empty());
    }

    #[test]
    fn test_unknown_entry() {
        let mut reader = DumpReader::from_bytes(sample()).unwrap();
        assert!(matches!(reader.entry("journal.json"), Err(DumpError::NoEntry(_))));
    }

    #[test]
    fn test_not_a_zip() {
        assert!(matches!(
            DumpReader::from_bytes(b"not a zip".to_vec()),
            Err(DumpError::Archive(_))
        ));
    }
}
