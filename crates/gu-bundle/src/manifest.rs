//! Dump manifest.

use crate::{DumpError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Layout version written into every manifest.
pub const DUMP_FORMAT: u32 = 1;

pub const MANIFEST_ENTRY: &str = "manifest.json";

/// What an entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Session,
    Exit,
    Journal,
    Log,
    Note,
}

impl EntryKind {
    /// Kind implied by a conventional entry name.
    pub fn for_name(name: &str) -> Self {
        match name {
            "session.json" => EntryKind::Session,
            "exit.json" => EntryKind::Exit,
            "journal.json" => EntryKind::Journal,
            n if n.starts_with("logs/") => EntryKind::Log,
            _ => EntryKind::Note,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpEntry {
    pub name: String,
    pub kind: EntryKind,
    pub sha256: String,
    pub len: u64,
}

impl DumpEntry {
    pub fn describe(name: impl Into<String>, kind: EntryKind, data: &[u8]) -> Self {
        Self {
            name: name.into(),
            kind,
            sha256: sha256_hex(data),
            len: data.len() as u64,
        }
    }

    pub fn matches(&self, data: &[u8]) -> bool {
        data.len() as u64 == self.len && sha256_hex(data) == self.sha256
    }
}

/// Header of a crash dump: who crashed, where, and what is inside.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpManifest {
    pub format: u32,
    pub written_at: DateTime<Utc>,
    pub host: String,
    pub target_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updater_version: Option<String>,
    /// One line describing the failure, e.g. `editor-1a2b3c4d: killed by signal 11`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub entries: Vec<DumpEntry>,
}

impl DumpManifest {
    pub fn new(target_id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            format: DUMP_FORMAT,
            written_at: Utc::now(),
            host: host.into(),
            target_id: target_id.into(),
            session_id: None,
            updater_version: None,
            summary: None,
            entries: Vec::new(),
        }
    }

    pub fn entry(&self, name: &str) -> Option<&DumpEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn entries_of(&self, kind: EntryKind) -> impl Iterator<Item = &DumpEntry> {
        self.entries.iter().filter(move |e| e.kind == kind)
    }

    pub fn payload_len(&self) -> u64 {
        self.entries.iter().map(|e| e.len).sum()
    }

    /// Reject manifests this build cannot trust.
    pub fn check(&self) -> Result<()> {
        if self.format != DUMP_FORMAT {
            return Err(DumpError::UnknownFormat {
                found: self.format,
                reads: DUMP_FORMAT,
            });
        }
        if self.target_id.trim().is_empty() {
            return Err(DumpError::BadManifest("target_id is blank".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for entry in &self.entries {
            if !seen.insert(entry.name.as_str()) {
                return Err(DumpError::BadManifest(format!(
                    "entry '{}' listed twice",
                    entry.name
                )));
            }
            let hex_ok = entry.sha256.len() == 64
                && entry.sha256.bytes().all(|b| b.is_ascii_hexdigit());
            if !hex_ok {
                return Err(DumpError::BadManifest(format!(
                    "entry '{}' has a malformed digest",
                    entry.name
                )));
            }
        }
        Ok(())
    }
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_conventional_names() {
        assert_eq!(EntryKind::for_name("exit.json"), EntryKind::Exit);
        assert_eq!(EntryKind::for_name("logs/stderr.log"), EntryKind::Log);
        assert_eq!(EntryKind::for_name("journal.error.txt"), EntryKind::Note);
    }

    #[test]
    fn test_check_rejects_blank_target() {
        assert!(matches!(
            DumpManifest::new("  ", "host").check(),
            Err(DumpError::BadManifest(_))
        ));
    }

    #[test]
    fn test_check_rejects_duplicate_and_malformed_entries() {
        let mut manifest = DumpManifest::new("editor", "host");
        manifest.entries.push(DumpEntry::describe("exit.json", EntryKind::Exit, b"{}"));
        assert!(manifest.check().is_ok());

        manifest.entries.push(DumpEntry::describe("exit.json", EntryKind::Exit, b"{}"));
        assert!(manifest.check().is_err());

        manifest.entries.pop();
        manifest.entries[0].sha256 = "z".repeat(64);
        assert!(manifest.check().is_err());
    }

    #[test]
    fn test_check_rejects_future_format() {
        let mut manifest = DumpManifest::new("editor", "host");
        manifest.format = DUMP_FORMAT + 1;
        assert!(matches!(
            manifest.check(),
            Err(DumpError::UnknownFormat { found: 2, reads: 1 })
        ));
    }

    #[test]
    fn test_entry_matches_len_and_digest() {
        let entry = DumpEntry::describe("logs/stderr.log", EntryKind::Log, b"segfault at 0x0");
        assert!(entry.matches(b"segfault at 0x0"));
        assert!(!entry.matches(b"segfault at 0x1"));
        assert_eq!(
            DumpManifest {
                entries: vec![entry],
                ..DumpManifest::new("t", "h")
            }
            .payload_len(),
            15
        );
    }
}
