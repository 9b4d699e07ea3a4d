//! Crash dump errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DumpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Entry bytes do not hash to the digest recorded in the manifest.
    #[error("entry '{entry}' digest {actual} does not match manifest digest {recorded}")]
    EntryDigest {
        entry: String,
        recorded: String,
        actual: String,
    },

    #[error("dump has no {0}")]
    NoManifest(&'static str),

    #[error("dump format {found} is not readable by this build (reads {reads})")]
    UnknownFormat { found: u32, reads: u32 },

    #[error("manifest rejected: {0}")]
    BadManifest(String),

    #[error("no entry named '{0}' in dump")]
    NoEntry(String),

    /// Absolute, backslashed, or `..` entry names; also the reserved manifest name.
    #[error("entry name '{0}' is not allowed")]
    EntryName(String),

    #[error("refusing to write a dump without entries")]
    Empty,
}

pub type Result<T> = std::result::Result<T, DumpError>;
