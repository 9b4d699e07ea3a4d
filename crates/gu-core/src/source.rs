//! Package sources: version metadata plus package byte streams.
//!
//! Both sources serve the same `versions.json` document:
//!
//! ```json
//! {"versions": [{"name": "editor", "version": "1.5.0",
//!                "digest": "<hex sha256>", "url": "editor-1.5.0.zip",
//!                "size": 1048576, "remove": ["plugins/old.so"]}]}
//! ```
//!
//! Relative package URLs resolve against the metadata location.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const METADATA_FILE: &str = "versions.json";
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum SourceError {
    /// Worth retrying: connection reset, timeout, 5xx.
    #[error("transient source error: {0}")]
    Transient(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Transient(_) => true,
            SourceError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// One published package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDescriptor {
    pub name: String,
    pub version: String,
    pub digest: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Install-relative paths the new version no longer ships.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,
}

impl PackageDescriptor {
    /// File name used for the downloaded package in the staging area.
    pub fn file_name(&self) -> String {
        let safe: String = format!("{}-{}", self.name, self.version)
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
            .collect();
        format!("{}.zip", safe)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionManifest {
    #[serde(default)]
    pub versions: Vec<PackageDescriptor>,
}

impl VersionManifest {
    pub fn from_json(json: &str) -> Result<Self, SourceError> {
        serde_json::from_str(json).map_err(|e| SourceError::InvalidMetadata(e.to_string()))
    }
}

/// Packages newer than `current`, oldest first.
pub fn pending_updates(descriptors: &[PackageDescriptor], current: &str) -> Vec<PackageDescriptor> {
    let mut newer: Vec<PackageDescriptor> = descriptors
        .iter()
        .filter(|d| compare_versions(&d.version, current) == Ordering::Greater)
        .cloned()
        .collect();
    newer.sort_by(|a, b| compare_versions(&a.version, &b.version));
    newer.dedup_by(|a, b| a.version == b.version);
    newer
}

/// Dotted version comparison; numeric components compare numerically.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let split = |v: &str| -> Vec<String> {
        v.trim()
            .trim_start_matches('v')
            .split(['.', '-', '+'])
            .map(str::to_string)
            .collect()
    };
    let (pa, pb) = (split(a), split(b));
    for i in 0..pa.len().max(pb.len()) {
        let x = pa.get(i).map(String::as_str).unwrap_or("0");
        let y = pb.get(i).map(String::as_str).unwrap_or("0");
        let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
            (Ok(nx), Ok(ny)) => nx.cmp(&ny),
            _ => x.cmp(y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Transport-agnostic package source.
pub trait PackageSource: Send + Sync {
    fn fetch_metadata(&self) -> Result<Vec<PackageDescriptor>, SourceError>;

    /// Stream the package at `url` into `sink`; `progress(bytes_read, total)`
    /// is called after each chunk. Returns the byte count.
    fn fetch_package(
        &self,
        url: &str,
        sink: &mut dyn Write,
        progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<u64, SourceError>;
}

fn copy_with_progress(
    reader: &mut dyn Read,
    sink: &mut dyn Write,
    total: Option<u64>,
    progress: &mut dyn FnMut(u64, Option<u64>),
) -> Result<u64, SourceError> {
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut read_total = 0u64;
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        sink.write_all(&buffer[..n])?;
        read_total += n as u64;
        progress(read_total, total);
    }
    sink.flush()?;
    Ok(read_total)
}

/// Local or mounted directory holding `versions.json` and the packages.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, url: &str) -> PathBuf {
        let url = url.strip_prefix("file://").unwrap_or(url);
        let path = Path::new(url);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

impl PackageSource for DirectorySource {
    fn fetch_metadata(&self) -> Result<Vec<PackageDescriptor>, SourceError> {
        let path = self.root.join(METADATA_FILE);
        let json = match std::fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SourceError::NotFound(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(VersionManifest::from_json(&json)?.versions)
    }

    fn fetch_package(
        &self,
        url: &str,
        sink: &mut dyn Write,
        progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<u64, SourceError> {
        let path = self.resolve(url);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SourceError::NotFound(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let total = file.metadata().ok().map(|m| m.len());
        copy_with_progress(&mut file, sink, total, progress)
    }
}

/// HTTP(S) source backed by `ureq`.
pub struct HttpSource {
    metadata_url: String,
    agent: ureq::Agent,
}

impl HttpSource {
    pub fn new(metadata_url: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            metadata_url: metadata_url.into(),
            agent,
        }
    }

    fn resolve(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            return url.to_string();
        }
        match self.metadata_url.rfind('/') {
            Some(idx) => format!("{}/{}", &self.metadata_url[..idx], url.trim_start_matches('/')),
            None => url.to_string(),
        }
    }

    fn get(&self, url: &str) -> Result<ureq::Response, SourceError> {
        match self.agent.get(url).call() {
            Ok(response) => Ok(response),
            Err(ureq::Error::Status(code, _)) if code == 404 || code == 410 => {
                Err(SourceError::NotFound(url.to_string()))
            }
            Err(ureq::Error::Status(code, _)) if code >= 500 || code == 408 || code == 429 => {
                Err(SourceError::Transient(format!("{} returned {}", url, code)))
            }
            Err(ureq::Error::Status(code, _)) => Err(SourceError::InvalidMetadata(format!(
                "{} returned {}",
                url, code
            ))),
            Err(ureq::Error::Transport(t)) => Err(SourceError::Transient(t.to_string())),
        }
    }
}

impl PackageSource for HttpSource {
    fn fetch_metadata(&self) -> Result<Vec<PackageDescriptor>, SourceError> {
        let body = self.get(&self.metadata_url)?.into_string()?;
        Ok(VersionManifest::from_json(&body)?.versions)
    }

    fn fetch_package(
        &self,
        url: &str,
        sink: &mut dyn Write,
        progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<u64, SourceError> {
        let response = self.get(&self.resolve(url))?;
        let total = response
            .header("Content-Length")
            .and_then(|v| v.parse::<u64>().ok());
        let mut reader = response.into_reader();
        copy_with_progress(&mut reader, sink, total, progress)
    }
}

/// Build the source named by the configuration.
pub fn from_config(config: &gu_config::SourceConfig) -> Box<dyn PackageSource> {
    match config {
        gu_config::SourceConfig::Directory { path } => Box::new(DirectorySource::new(path.clone())),
        gu_config::SourceConfig::Http {
            metadata_url,
            timeout_secs,
        } => Box::new(HttpSource::new(
            metadata_url.clone(),
            Duration::from_secs(*timeout_secs),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn descriptor(version: &str) -> PackageDescriptor {
        PackageDescriptor {
            name: "editor".into(),
            version: version.into(),
            digest: "00".into(),
            url: format!("editor-{}.zip", version),
            size: None,
            remove: Vec::new(),
        }
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("1.10.0", "1.9.3"), Ordering::Greater);
        assert_eq!(compare_versions("v2.0", "2.0.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.0.0", "1.0.1"), Ordering::Less);
    }

    #[test]
    fn test_pending_updates_sorted_and_filtered() {
        let all = vec![descriptor("1.2.0"), descriptor("1.0.0"), descriptor("1.1.0")];
        let pending = pending_updates(&all, "1.0.0");
        let versions: Vec<_> = pending.iter().map(|d| d.version.as_str()).collect();
        assert_eq!(versions, vec!["1.1.0", "1.2.0"]);
        assert!(pending_updates(&all, "1.2.0").is_empty());
    }

    #[test]
    fn test_directory_source_roundtrip() {
        let dir = TempDir::new().unwrap();
        let manifest = VersionManifest {
            versions: vec![descriptor("1.1.0")],
        };
        std::fs::write(
            dir.path().join(METADATA_FILE),
            serde_json::to_string(&manifest).unwrap(),
        )
        .unwrap();
        std::fs::write(dir.path().join("editor-1.1.0.zip"), vec![7u8; 100_000]).unwrap();

        let source = DirectorySource::new(dir.path());
        let versions = source.fetch_metadata().unwrap();
        assert_eq!(versions.len(), 1);

        let mut sink = Vec::new();
        let mut calls = Vec::new();
        let n = source
            .fetch_package(&versions[0].url, &mut sink, &mut |read, total| {
                calls.push((read, total))
            })
            .unwrap();
        assert_eq!(n, 100_000);
        assert_eq!(sink.len(), 100_000);
        assert_eq!(calls.last(), Some(&(100_000, Some(100_000))));
        assert!(calls.len() >= 2);
    }

    #[test]
    fn test_from_config_directory_reads_manifest() {
        let dir = TempDir::new().unwrap();
        let manifest = VersionManifest {
            versions: vec![descriptor("1.3.0")],
        };
        std::fs::write(
            dir.path().join(METADATA_FILE),
            serde_json::to_vec(&manifest).unwrap(),
        )
        .unwrap();

        let source = from_config(&gu_config::SourceConfig::Directory {
            path: dir.path().to_path_buf(),
        });
        let versions = source.fetch_metadata().unwrap();
        assert_eq!(versions[0].version, "1.3.0");
    }

    #[test]
    fn test_directory_source_missing_package() {
        let dir = TempDir::new().unwrap();
        let source = DirectorySource::new(dir.path());
        let err = source.fetch_package("nope.zip", &mut Vec::new(), &mut |_, _| {}).unwrap_err();
        assert!(matches!(err, SourceError::NotFound(_)));
        assert!(!err.is_transient());
        assert!(matches!(source.fetch_metadata(), Err(SourceError::NotFound(_))));
    }

    #[test]
    fn test_http_relative_url_resolution() {
        let source = HttpSource::new("https://updates.example.com/editor/versions.json", Duration::from_secs(5));
        assert_eq!(
            source.resolve("editor-1.1.0.zip"),
            "https://updates.example.com/editor/editor-1.1.0.zip"
        );
        assert_eq!(source.resolve("http://cdn/x.zip"), "http://cdn/x.zip");
    }

    #[test]
    fn test_descriptor_file_name_is_safe() {
        let mut d = descriptor("1.0/../../x");
        d.name = "my app".into();
        assert_eq!(d.file_name(), "my_app-1.0_.._.._x.zip");
    }
}
