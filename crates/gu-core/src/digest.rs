//! Package digests (hex SHA-256).

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Hex SHA-256 of a file's contents.
pub fn compute_digest(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compare a computed digest with a published one, ignoring case and
/// surrounding whitespace.
pub fn digests_match(actual: &str, expected: &str) -> bool {
    actual.trim().eq_ignore_ascii_case(expected.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_known_digest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pkg.zip");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            compute_digest(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_match_is_case_insensitive() {
        assert!(digests_match("ABcd", " abcd\n"));
        assert!(!digests_match("abcd", "abce"));
    }

    #[test]
    fn test_missing_file() {
        assert!(compute_digest(Path::new("/nonexistent/gu/pkg.zip")).is_err());
    }
}
