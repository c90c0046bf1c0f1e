//! Checksum utilities for output verification
//!
//! The merge engine records a SHA-256 digest of every file it publishes, so
//! downstream loaders can detect truncated or corrupted artifacts.

use crate::error::{KgmError, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Compute the SHA-256 checksum of a file, hex-encoded
pub fn sha256_file(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    sha256_reader(&mut file)
}

/// Compute the SHA-256 checksum of any readable source, hex-encoded
pub fn sha256_reader<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Verify that a file matches an expected checksum
pub fn verify_file(path: impl AsRef<Path>, expected: &str) -> Result<()> {
    let path = path.as_ref();
    let actual = sha256_file(path)?;
    if actual == expected {
        Ok(())
    } else {
        Err(KgmError::ChecksumMismatch {
            file: path.display().to_string(),
            expected: expected.to_string(),
            actual,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_sha256_reader() {
        let mut cursor = Cursor::new(b"hello world");
        let checksum = sha256_reader(&mut cursor).unwrap();
        assert_eq!(
            checksum,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_verify_file_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.tsv");
        std::fs::write(&path, "id\tcategory\n").unwrap();
        let err = verify_file(&path, "deadbeef").unwrap_err();
        assert!(matches!(err, KgmError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_verify_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edges.tsv");
        std::fs::write(&path, "subject\tpredicate\tobject\n").unwrap();
        let sum = sha256_file(&path).unwrap();
        verify_file(&path, &sum).unwrap();
    }
}
