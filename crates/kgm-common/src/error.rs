//! Error types for KGM
//!
//! This module provides user-facing error types with actionable messages.
//! Row-level problems are not errors: they travel through the diagnostic
//! sink and are summarized in the statistics document.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for KGM operations
pub type Result<T> = std::result::Result<T, KgmError>;

/// Main error type for KGM
///
/// All errors carry enough context to name the offending file (and line,
/// where one exists), so the last log line of a failed run is diagnosable
/// on its own.
#[derive(Error, Debug)]
pub enum KgmError {
    /// File system operations failed (read, write, create directory, etc.)
    #[error("File operation failed: {0}")]
    Io(#[from] std::io::Error),

    /// YAML configuration or statistics serialization failed
    #[error("Failed to process YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration is missing or invalid
    #[error("Configuration error: {message}. {suggestion}")]
    Config { message: String, suggestion: String },

    /// A source's header is missing a required column; the source is refused
    #[error("Source '{source}' refused: {path} is missing required column '{column}'")]
    SchemaViolation {
        source: String,
        path: PathBuf,
        column: String,
    },

    /// A source could not be read at all; the source is refused
    #[error("Source '{source}' refused: {reason}")]
    SourceRefused { source: String, reason: String },

    /// The spill directory holds partitions from a previous crashed run
    #[error(
        "Spill directory '{dir}' contains partitions from an earlier run. \
         Pass --resume to continue it or --force-resume to discard it."
    )]
    SpillDirBusy { dir: PathBuf },

    /// No space left while writing spill or output files
    #[error("Disk space exhausted while writing '{path}'")]
    DiskFull { path: PathBuf },

    /// The run was cancelled cooperatively
    #[error("Run cancelled")]
    Cancelled,

    /// Strict mode: edges reference node ids absent from the merged output
    #[error("{count} dangling edge reference(s) found in strict mode; first: {first}")]
    DanglingReferences { count: u64, first: String },

    /// Output checksum does not match the recorded value
    #[error("Checksum mismatch for '{file}': expected '{expected}', got '{actual}'")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    /// Unexpected error with details
    #[error("Unexpected error: {0}")]
    Other(#[from] anyhow::Error),
}

impl KgmError {
    /// Create a configuration error with a suggestion
    pub fn config(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a schema violation error for a refused source
    pub fn schema(
        source: impl Into<String>,
        path: impl Into<PathBuf>,
        column: impl Into<String>,
    ) -> Self {
        Self::SchemaViolation {
            source: source.into(),
            path: path.into(),
            column: column.into(),
        }
    }

    /// Create a source-refused error
    pub fn source_refused(source: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SourceRefused {
            source: source.into(),
            reason: reason.into(),
        }
    }

    /// Map an I/O error on `path`, promoting ENOSPC to `DiskFull`
    pub fn write_error(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        // POSIX ENOSPC; io::ErrorKind::StorageFull is not stable yet.
        const ENOSPC: i32 = 28;
        if err.raw_os_error() == Some(ENOSPC) {
            Self::DiskFull { path: path.into() }
        } else {
            Self::Io(err)
        }
    }

    /// True when the error maps to exit code 3 (disk space exhausted)
    pub fn is_disk_full(&self) -> bool {
        matches!(self, Self::DiskFull { .. })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_message() {
        let err = KgmError::config("no sources defined", "add at least one entry under 'sources'");
        let msg = err.to_string();
        assert!(msg.contains("no sources defined"));
        assert!(msg.contains("add at least one entry"));
    }

    #[test]
    fn test_schema_error_names_column() {
        let err = KgmError::schema("uniprot", "/tmp/nodes.tsv", "category");
        assert!(err.to_string().contains("category"));
        assert!(err.to_string().contains("uniprot"));
    }

    #[test]
    fn test_enospc_maps_to_disk_full() {
        let io = std::io::Error::from_raw_os_error(28);
        let err = KgmError::write_error(io, "/tmp/spill/part-0001.jsonl");
        assert!(err.is_disk_full());
    }

    #[test]
    fn test_other_io_stays_io() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = KgmError::write_error(io, "/tmp/out.tsv");
        assert!(!err.is_disk_full());
    }
}
