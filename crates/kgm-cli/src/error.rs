//! Error types for the KGM CLI

use kgm_common::KgmError;
use thiserror::Error;

/// Result type alias for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

/// Error type for CLI operations
#[derive(Error, Debug)]
pub enum CliError {
    /// Engine-level failure
    #[error(transparent)]
    Engine(#[from] KgmError),

    /// I/O errors raised directly by the CLI layer
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code for this error.
    ///
    /// 1 fatal I/O or configuration, 2 cancelled, 3 disk space exhausted.
    /// Partial success (4) is not an error and is decided from the report.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Engine(KgmError::Cancelled) => 2,
            CliError::Engine(e) if e.is_disk_full() => 3,
            _ => 1,
        }
    }
}
