//! KGM Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the KGM workspace.
//!
//! # Overview
//!
//! This crate provides common functionality used across all KGM workspace
//! members:
//!
//! - **Error Handling**: the `KgmError` taxonomy and `Result` alias
//! - **Logging**: `tracing` initialization shared by the engine and CLI
//! - **Checksums**: SHA-256 digests of output artifacts
//! - **CURIEs**: compact-URI prefix/local helpers used by every component
//!
//! # Example
//!
//! ```no_run
//! use kgm_common::{Result, curie};
//!
//! fn classify(id: &str) -> Result<()> {
//!     if curie::prefix(id) == Some("NCBITaxon") {
//!         println!("taxon node: {}", id);
//!     }
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod curie;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{KgmError, Result};
