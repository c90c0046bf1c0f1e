//! KGM Engine
//!
//! Streaming merge, deduplication, and chain reduction for KGX-convention
//! knowledge graphs. N sources, each a `(nodes, edges)` pair of
//! tab-separated tables, are fused into one coherent graph:
//!
//! - **Reader**: streams rows from plain, gzipped, or tarred sources,
//!   unioning columns across a source's files.
//! - **Canonicalizer**: prefix rewriting, category canonicalization, CURIE
//!   sanitization, validation.
//! - **Deduplicator**: one winner per node id and per edge
//!   `(subject, object)` pair under explicit priority rules, out-of-core
//!   via hash-partitioned spill files.
//! - **Chain reducer**: bounded-memory multi-hop joins materializing
//!   derived relations such as Taxon-to-CHEBI.
//! - **Statistics emitter**: a YAML summary of the merged graph with exact
//!   counts, diagnostics, and output checksums.
//!
//! # Example
//!
//! ```no_run
//! use kgm_engine::config::MergeConfig;
//! use kgm_engine::pipeline::{CancelFlag, MergeEngine, RunOptions};
//!
//! fn main() -> kgm_common::Result<()> {
//!     let config = MergeConfig::load("merge.yaml")?;
//!     let engine = MergeEngine::new(config);
//!     let report = engine.run(&RunOptions::default(), &CancelFlag::new())?;
//!     println!("merged {} nodes, {} edges", report.nodes_written, report.edges_written);
//!     Ok(())
//! }
//! ```

pub mod canon;
pub mod chain;
pub mod config;
pub mod dedup;
pub mod diagnostics;
pub mod model;
pub mod pipeline;
pub mod reader;
pub mod spill;
pub mod stats;
pub mod writer;

pub use config::MergeConfig;
pub use pipeline::{CancelFlag, MergeEngine, MergeReport, OnlyMode, RunOptions};
pub use spill::ResumeMode;
