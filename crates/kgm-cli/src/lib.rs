//! KGM CLI library
//!
//! Command-line surface for the merge engine:
//!
//! - `kgm merge --config merge.yaml` runs the full merge
//! - `kgm merge --config merge.yaml --only stats` re-emits statistics
//! - `kgm merge --config merge.yaml --only chain=<name>` re-runs one chain

use clap::{Parser, Subcommand};
use kgm_engine::OnlyMode;
use std::path::PathBuf;

pub mod commands;
pub mod error;
pub mod progress;

pub use error::{CliError, Result};

#[derive(Parser)]
#[command(name = "kgm")]
#[command(
    author,
    version,
    about = "Merge KGX node/edge tables into a deduplicated knowledge graph"
)]
pub struct Cli {
    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the merge pipeline
    Merge {
        /// Path to the merge configuration YAML
        #[arg(short, long)]
        config: PathBuf,

        /// Restrict the run: 'stats' or 'chain=<name>'
        #[arg(long, value_parser = parse_only)]
        only: Option<OnlyMode>,

        /// Continue on top of spill state left by a crashed run
        #[arg(long, conflicts_with = "force_resume")]
        resume: bool,

        /// Discard spill state left by a crashed run and start over
        #[arg(long)]
        force_resume: bool,

        /// Fail after the merge if any edge references a missing node
        #[arg(long)]
        strict: bool,

        /// Worker threads for the canonicalizer pool (default: core count)
        #[arg(short, long)]
        processes: Option<usize>,
    },
}

/// Parse the `--only` restriction
fn parse_only(value: &str) -> std::result::Result<OnlyMode, String> {
    if value == "stats" {
        return Ok(OnlyMode::Stats);
    }
    if let Some(name) = value.strip_prefix("chain=") {
        if name.is_empty() {
            return Err("chain name is empty; use --only chain=<name>".to_string());
        }
        return Ok(OnlyMode::Chain(name.to_string()));
    }
    Err(format!(
        "unknown --only value '{}'; expected 'stats' or 'chain=<name>'",
        value
    ))
}
