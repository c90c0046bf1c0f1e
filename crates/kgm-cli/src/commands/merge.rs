//! `kgm merge` command implementation

use colored::Colorize;
use kgm_engine::{CancelFlag, MergeConfig, MergeEngine, MergeReport, OnlyMode, ResumeMode, RunOptions};
use std::path::Path;
use tracing::info;

use crate::error::Result;
use crate::progress::{create_spinner, format_count};

/// Run the merge and print a user-facing summary.
///
/// Returns the report so `main` can decide the exit code (partial success
/// is code 4, not an error).
pub fn run(
    config_path: &Path,
    only: Option<OnlyMode>,
    resume: bool,
    force_resume: bool,
    strict: bool,
    processes: Option<usize>,
) -> Result<MergeReport> {
    let config = MergeConfig::load(config_path)?;
    info!(config = %config_path.display(), "configuration loaded");

    let options = RunOptions {
        only: only.clone(),
        resume: if force_resume {
            ResumeMode::ForceResume
        } else if resume {
            ResumeMode::Resume
        } else {
            ResumeMode::Refuse
        },
        strict,
        processes,
    };

    let phase = match &only {
        None => "Merging sources",
        Some(OnlyMode::Stats) => "Recomputing statistics",
        Some(OnlyMode::Chain(_)) => "Evaluating chain",
    };
    let spinner = create_spinner(phase);
    let engine = MergeEngine::new(config);
    let result = engine.run(&options, &CancelFlag::new());
    spinner.finish_and_clear();

    let report = result?;
    print_summary(&report, &only);
    Ok(report)
}

fn print_summary(report: &MergeReport, only: &Option<OnlyMode>) {
    match only {
        None => {
            println!(
                "{} Merged {} nodes and {} edges",
                "✓".green(),
                format_count(report.nodes_written),
                format_count(report.edges_written)
            );
            println!("  Nodes: {}", report.node_path.display());
            println!("  Edges: {}", report.edge_path.display());
        },
        Some(OnlyMode::Stats) => {
            println!(
                "{} Statistics recomputed over {} nodes and {} edges",
                "✓".green(),
                format_count(report.nodes_written),
                format_count(report.edges_written)
            );
        },
        Some(OnlyMode::Chain(_)) => {},
    }

    for (name, rows) in &report.chains {
        if *rows == 0 {
            println!("{} Chain '{}' produced no rows", "!".yellow(), name);
        } else {
            println!("{} Chain '{}': {} pairs", "✓".green(), name, format_count(*rows));
        }
    }

    let d = &report.diagnostics;
    if d.parse_errors + d.dropped_invalid + d.dangling_refs + d.pruned_edges > 0 {
        println!(
            "  Diagnostics: {} parse errors, {} invalid rows dropped, {} dangling refs, {} pruned edges",
            format_count(d.parse_errors),
            format_count(d.dropped_invalid),
            format_count(d.dangling_refs),
            format_count(d.pruned_edges)
        );
    }

    for source in &report.refused_sources {
        println!("{} Source '{}' was refused", "!".yellow(), source);
    }
}
