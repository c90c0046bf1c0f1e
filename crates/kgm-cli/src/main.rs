//! KGM CLI - Main entry point

use clap::Parser;
use kgm_cli::{Cli, Commands};
use kgm_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use std::process;
use tracing::error;

fn main() {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::builder()
            .level(LogLevel::Debug)
            .output(LogOutput::Console)
            .log_file_prefix("kgm".to_string())
            .build()
    } else {
        LogConfig::builder()
            .level(LogLevel::Warn)
            .output(LogOutput::Console)
            .log_file_prefix("kgm".to_string())
            .build()
    };
    // Environment overrides take precedence over the flags.
    let log_config = LogConfig::from_env().unwrap_or(log_config);
    let _ = init_logging(&log_config);

    let code = execute_command(&cli);
    process::exit(code);
}

/// Execute the CLI command and map the outcome to an exit code
fn execute_command(cli: &Cli) -> i32 {
    match &cli.command {
        Commands::Merge {
            config,
            only,
            resume,
            force_resume,
            strict,
            processes,
        } => {
            let result = kgm_cli::commands::merge::run(
                config,
                only.clone(),
                *resume,
                *force_resume,
                *strict,
                *processes,
            );
            match result {
                Ok(report) if report.is_partial() => {
                    error!(
                        refused = report.refused_sources.len(),
                        "merge finished with refused sources"
                    );
                    4
                },
                Ok(_) => 0,
                Err(e) => {
                    error!(error = %e, "merge failed");
                    eprintln!("Error: {}", e);
                    e.exit_code()
                },
            }
        },
    }
}
