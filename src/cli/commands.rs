//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Converge - declarative infrastructure reconciliation.
#[derive(Parser, Debug)]
#[command(name = "converge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the stack description.
    #[arg(short, long, global = true, env = "CONVERGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a starter stack description.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the stack description and its resource graph.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Compute and display the plan.
    Plan {
        /// Show per-attribute changes.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Plan and apply changes.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Keep applying independent branches after a failure.
        #[arg(long)]
        best_effort: bool,

        /// Maximum concurrent operations within a batch.
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Destroy every resource recorded in state.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Compare recorded state with the remote objects.
    Drift,

    /// Plan and apply until converged.
    Reconcile {
        /// Maximum apply passes.
        #[arg(long, default_value = "3")]
        max_attempts: usize,
    },

    /// Manage the state backend.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show current state.
    Show,

    /// Lock the state.
    Lock {
        /// Lock holder identifier.
        #[arg(long)]
        holder: Option<String>,
    },

    /// Unlock the state.
    Unlock {
        /// Lock ID to unlock.
        #[arg(long)]
        lock_id: Option<String>,

        /// Force unlock (dangerous).
        #[arg(long)]
        force: bool,
    },

    /// Clear the interrupted-operation marker of a resource.
    ///
    /// Only run this after checking whether the remote object exists.
    ClearPending {
        /// Resource key (`kind.name`).
        key: String,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_apply_flags() {
        let cli = Cli::try_parse_from([
            "converge",
            "--output",
            "json",
            "apply",
            "--yes",
            "--best-effort",
            "--concurrency",
            "8",
        ])
        .expect("valid arguments");

        assert_eq!(cli.output, OutputFormat::Json);
        match cli.command {
            Commands::Apply {
                yes,
                best_effort,
                concurrency,
            } => {
                assert!(yes);
                assert!(best_effort);
                assert_eq!(concurrency, Some(8));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_clear_pending() {
        let cli = Cli::try_parse_from(["converge", "state", "clear-pending", "aws_vpc.main"])
            .expect("valid arguments");
        assert!(matches!(
            cli.command,
            Commands::State {
                command: StateCommands::ClearPending { ref key }
            } if key == "aws_vpc.main"
        ));
    }
}
