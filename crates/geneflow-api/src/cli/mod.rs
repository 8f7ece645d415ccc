//! CLI command definitions for the `gf` binary.
//!
//! Uses clap derive macros for argument parsing. Job-level subcommands take
//! a job id as printed by `gf run` or `gf list`.

pub mod job;
pub mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Run bioinformatics workflows on the local host.
#[derive(Parser)]
#[command(name = "gf", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true, env = "GENEFLOW_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a workflow and wait for it to finish.
    Run(run::RunArgs),

    /// Check a workflow (and optionally a job) without running anything.
    Validate {
        /// Path to the workflow YAML file.
        workflow: PathBuf,

        /// Path to a job YAML file to check against the workflow.
        #[arg(long)]
        job: Option<PathBuf>,
    },

    /// Show a job and its steps.
    Status {
        /// Job UUID.
        job_id: String,
    },

    /// List recent jobs.
    #[command(alias = "ls")]
    List {
        /// Maximum number of jobs to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Cancel a pending or running job.
    Cancel {
        /// Job UUID.
        job_id: String,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
