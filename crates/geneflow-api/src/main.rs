//! GeneFlow command-line entry point.
//!
//! Binary name: `gf`
//!
//! Parses CLI arguments, initializes tracing and the local engine, then
//! dispatches to the command handler.

mod cli;
mod state;

use std::process::ExitCode;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,geneflow=debug",
        _ => "trace",
    };
    if let Err(e) = geneflow_observe::tracing_setup::init_tracing(filter, cli.otel) {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }

    let result = dispatch(cli).await;
    geneflow_observe::tracing_setup::shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        // Shell completions and validation don't need app state
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(shell, &mut cmd, "gf", &mut std::io::stdout());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Validate { workflow, job } => {
            cli::run::validate(&workflow, job.as_deref(), cli.json)?;
            Ok(ExitCode::SUCCESS)
        }
        command => {
            let state = AppState::init().await?;
            tracing::debug!(data_dir = %state.data_dir.display(), "using data directory");
            match command {
                Commands::Run(args) => {
                    let completed = cli::run::run(&state, args, cli.json, cli.quiet).await?;
                    Ok(if completed {
                        ExitCode::SUCCESS
                    } else {
                        ExitCode::FAILURE
                    })
                }
                Commands::Status { job_id } => {
                    cli::job::status(&state, &job_id, cli.json).await?;
                    Ok(ExitCode::SUCCESS)
                }
                Commands::List { limit } => {
                    cli::job::list(&state, limit, cli.json).await?;
                    Ok(ExitCode::SUCCESS)
                }
                Commands::Cancel { job_id } => {
                    cli::job::cancel(&state, &job_id, cli.json).await?;
                    Ok(ExitCode::SUCCESS)
                }
                Commands::Completions { .. } | Commands::Validate { .. } => Ok(ExitCode::SUCCESS),
            }
        }
    }
}
