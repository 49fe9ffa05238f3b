//! Folio CLI entry point.
//!
//! Binary name: `folio`
//!
//! Parses CLI arguments, initializes tracing, the database, and the engine,
//! then dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity; RUST_LOG takes precedence.
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,folio_core=debug,folio_infra=debug",
        _ => "trace",
    };
    folio_observe::tracing_setup::init_tracing(filter, cli.otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = dispatch(cli).await;
    folio_observe::tracing_setup::shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "folio", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init().await?;

    match cli.command {
        Commands::Run {
            inputs,
            job_id,
            execution,
        } => {
            cli::job::run_job(&state, &inputs, job_id, execution, cli.json, cli.quiet).await?;
        }

        Commands::Resume { job_id, execution } => {
            cli::job::resume_job(&state, &job_id, execution, cli.json, cli.quiet).await?;
        }

        Commands::Status { job_id } => {
            cli::job::show_status(&state, &job_id, cli.json).await?;
        }

        Commands::Artifact { job_id, output } => {
            cli::job::show_artifact(&state, &job_id, output.as_deref()).await?;
        }

        Commands::List => {
            cli::job::list_jobs(&state, cli.json).await?;
        }

        Commands::Completions { .. } => unreachable!("handled above"),
    }

    Ok(())
}
