//! CLI command definitions for the `folio` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod job;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;

/// Run batch document-generation jobs.
#[derive(Parser)]
#[command(name = "folio", version, about, long_about = None)]
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
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a new job from a JSON Lines file or JSON array ("-" for stdin).
    Run {
        /// Input records.
        inputs: PathBuf,

        /// Job identifier (generated when omitted).
        #[arg(long)]
        job_id: Option<String>,

        #[command(flatten)]
        execution: ExecutionArgs,
    },

    /// Resume an interrupted job from its last committed snapshot.
    Resume {
        /// Job to resume.
        job_id: String,

        #[command(flatten)]
        execution: ExecutionArgs,
    },

    /// Show the status of a job.
    Status {
        /// Job to inspect.
        job_id: String,
    },

    /// Print or save the assembled document of a finished job.
    Artifact {
        /// Job whose document to print.
        job_id: String,

        /// Write the document to this file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List known jobs, most recently updated first.
    #[command(alias = "ls")]
    List,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Options shared by `run` and `resume`.
#[derive(Args, Debug, Clone, Default)]
pub struct ExecutionArgs {
    /// Maximum units per wave (overrides config).
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Attempts per unit before it is abandoned (overrides config).
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Write the assembled document to this file instead of stdout.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Unit executor command, overriding the configured one.
    #[arg(last = true)]
    pub command: Vec<String>,
}
