// provisioner/src/bin/simulate.rs
//
// Runs the full migration against the in-memory chain with a throwaway wallet.
// Nothing is broadcast; useful to preview the sequence and the report.

use clap::Parser;
use eyre::{eyre, Result};
use game_provision::{config::MigrationPlan, migration::preview};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Preview the migration on a simulated chain", long_about = None)]
struct Cli {
    /// Compiled game artifact. A built-in stand-in is used when omitted.
    #[arg(long, value_name = "PATH")]
    artifact: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let outcome = preview(MigrationPlan::default(), cli.artifact.as_deref()).await?;

    println!("states: {:?}", outcome.history);
    match (outcome.report(), outcome.failure()) {
        (Some(report), _) => {
            println!("{}", serde_json::to_string_pretty(report)?);
            Ok(ExitCode::SUCCESS)
        }
        (None, Some(failure)) => {
            eprintln!("❌ {failure}");
            Ok(ExitCode::FAILURE)
        }
        (None, None) => Err(eyre!("simulation ended in a non-terminal state")),
    }
}
