// provisioner/src/main.rs

// --- Imports ---
use clap::{Parser, Subcommand};
use eyre::Result;
use game_provision::{
    config::load_config, migration::MigrationState, signer::AccountSelection, utils::format_units, Migrator,
    MnemonicSignerProvider,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

// --- CLI Argument Parsing ---
#[derive(Parser, Debug)]
#[command(author, version, about = "Deploys the gambling game and funds it with oracle fee tokens", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Deploy the game, fund it and report its token balance.
    Migrate {
        /// Network profile to run against.
        #[arg(long, default_value = "develop")]
        network: String,

        /// TOML file with network overrides and the `[migration]` table.
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

// --- Main Execution ---
#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let Command::Migrate { network, config } = cli.command;

    let config = load_config(config.as_deref())?;
    let provider = MnemonicSignerProvider::new(AccountSelection::from(&config.plan));
    let outcome = Migrator::new(&config, &provider).run(&network).await;

    match &outcome.state {
        MigrationState::Done(report) => {
            println!("contract deployed at {:?}", report.game);
            match &report.balance {
                Some(balance) => {
                    println!("token balance of game: {}", format_units(balance.amount, config.plan.token_decimals))
                }
                None => println!("token balance of game: unavailable (verification read failed)"),
            }
            println!("{}", serde_json::to_string_pretty(report)?);
            Ok(ExitCode::SUCCESS)
        }
        MigrationState::Failed(failure) => {
            eprintln!("❌ {failure}");
            Ok(ExitCode::FAILURE)
        }
        other => eyre::bail!("migration stopped in non-terminal state {}", other.kind()),
    }
}
