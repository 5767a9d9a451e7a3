// provisioner/src/lib.rs
// Library interface: the binaries and the integration tests go through here.

use ethers::types::Address;
use lazy_static::lazy_static;

pub mod artifact;
pub mod bindings;
pub mod client;
pub mod config;
pub mod deploy;
pub mod encoding;
pub mod error;
pub mod funding;
pub mod gas;
pub mod migration;
pub mod signer;
pub mod simulation;
pub mod transaction;
pub mod utils;
pub mod verify;

pub use artifact::GameArtifact;
pub use client::{ChainClient, EvmClient};
pub use config::{load_config, AppConfig, FundingPolicy, MigrationPlan, NetworkProfile, NetworkRegistry, Secrets};
pub use deploy::{deploy_game, DeployedGame, GameConstructorArgs};
pub use error::ProvisionError;
pub use funding::fund;
pub use migration::{MigrationOutcome, MigrationReport, MigrationState, Migrator, StateKind};
pub use signer::{AccountSelection, MnemonicSignerProvider, SignerProvider};
pub use simulation::{SimulatedChain, SimulatedSignerProvider};
pub use transaction::NonceManager;
pub use verify::{query_balance, BalanceObservation, TokenContract};

lazy_static! {
    /// LINK on Kovan, the game's default fee token.
    pub static ref KOVAN_LINK_TOKEN: Address = "0xa36085F69e2889c224210F603D836748e7dC0088"
        .parse()
        .expect("static address literal");
}

// END OF FILE: provisioner/src/lib.rs
