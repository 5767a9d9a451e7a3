// provisioner/src/deploy.rs

use crate::artifact::GameArtifact;
use crate::client::ChainClient;
use crate::config::NetworkProfile;
use crate::encoding::encode_deployment;
use crate::error::ProvisionError;
use crate::gas::{ensure_affordable, quote_gas};
use crate::transaction::{send_and_confirm, NonceManager};
use ethers::{
    abi::{Abi, Token},
    types::{Address, TxHash, U256},
};
use serde::Serialize;
use tracing::{info, instrument};

/// Constructor parameters of the game. Fixed at deployment; the contract has no setters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GameConstructorArgs {
    pub participant_count: u64,
    pub stake_amount: U256,
}

impl GameConstructorArgs {
    pub const MIN_PARTICIPANTS: u64 = 2;

    pub fn new(participant_count: u64, stake_amount: U256) -> Result<Self, ProvisionError> {
        if participant_count < Self::MIN_PARTICIPANTS {
            return Err(ProvisionError::configuration(format!(
                "participant count must be at least {}, got {participant_count}",
                Self::MIN_PARTICIPANTS
            )));
        }
        Ok(Self { participant_count, stake_amount })
    }

    pub fn tokens(&self) -> Vec<Token> {
        vec![Token::Uint(U256::from(self.participant_count)), Token::Uint(self.stake_amount)]
    }
}

/// A game contract this run created.
#[derive(Debug, Clone)]
pub struct DeployedGame {
    pub address: Address,
    pub abi: Abi,
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub args: GameConstructorArgs,
}

/// Deploys the game and waits for the profile's confirmations.
///
/// Not idempotent: every call creates a new contract at a new address.
#[instrument(skip_all, fields(network = %profile.name, contract = %artifact.name, n = args.participant_count, stake = %args.stake_amount))]
pub async fn deploy_game(
    client: &dyn ChainClient,
    nonces: &NonceManager,
    artifact: &GameArtifact,
    args: GameConstructorArgs,
    profile: &NetworkProfile,
) -> Result<DeployedGame, ProvisionError> {
    if client.endpoint() != profile.endpoint {
        return Err(ProvisionError::configuration(format!(
            "signer is bound to {} but the profile targets {}",
            client.endpoint(),
            profile.endpoint
        )));
    }
    // Enforced again here since the contract's own check would cost gas to discover.
    GameConstructorArgs::new(args.participant_count, args.stake_amount)?;

    let creation_code = encode_deployment(artifact, args)?;
    let quote = quote_gas(client, profile).await?;
    ensure_affordable(client, &quote).await?;

    info!("Sending deployment transaction...");
    let receipt = send_and_confirm(client, nonces, profile, None, creation_code, &quote).await?;
    let address = receipt
        .contract_address
        .ok_or_else(|| ProvisionError::network("deployment receipt carries no contract address"))?;
    let block_number = receipt.block_number.map(|b| b.as_u64()).unwrap_or_default();

    info!(?address, tx_hash = ?receipt.transaction_hash, block_number, "✅ Game contract deployed");
    Ok(DeployedGame { address, abi: artifact.abi.clone(), tx_hash: receipt.transaction_hash, block_number, args })
}
