// provisioner/src/signer.rs

use crate::client::{ChainClient, EvmClient};
use crate::config::{MigrationPlan, NetworkProfile, Secrets, MNEMONIC_ENV};
use crate::error::ProvisionError;
use async_trait::async_trait;
use ethers::{
    middleware::SignerMiddleware,
    providers::{Http, JsonRpcClient, Middleware, Provider, Ws},
    signers::{coins_bip39::English, LocalWallet, MnemonicBuilder, Signer},
    types::Address,
};
use std::sync::Arc;
use tracing::{info, instrument};

/// Which derived accounts a run uses: `count` wallets along
/// `m/44'/60'/0'/0/i`, signing with the one at `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountSelection {
    pub index: u32,
    pub count: u32,
}

impl Default for AccountSelection {
    fn default() -> Self {
        Self { index: 0, count: 1 }
    }
}

impl AccountSelection {
    pub fn new(index: u32, count: u32) -> Result<Self, ProvisionError> {
        if index >= count {
            return Err(ProvisionError::configuration(format!(
                "account index {index} is outside the {count} derived accounts"
            )));
        }
        Ok(Self { index, count })
    }
}

impl From<&MigrationPlan> for AccountSelection {
    fn from(plan: &MigrationPlan) -> Self {
        Self { index: plan.account_index, count: plan.accounts }
    }
}

/// Derives the run's wallets from the mnemonic. Touches no network.
pub fn derive_wallets(
    secrets: &Secrets,
    selection: AccountSelection,
    chain_id: u64,
) -> Result<Vec<LocalWallet>, ProvisionError> {
    let phrase = secrets
        .mnemonic
        .as_deref()
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| ProvisionError::configuration(format!("{MNEMONIC_ENV} is not set")))?;
    let selection = AccountSelection::new(selection.index, selection.count)?;

    (0..selection.count)
        .map(|i| {
            MnemonicBuilder::<English>::default()
                .phrase(phrase.trim())
                .index(i)
                .and_then(|builder| builder.build())
                .map(|wallet| wallet.with_chain_id(chain_id))
                .map_err(|e| ProvisionError::Credential(format!("cannot derive account {i}: {e}")))
        })
        .collect()
}

/// Turns secrets and a network profile into a connected signer.
#[async_trait]
pub trait SignerProvider: Send + Sync {
    async fn create_signer(
        &self,
        secrets: &Secrets,
        profile: &NetworkProfile,
    ) -> Result<Box<dyn ChainClient>, ProvisionError>;
}

/// HD wallet from `MNEMONIC` over a WebSocket or HTTP provider, chosen by the
/// endpoint scheme.
#[derive(Debug, Clone, Copy, Default)]
pub struct MnemonicSignerProvider {
    selection: AccountSelection,
}

impl MnemonicSignerProvider {
    pub fn new(selection: AccountSelection) -> Self {
        Self { selection }
    }
}

#[async_trait]
impl SignerProvider for MnemonicSignerProvider {
    #[instrument(skip_all, fields(network = %profile.name))]
    async fn create_signer(
        &self,
        secrets: &Secrets,
        profile: &NetworkProfile,
    ) -> Result<Box<dyn ChainClient>, ProvisionError> {
        // Chain id is rebound once the node reports it.
        let wallets = derive_wallets(secrets, self.selection, 1)?;
        let accounts: Vec<Address> = wallets.iter().map(|w| w.address()).collect();
        let wallet = wallets
            .into_iter()
            .nth(self.selection.index as usize)
            .ok_or_else(|| ProvisionError::configuration("signer account was not derived"))?;

        if profile.is_websocket() {
            info!("Connecting to WebSocket provider...");
            let provider = Provider::<Ws>::connect(profile.endpoint.as_str())
                .await
                .map_err(|e| ProvisionError::network(format!("cannot connect to {}: {e}", profile.name)))?
                .interval(profile.poll_interval);
            bind_signer(provider, wallet, accounts, profile).await
        } else {
            info!("Connecting to HTTP provider...");
            let provider = Provider::<Http>::try_from(profile.endpoint.as_str())
                .map_err(|e| ProvisionError::configuration(format!("invalid endpoint for {}: {e}", profile.name)))?
                .interval(profile.poll_interval);
            bind_signer(provider, wallet, accounts, profile).await
        }
    }
}

async fn bind_signer<P>(
    provider: Provider<P>,
    wallet: LocalWallet,
    accounts: Vec<Address>,
    profile: &NetworkProfile,
) -> Result<Box<dyn ChainClient>, ProvisionError>
where
    P: JsonRpcClient + 'static,
{
    let chain_id = provider
        .get_chainid()
        .await
        .map_err(|e| ProvisionError::network(format!("cannot reach {}: {e}", profile.name)))?
        .as_u64();
    if !profile.network_id.accepts(chain_id) {
        return Err(ProvisionError::configuration(format!(
            "network {} expects chain id {} but the node reports {chain_id}",
            profile.name, profile.network_id
        )));
    }

    let wallet = wallet.with_chain_id(chain_id);
    let signer = wallet.address();
    info!(chain_id, ?signer, "Signer connected");
    let client = Arc::new(SignerMiddleware::new(provider, wallet));
    Ok(Box::new(EvmClient::new(client, signer, accounts, chain_id, profile.endpoint.clone())))
}
