// provisioner/src/verify.rs

use crate::client::ChainClient;
use crate::encoding::{decode_balance, encode_balance_of};
use crate::error::ProvisionError;
use ethers::types::{Address, TransactionRequest, U256};
use serde::Serialize;
use tracing::{debug, instrument};

/// Pre-existing fungible-token contract. Not created or owned by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenContract {
    pub address: Address,
    pub decimals: u32,
}

/// Point-in-time `balanceOf` read. Not persisted anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BalanceObservation {
    pub token: Address,
    pub holder: Address,
    pub amount: U256,
    pub block_number: u64,
}

/// `token.balanceOf(holder)`. Read-only; fails only with `NetworkError`.
#[instrument(skip(client, token), level = "debug", fields(token = ?token.address))]
pub async fn query_balance(client: &dyn ChainClient, token: &TokenContract, holder: Address) -> Result<U256, ProvisionError> {
    let call = TransactionRequest::new().to(token.address).data(encode_balance_of(holder));
    let output = client.call(&call.into()).await?;
    let balance = decode_balance(&output)?;
    debug!(%balance, "balanceOf");
    Ok(balance)
}

/// [`query_balance`] plus the height it was taken at, for the operator report.
pub async fn observe_balance(
    client: &dyn ChainClient,
    token: &TokenContract,
    holder: Address,
) -> Result<BalanceObservation, ProvisionError> {
    let amount = query_balance(client, token, holder).await?;
    let block_number = client.block_number().await?;
    Ok(BalanceObservation { token: token.address, holder, amount, block_number })
}
