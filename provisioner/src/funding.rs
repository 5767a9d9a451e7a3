// provisioner/src/funding.rs

use crate::client::ChainClient;
use crate::config::{FundingPolicy, NetworkProfile};
use crate::encoding::encode_transfer;
use crate::error::ProvisionError;
use crate::gas::{ensure_affordable, quote_gas};
use crate::transaction::{send_and_confirm, NonceManager};
use crate::utils::format_units;
use crate::verify::{query_balance, TokenContract};
use ethers::types::{Address, TransactionReceipt, U256};
use serde::Serialize;
use tracing::{info, instrument, warn};

/// One token transfer from the signer. Submitting it twice transfers twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FundingTransfer {
    pub from: Address,
    pub to: Address,
    pub amount: U256,
}

/// How much to send under `policy` when the recipient already holds `existing`.
pub fn amount_to_send(policy: FundingPolicy, target: U256, existing: U256) -> U256 {
    match policy {
        FundingPolicy::Unconditional => target,
        FundingPolicy::TopUp => target.saturating_sub(existing),
    }
}

/// Transfers exactly `amount` tokens from the signer to `recipient`.
///
/// Checks the signer's token balance first and fails with
/// `InsufficientTokenBalance` without sending anything when it is short.
#[instrument(skip_all, fields(token = ?token.address, recipient = ?recipient, amount = %format_units(amount, token.decimals)))]
pub async fn fund(
    client: &dyn ChainClient,
    nonces: &NonceManager,
    profile: &NetworkProfile,
    token: &TokenContract,
    recipient: Address,
    amount: U256,
) -> Result<TransactionReceipt, ProvisionError> {
    let transfer = FundingTransfer { from: client.signer_address(), to: recipient, amount };

    let available = query_balance(client, token, transfer.from).await?;
    if available < amount {
        warn!(
            available = %format_units(available, token.decimals),
            "Signer token balance below funding amount"
        );
        return Err(ProvisionError::InsufficientTokenBalance { required: amount, available });
    }

    let quote = quote_gas(client, profile).await?;
    ensure_affordable(client, &quote).await?;

    info!("Sending token transfer...");
    let receipt =
        send_and_confirm(client, nonces, profile, Some(token.address), encode_transfer(transfer.to, transfer.amount), &quote)
            .await?;
    info!(tx_hash = ?receipt.transaction_hash, "✅ Token transfer confirmed");
    Ok(receipt)
}
