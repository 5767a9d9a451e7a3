// provisioner/src/transaction.rs

use crate::client::ChainClient;
use crate::config::NetworkProfile;
use crate::error::ProvisionError;
use crate::gas::GasQuote;
use ethers::types::{
    transaction::eip2718::TypedTransaction, Address, Bytes, TransactionReceipt, TransactionRequest, TxHash, U256, U64,
};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

const TX_SUCCESS_STATUS: U64 = U64([1]);

// --- NonceManager ---

/// Hands out sequential nonces for the signer within one run.
///
/// Starts from the node's pending count. There is no coordination with other
/// processes using the same account.
#[derive(Debug)]
pub struct NonceManager {
    current_nonce: Mutex<Option<U256>>,
    wallet_address: Address,
}

impl NonceManager {
    pub fn new(wallet_address: Address) -> Self {
        Self { current_nonce: Mutex::new(None), wallet_address }
    }

    pub async fn get_next_nonce(&self, client: &dyn ChainClient) -> Result<U256, ProvisionError> {
        let mut nonce_guard = self.current_nonce.lock().await;
        let next_nonce = match *nonce_guard {
            Some(nonce) => nonce + U256::one(),
            None => client.transaction_count(self.wallet_address).await?,
        };
        *nonce_guard = Some(next_nonce);
        Ok(next_nonce)
    }

    /// Forgets the local counter so the next call re-reads it from the node.
    pub async fn reset(&self) {
        warn!("Resetting local nonce; next transaction re-reads it from the network.");
        *self.current_nonce.lock().await = None;
    }
}

// --- Submission ---

/// A transaction that left this process, with the block height it was sent at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submitted {
    pub tx_hash: TxHash,
    pub nonce: U256,
    pub sent_at_block: u64,
}

/// Builds a legacy transaction from the signer. `to = None` creates a contract.
pub fn build_transaction(
    client: &dyn ChainClient,
    to: Option<Address>,
    data: Bytes,
    nonce: U256,
    quote: &GasQuote,
) -> TypedTransaction {
    let mut request = TransactionRequest::new()
        .from(client.signer_address())
        .data(data)
        .gas(quote.gas_limit)
        .gas_price(quote.gas_price)
        .nonce(nonce)
        .chain_id(client.chain_id());
    if let Some(to) = to {
        request = request.to(to);
    }
    request.into()
}

/// Sends exactly once. A failed send is never retried here.
#[instrument(skip_all, fields(to = ?to))]
pub async fn submit_transaction(
    client: &dyn ChainClient,
    nonces: &NonceManager,
    to: Option<Address>,
    data: Bytes,
    quote: &GasQuote,
) -> Result<Submitted, ProvisionError> {
    let nonce = nonces.get_next_nonce(client).await?;
    let sent_at_block = client.block_number().await?;
    let tx = build_transaction(client, to, data, nonce, quote);

    match client.send(tx).await {
        Ok(tx_hash) => {
            info!(?tx_hash, %nonce, sent_at_block, "Transaction submitted");
            Ok(Submitted { tx_hash, nonce, sent_at_block })
        }
        Err(e) => {
            error!(error = %e, %nonce, "Transaction submission failed");
            // The nonce was not consumed, or the node knows better than we do.
            nonces.reset().await;
            Err(e)
        }
    }
}

/// Polls until the receipt is `profile.required_depth()` blocks deep.
///
/// Fails with `Revert` on a status-0 receipt and with `Timeout` once
/// `profile.timeout_blocks` blocks have passed since submission.
#[instrument(skip_all, fields(tx_hash = ?submitted.tx_hash, confirmations = profile.confirmations, timeout_blocks = profile.timeout_blocks))]
pub async fn await_confirmations(
    client: &dyn ChainClient,
    submitted: &Submitted,
    profile: &NetworkProfile,
) -> Result<TransactionReceipt, ProvisionError> {
    let deadline = submitted.sent_at_block.saturating_add(profile.timeout_blocks);
    let depth_needed = profile.required_depth();

    loop {
        let current = client.block_number().await?;
        if let Some(receipt) = client.receipt(submitted.tx_hash).await? {
            if receipt.status != Some(TX_SUCCESS_STATUS) {
                let reason = client.revert_reason(&receipt).await;
                error!(reason = ?reason, "Transaction reverted on-chain");
                return Err(ProvisionError::Revert { tx_hash: Some(submitted.tx_hash), reason });
            }
            let included = receipt
                .block_number
                .ok_or_else(|| ProvisionError::network("receipt without block number"))?
                .as_u64();
            let depth = current.saturating_sub(included) + 1;
            debug!(included, current, depth, "Receipt found");
            if depth >= depth_needed {
                info!(block = included, depth, "Transaction confirmed");
                return Ok(receipt);
            }
        }
        if current >= deadline {
            error!(current, deadline, "Confirmation wait timed out");
            return Err(ProvisionError::Timeout { tx_hash: submitted.tx_hash, timeout_blocks: profile.timeout_blocks });
        }
        sleep(profile.poll_interval).await;
    }
}

/// Submit once, then wait for confirmations.
pub async fn send_and_confirm(
    client: &dyn ChainClient,
    nonces: &NonceManager,
    profile: &NetworkProfile,
    to: Option<Address>,
    data: Bytes,
    quote: &GasQuote,
) -> Result<TransactionReceipt, ProvisionError> {
    let submitted = submit_transaction(client, nonces, to, data, quote).await?;
    await_confirmations(client, &submitted, profile).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::SimulatedChain;
    use ethers::types::transaction::eip2718::TypedTransaction;

    #[tokio::test]
    async fn nonces_are_sequential_from_network_count() {
        let chain = SimulatedChain::builder().build();
        let nonces = NonceManager::new(chain.signer_address());
        assert_eq!(nonces.get_next_nonce(&chain).await.unwrap(), U256::zero());
        assert_eq!(nonces.get_next_nonce(&chain).await.unwrap(), U256::one());
        nonces.reset().await;
        assert_eq!(nonces.get_next_nonce(&chain).await.unwrap(), U256::zero());
    }

    #[test]
    fn create_transactions_have_no_recipient() {
        let chain = SimulatedChain::builder().chain_id(42).build();
        let quote = GasQuote { gas_limit: U256::from(100_000u64), gas_price: U256::from(7u64) };
        let tx = build_transaction(&chain, None, Bytes::from(vec![0x60]), U256::from(3u64), &quote);
        assert!(matches!(tx, TypedTransaction::Legacy(_)));
        assert!(tx.to().is_none());
        assert_eq!(tx.nonce(), Some(&U256::from(3u64)));
        assert_eq!(tx.gas_price(), Some(U256::from(7u64)));
        assert_eq!(tx.chain_id().map(|id| id.as_u64()), Some(42));
    }
}
