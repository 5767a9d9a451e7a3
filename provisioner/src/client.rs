// provisioner/src/client.rs

use crate::error::ProvisionError;
use async_trait::async_trait;
use ethers::{
    providers::{Middleware, MiddlewareError},
    types::{
        transaction::eip2718::TypedTransaction, Address, BlockId, BlockNumber, Bytes, TransactionReceipt,
        TransactionRequest, TxHash, U256,
    },
};
use std::sync::Arc;
use tracing::{debug, warn};

/// A signer-bound connection to one network.
///
/// Every blocking point of a run goes through this trait; nothing else in the
/// crate talks to a node.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Chain id the client signs for.
    fn chain_id(&self) -> u64;
    /// Account that signs and pays for every transaction.
    fn signer_address(&self) -> Address;
    /// All accounts derived for this run; the signer is one of them.
    fn accounts(&self) -> Vec<Address>;
    /// Endpoint the connection is bound to.
    fn endpoint(&self) -> &str;

    async fn block_number(&self) -> Result<u64, ProvisionError>;
    async fn native_balance(&self, owner: Address) -> Result<U256, ProvisionError>;
    async fn gas_price(&self) -> Result<U256, ProvisionError>;
    /// Pending transaction count, i.e. the next usable nonce.
    async fn transaction_count(&self, owner: Address) -> Result<U256, ProvisionError>;
    /// Signs and broadcasts. Returns as soon as the node accepted the transaction.
    async fn send(&self, tx: TypedTransaction) -> Result<TxHash, ProvisionError>;
    async fn receipt(&self, tx_hash: TxHash) -> Result<Option<TransactionReceipt>, ProvisionError>;
    /// Read-only `eth_call` against the latest block.
    async fn call(&self, tx: &TypedTransaction) -> Result<Bytes, ProvisionError>;

    /// Best-effort reason for a status-0 receipt.
    async fn revert_reason(&self, _receipt: &TransactionReceipt) -> Option<String> {
        None
    }
}

/// [`ChainClient`] over any ethers middleware stack whose outermost layer signs.
#[derive(Debug)]
pub struct EvmClient<M> {
    client: Arc<M>,
    signer: Address,
    accounts: Vec<Address>,
    chain_id: u64,
    endpoint: String,
}

impl<M: Middleware> EvmClient<M> {
    pub fn new(client: Arc<M>, signer: Address, accounts: Vec<Address>, chain_id: u64, endpoint: impl Into<String>) -> Self {
        Self { client, signer, accounts, chain_id, endpoint: endpoint.into() }
    }

    pub fn inner(&self) -> &Arc<M> {
        &self.client
    }
}

fn classify_send_error<E: MiddlewareError>(err: E) -> ProvisionError {
    if let Some(rpc) = err.as_error_response() {
        if rpc.message.contains("execution reverted") || rpc.message.contains("revert") {
            return ProvisionError::Revert { tx_hash: None, reason: Some(rpc.message.clone()) };
        }
    }
    ProvisionError::network(err)
}

#[async_trait]
impl<M> ChainClient for EvmClient<M>
where
    M: Middleware + 'static,
{
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn signer_address(&self) -> Address {
        self.signer
    }

    fn accounts(&self) -> Vec<Address> {
        self.accounts.clone()
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn block_number(&self) -> Result<u64, ProvisionError> {
        self.client.get_block_number().await.map(|n| n.as_u64()).map_err(ProvisionError::network)
    }

    async fn native_balance(&self, owner: Address) -> Result<U256, ProvisionError> {
        self.client.get_balance(owner, None).await.map_err(ProvisionError::network)
    }

    async fn gas_price(&self) -> Result<U256, ProvisionError> {
        self.client.get_gas_price().await.map_err(ProvisionError::network)
    }

    async fn transaction_count(&self, owner: Address) -> Result<U256, ProvisionError> {
        self.client
            .get_transaction_count(owner, Some(BlockNumber::Pending.into()))
            .await
            .map_err(ProvisionError::network)
    }

    async fn send(&self, tx: TypedTransaction) -> Result<TxHash, ProvisionError> {
        let pending = self.client.send_transaction(tx, None).await.map_err(classify_send_error)?;
        let tx_hash = pending.tx_hash();
        debug!(?tx_hash, "Transaction accepted by node");
        Ok(tx_hash)
    }

    async fn receipt(&self, tx_hash: TxHash) -> Result<Option<TransactionReceipt>, ProvisionError> {
        self.client.get_transaction_receipt(tx_hash).await.map_err(ProvisionError::network)
    }

    async fn call(&self, tx: &TypedTransaction) -> Result<Bytes, ProvisionError> {
        self.client.call(tx, None).await.map_err(ProvisionError::network)
    }

    /// Replays the failed transaction as a call at its block to recover the revert message.
    async fn revert_reason(&self, receipt: &TransactionReceipt) -> Option<String> {
        let tx = match self.client.get_transaction(receipt.transaction_hash).await {
            Ok(Some(tx)) => tx,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Could not fetch reverted transaction for replay");
                return None;
            }
        };
        let mut replay = TransactionRequest::new().from(tx.from).gas(tx.gas).value(tx.value).data(tx.input.clone());
        if let Some(to) = tx.to {
            replay = replay.to(to);
        }
        let block = receipt.block_number.map(|n| BlockId::Number(BlockNumber::Number(n)));
        match self.client.call(&replay.into(), block).await {
            Ok(_) => None,
            Err(e) => Some(e.as_error_response().map(|rpc| rpc.message.clone()).unwrap_or_else(|| e.to_string())),
        }
    }
}
