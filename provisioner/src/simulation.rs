// provisioner/src/simulation.rs
//
// Deterministic in-memory chain. Backs dry runs, the `simulate` binary and
// the test suite.

use crate::artifact::GameArtifact;
use crate::bindings::link_token_interface::LinkTokenInterfaceCalls;
use crate::client::ChainClient;
use crate::config::{NetworkId, NetworkProfile, Secrets};
use crate::deploy::GameConstructorArgs;
use crate::encoding::decode_constructor_args;
use crate::error::ProvisionError;
use crate::signer::{derive_wallets, AccountSelection, SignerProvider};
use crate::verify::{query_balance, TokenContract};
use async_trait::async_trait;
use ethers::{
    abi::{AbiDecode, AbiEncode, Token},
    signers::Signer,
    types::{
        transaction::eip2718::TypedTransaction, Address, Bytes, NameOrAddress, TransactionReceipt, TxHash, H256, U256,
        U64,
    },
    utils::{get_contract_address, keccak256},
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

pub const DEFAULT_SIM_CHAIN_ID: u64 = 1337;
pub const DEFAULT_SIM_ENDPOINT: &str = "http://127.0.0.1:8545";

const SIM_GAS_LIMIT: u64 = 6_721_975;
const TX_BASE_GAS: u64 = 21_000;
const CREATE_BASE_GAS: u64 = 53_000;
const CALLDATA_BYTE_GAS: u64 = 16;
const TOKEN_TRANSFER_GAS: u64 = 51_000;

#[derive(Debug, Default)]
struct SimState {
    block: u64,
    gas_price: U256,
    native: HashMap<Address, U256>,
    nonces: HashMap<Address, u64>,
    tokens: HashMap<Address, HashMap<Address, U256>>,
    contracts: HashMap<Address, Bytes>,
    receipts: HashMap<TxHash, TransactionReceipt>,
    revert_reasons: HashMap<TxHash, String>,
    sent: Vec<TxHash>,
    stall: bool,
    stall_after: Option<usize>,
    revert_next: Option<String>,
    scheduled_reverts: HashMap<usize, String>,
    failing_reads: HashSet<Address>,
    balance_reads: HashMap<Address, usize>,
}

enum Outcome {
    Success { gas_used: u64, created: Option<Address> },
    Revert { gas_used: u64, reason: String },
}

impl SimState {
    fn token_balance(&self, token: Address, holder: Address) -> U256 {
        self.tokens.get(&token).and_then(|balances| balances.get(&holder)).copied().unwrap_or_default()
    }

    fn execute(&mut self, from: Address, nonce: u64, to: Option<Address>, data: &[u8], value: U256, gas_limit: u64) -> Outcome {
        let calldata_gas = CALLDATA_BYTE_GAS.saturating_mul(data.len() as u64);
        let gas_needed = match to {
            None => CREATE_BASE_GAS + calldata_gas,
            Some(addr) if self.tokens.contains_key(&addr) => TOKEN_TRANSFER_GAS + calldata_gas,
            Some(_) => TX_BASE_GAS + calldata_gas,
        };
        if gas_needed > gas_limit {
            return Outcome::Revert { gas_used: gas_limit, reason: "out of gas".into() };
        }
        if let Some(reason) = self.revert_next.take() {
            return Outcome::Revert { gas_used: gas_needed, reason };
        }

        match to {
            None => {
                let address = get_contract_address(from, nonce);
                self.contracts.insert(address, Bytes::from(data.to_vec()));
                self.move_native(from, address, value);
                Outcome::Success { gas_used: gas_needed, created: Some(address) }
            }
            Some(token) if self.tokens.contains_key(&token) => {
                let (recipient, amount) = match LinkTokenInterfaceCalls::decode(data) {
                    Ok(LinkTokenInterfaceCalls::Transfer(call)) => (call.to, call.value),
                    Ok(LinkTokenInterfaceCalls::TransferAndCall(call)) => (call.to, call.value),
                    Ok(_) => return Outcome::Success { gas_used: gas_needed, created: None },
                    Err(_) => return Outcome::Revert { gas_used: gas_needed, reason: "unknown selector".into() },
                };
                let from_balance = self.token_balance(token, from);
                if from_balance < amount {
                    return Outcome::Revert {
                        gas_used: gas_needed,
                        reason: "ERC20: transfer amount exceeds balance".into(),
                    };
                }
                let balances = self.tokens.entry(token).or_default();
                balances.insert(from, from_balance - amount);
                *balances.entry(recipient).or_default() += amount;
                Outcome::Success { gas_used: gas_needed, created: None }
            }
            Some(recipient) => {
                self.move_native(from, recipient, value);
                Outcome::Success { gas_used: gas_needed, created: None }
            }
        }
    }

    fn move_native(&mut self, from: Address, to: Address, value: U256) {
        if value.is_zero() {
            return;
        }
        let balance = self.native.entry(from).or_default();
        *balance = balance.saturating_sub(value);
        *self.native.entry(to).or_default() += value;
    }
}

/// Handle to a simulated chain. Clones share the same state.
#[derive(Debug, Clone)]
pub struct SimulatedChain {
    state: Arc<Mutex<SimState>>,
    chain_id: u64,
    signer: Address,
    accounts: Vec<Address>,
    endpoint: String,
}

/// Seeds a [`SimulatedChain`].
#[derive(Debug, Clone)]
pub struct SimulatedChainBuilder {
    chain_id: u64,
    endpoint: String,
    signer: Address,
    gas_price: U256,
    start_block: u64,
    native: HashMap<Address, U256>,
    tokens: HashMap<Address, HashMap<Address, U256>>,
    nonces: HashMap<Address, u64>,
}

impl Default for SimulatedChainBuilder {
    fn default() -> Self {
        Self {
            chain_id: DEFAULT_SIM_CHAIN_ID,
            endpoint: DEFAULT_SIM_ENDPOINT.to_string(),
            signer: Address::repeat_byte(0x5a),
            gas_price: U256::exp10(9),
            start_block: 1,
            native: HashMap::new(),
            tokens: HashMap::new(),
            nonces: HashMap::new(),
        }
    }
}

impl SimulatedChainBuilder {
    pub fn chain_id(mut self, chain_id: u64) -> Self {
        self.chain_id = chain_id;
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn signer(mut self, signer: Address) -> Self {
        self.signer = signer;
        self
    }

    pub fn gas_price(mut self, gas_price: U256) -> Self {
        self.gas_price = gas_price;
        self
    }

    pub fn start_block(mut self, block: u64) -> Self {
        self.start_block = block;
        self
    }

    pub fn native_balance(mut self, holder: Address, amount: U256) -> Self {
        self.native.insert(holder, amount);
        self
    }

    /// Registers an ERC-20 token contract at `token`.
    pub fn token(mut self, token: Address) -> Self {
        self.tokens.entry(token).or_default();
        self
    }

    pub fn token_balance(mut self, token: Address, holder: Address, amount: U256) -> Self {
        self.tokens.entry(token).or_default().insert(holder, amount);
        self
    }

    pub fn nonce(mut self, holder: Address, nonce: u64) -> Self {
        self.nonces.insert(holder, nonce);
        self
    }

    /// The signer gets 100 ether unless a native balance was set for it.
    pub fn build(mut self) -> SimulatedChain {
        if !self.native.contains_key(&self.signer) {
            // 100 ether
            self.native.insert(self.signer, U256::exp10(20));
        }
        let state = SimState {
            block: self.start_block,
            gas_price: self.gas_price,
            native: self.native,
            nonces: self.nonces,
            tokens: self.tokens,
            ..Default::default()
        };
        SimulatedChain {
            state: Arc::new(Mutex::new(state)),
            chain_id: self.chain_id,
            signer: self.signer,
            accounts: vec![self.signer],
            endpoint: self.endpoint,
        }
    }
}

impl SimulatedChain {
    pub fn builder() -> SimulatedChainBuilder {
        SimulatedChainBuilder::default()
    }

    /// Same chain state, seen through another signer and endpoint.
    pub fn bound_to(&self, endpoint: impl Into<String>, signer: Address, accounts: Vec<Address>) -> Self {
        Self { state: self.state.clone(), chain_id: self.chain_id, signer, accounts, endpoint: endpoint.into() }
    }

    /// Copies what a rehearsal needs from a live client: signer balances, nonce, gas price and height.
    #[instrument(skip_all, name = "sim_fork")]
    pub async fn fork(client: &dyn ChainClient, token: &TokenContract) -> Result<Self, ProvisionError> {
        let signer = client.signer_address();
        let native = client.native_balance(signer).await?;
        let token_balance = query_balance(client, token, signer).await?;
        let nonce = client.transaction_count(signer).await?;
        let gas_price = client.gas_price().await?;
        let block = client.block_number().await?;
        info!(?signer, block, "Forked live signer state into simulated chain");

        let mut chain = Self::builder()
            .chain_id(client.chain_id())
            .endpoint(client.endpoint())
            .signer(signer)
            .gas_price(gas_price)
            .start_block(block)
            .native_balance(signer, native)
            .token_balance(token.address, signer, token_balance)
            .nonce(signer, nonce.as_u64())
            .build();
        chain.accounts = client.accounts();
        Ok(chain)
    }

    /// Profile matching this chain, with zero poll interval.
    pub fn profile(&self) -> NetworkProfile {
        NetworkProfile {
            name: "simulated".into(),
            endpoint: self.endpoint.clone(),
            network_id: NetworkId::Exact(self.chain_id),
            gas_limit: SIM_GAS_LIMIT,
            gas_price: None,
            confirmations: 0,
            timeout_blocks: 50,
            dry_run: false,
            poll_interval: Duration::ZERO,
        }
    }

    // --- fault injection ---

    /// The next mined transaction fails with `reason`.
    pub async fn revert_next(&self, reason: impl Into<String>) {
        self.state.lock().await.revert_next = Some(reason.into());
    }

    /// While set, transactions are accepted but never mined.
    pub async fn stall_inclusion(&self, stall: bool) {
        self.state.lock().await.stall = stall;
    }

    /// Send number `index` (0-based, counting every accepted send) fails with `reason`.
    pub async fn revert_nth(&self, index: usize, reason: impl Into<String>) {
        self.state.lock().await.scheduled_reverts.insert(index, reason.into());
    }

    /// The first `mined` sends are mined as usual; later ones are accepted but never mined.
    pub async fn stall_after(&self, mined: usize) {
        self.state.lock().await.stall_after = Some(mined);
    }

    /// `balanceOf(holder)` reads fail with a network error.
    pub async fn fail_balance_reads_for(&self, holder: Address) {
        self.state.lock().await.failing_reads.insert(holder);
    }

    // --- inspection ---

    pub async fn token_balance(&self, token: Address, holder: Address) -> U256 {
        self.state.lock().await.token_balance(token, holder)
    }

    pub async fn native_balance_of(&self, holder: Address) -> U256 {
        self.state.lock().await.native.get(&holder).copied().unwrap_or_default()
    }

    /// How many `balanceOf(holder)` reads were served or failed.
    pub async fn balance_reads_for(&self, holder: Address) -> usize {
        self.state.lock().await.balance_reads.get(&holder).copied().unwrap_or_default()
    }

    pub async fn contract_count(&self) -> usize {
        self.state.lock().await.contracts.len()
    }

    pub async fn transactions_sent(&self) -> usize {
        self.state.lock().await.sent.len()
    }

    /// Constructor arguments the contract at `address` was created with.
    pub async fn constructor_args(&self, address: Address, artifact: &GameArtifact) -> Option<GameConstructorArgs> {
        let state = self.state.lock().await;
        let code = state.contracts.get(&address)?;
        decode_constructor_args(&artifact.bytecode, code)
    }

    fn tx_hash(&self, from: Address, nonce: u64) -> TxHash {
        let encoded = ethers::abi::encode(&[
            Token::Uint(U256::from(self.chain_id)),
            Token::Address(from),
            Token::Uint(U256::from(nonce)),
        ]);
        H256::from(keccak256(encoded))
    }
}

fn target_of(tx: &TypedTransaction) -> Result<Option<Address>, ProvisionError> {
    match tx.to() {
        None => Ok(None),
        Some(NameOrAddress::Address(addr)) => Ok(Some(*addr)),
        Some(NameOrAddress::Name(name)) => Err(ProvisionError::network(format!("cannot resolve name {name}"))),
    }
}

#[async_trait]
impl ChainClient for SimulatedChain {
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

    /// Every poll mines one empty block.
    async fn block_number(&self) -> Result<u64, ProvisionError> {
        let mut state = self.state.lock().await;
        state.block += 1;
        Ok(state.block)
    }

    async fn native_balance(&self, owner: Address) -> Result<U256, ProvisionError> {
        Ok(self.native_balance_of(owner).await)
    }

    async fn gas_price(&self) -> Result<U256, ProvisionError> {
        Ok(self.state.lock().await.gas_price)
    }

    async fn transaction_count(&self, owner: Address) -> Result<U256, ProvisionError> {
        Ok(U256::from(self.state.lock().await.nonces.get(&owner).copied().unwrap_or_default()))
    }

    async fn send(&self, tx: TypedTransaction) -> Result<TxHash, ProvisionError> {
        let from = tx.from().copied().unwrap_or(self.signer);
        if from != self.signer {
            return Err(ProvisionError::network(format!("unknown account {from:?}")));
        }
        let to = target_of(&tx)?;
        let data = tx.data().cloned().unwrap_or_default();
        let value = tx.value().copied().unwrap_or_default();

        let mut state = self.state.lock().await;
        let expected = state.nonces.get(&from).copied().unwrap_or_default();
        let nonce = tx.nonce().map(|n| n.as_u64()).unwrap_or(expected);
        if nonce < expected {
            return Err(ProvisionError::network(format!("nonce too low: next nonce {expected}, tx nonce {nonce}")));
        }
        if nonce > expected {
            return Err(ProvisionError::network(format!("nonce too high: next nonce {expected}, tx nonce {nonce}")));
        }

        let gas_limit = tx.gas().copied().unwrap_or_else(|| U256::from(SIM_GAS_LIMIT));
        let gas_price = tx.gas_price().unwrap_or(state.gas_price);
        let required = gas_limit.saturating_mul(gas_price).saturating_add(value);
        let available = state.native.get(&from).copied().unwrap_or_default();
        if available < required {
            return Err(ProvisionError::InsufficientFunds { required, available });
        }

        state.nonces.insert(from, expected + 1);
        let tx_hash = self.tx_hash(from, nonce);
        let index = state.sent.len();
        state.sent.push(tx_hash);
        if state.stall || state.stall_after.is_some_and(|mined| index >= mined) {
            debug!(?tx_hash, "Stalled: transaction accepted but not mined");
            return Ok(tx_hash);
        }

        if let Some(reason) = state.scheduled_reverts.remove(&index) {
            state.revert_next = Some(reason);
        }
        state.block += 1;
        let block = state.block;
        let outcome = state.execute(from, nonce, to, &data, value, gas_limit.low_u64());
        let (gas_used, status, created) = match outcome {
            Outcome::Success { gas_used, created } => (gas_used, 1u64, created),
            Outcome::Revert { gas_used, reason } => {
                state.revert_reasons.insert(tx_hash, reason);
                (gas_used, 0u64, None)
            }
        };
        let fee = U256::from(gas_used).saturating_mul(gas_price);
        if let Some(balance) = state.native.get_mut(&from) {
            *balance = balance.saturating_sub(fee);
        }

        let receipt = TransactionReceipt {
            transaction_hash: tx_hash,
            block_number: Some(U64::from(block)),
            from,
            to,
            contract_address: created,
            gas_used: Some(U256::from(gas_used)),
            cumulative_gas_used: U256::from(gas_used),
            effective_gas_price: Some(gas_price),
            status: Some(U64::from(status)),
            ..Default::default()
        };
        debug!(?tx_hash, block, status, "Simulated transaction mined");
        state.receipts.insert(tx_hash, receipt);
        Ok(tx_hash)
    }

    async fn receipt(&self, tx_hash: TxHash) -> Result<Option<TransactionReceipt>, ProvisionError> {
        Ok(self.state.lock().await.receipts.get(&tx_hash).cloned())
    }

    async fn call(&self, tx: &TypedTransaction) -> Result<Bytes, ProvisionError> {
        let to = target_of(tx)?.ok_or_else(|| ProvisionError::network("call without target"))?;
        let data = tx.data().cloned().unwrap_or_default();
        let mut state = self.state.lock().await;
        if !state.tokens.contains_key(&to) {
            return Err(ProvisionError::Revert { tx_hash: None, reason: Some(format!("no token at {to:?}")) });
        }
        match LinkTokenInterfaceCalls::decode(&data) {
            Ok(LinkTokenInterfaceCalls::BalanceOf(call)) => {
                *state.balance_reads.entry(call.owner).or_default() += 1;
                if state.failing_reads.contains(&call.owner) {
                    return Err(ProvisionError::network("simulated connection reset"));
                }
                Ok(state.token_balance(to, call.owner).encode().into())
            }
            Ok(LinkTokenInterfaceCalls::Decimals(_)) => Ok(U256::from(18u64).encode().into()),
            _ => Err(ProvisionError::Revert { tx_hash: None, reason: Some("unsupported call".into()) }),
        }
    }

    async fn revert_reason(&self, receipt: &TransactionReceipt) -> Option<String> {
        self.state.lock().await.revert_reasons.get(&receipt.transaction_hash).cloned()
    }
}

/// [`SignerProvider`] that derives the signer from the mnemonic like the live
/// provider does, then binds it to a [`SimulatedChain`] instead of a node.
#[derive(Debug, Clone)]
pub struct SimulatedSignerProvider {
    chain: SimulatedChain,
    selection: AccountSelection,
}

impl SimulatedSignerProvider {
    pub fn new(chain: SimulatedChain, selection: AccountSelection) -> Self {
        Self { chain, selection }
    }
}

#[async_trait]
impl SignerProvider for SimulatedSignerProvider {
    async fn create_signer(
        &self,
        secrets: &Secrets,
        profile: &NetworkProfile,
    ) -> Result<Box<dyn ChainClient>, ProvisionError> {
        let wallets = derive_wallets(secrets, self.selection, self.chain.chain_id)?;
        let accounts: Vec<Address> = wallets.iter().map(|w| w.address()).collect();
        let signer = accounts[self.selection.index as usize];
        if !profile.network_id.accepts(self.chain.chain_id) {
            return Err(ProvisionError::configuration(format!(
                "network {} expects chain id {} but the node reports {}",
                profile.name, profile.network_id, self.chain.chain_id
            )));
        }
        Ok(Box::new(self.chain.bound_to(profile.endpoint.clone(), signer, accounts)))
    }
}
