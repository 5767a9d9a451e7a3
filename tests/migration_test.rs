// tests/migration_test.rs
// End-to-end runs of the provisioning state machine against the in-memory chain.

use ethers::{
    abi::Abi,
    signers::Signer,
    types::{Address, U256},
    utils::{get_contract_address, parse_ether},
};
use eyre::Result;
use game_provision::{
    artifact::GameArtifact,
    config::{AppConfig, FundingPolicy, MigrationPlan, Secrets},
    funding::fund,
    migration::{preview, MigrationOutcome, StateKind},
    signer::{derive_wallets, AccountSelection},
    transaction::NonceManager,
    verify::TokenContract,
    ChainClient, Migrator, SimulatedChain, SimulatedSignerProvider, KOVAN_LINK_TOKEN,
};
use std::io::Write;

// --- Fixtures ---

const DEV_MNEMONIC: &str = "test test test test test test test test test test test junk";

const CONFIG: &str = r#"
[networks.testnet]
endpoint = "http://127.0.0.1:8545"
network_id = 1337
confirmations = 2
timeout_blocks = 200
poll_interval_ms = 0

[networks.rehearsed]
endpoint = "http://127.0.0.1:8545"
network_id = 1337
confirmations = 2
timeout_blocks = 200
poll_interval_ms = 0
dry_run = true

[networks.wrongchain]
endpoint = "http://127.0.0.1:8545"
network_id = 42
poll_interval_ms = 0

[migration]
participant_count = 3
stake_amount = "0.001"
funding_amount = "0.5"
"#;

const GAME_ABI: &str = r#"[
    {"type":"constructor","stateMutability":"nonpayable","inputs":[
        {"name":"_participants","type":"uint256","internalType":"uint256"},
        {"name":"_stake","type":"uint256","internalType":"uint256"}]}
]"#;

const GAME_BYTECODE: &str = "0x6080604052348015600f57600080fd5b50";

fn artifact() -> GameArtifact {
    let abi: Abi = serde_json::from_str(GAME_ABI).expect("abi");
    GameArtifact::from_parts("GamblingGame", abi, GAME_BYTECODE).expect("artifact")
}

fn secrets() -> Secrets {
    Secrets { mnemonic: Some(DEV_MNEMONIC.into()), ..Default::default() }
}

fn config() -> AppConfig {
    AppConfig::from_toml_str(CONFIG, secrets()).expect("test config")
}

fn signer() -> Address {
    derive_wallets(&secrets(), AccountSelection::default(), 1337).expect("wallet")[0].address()
}

fn funding() -> U256 {
    parse_ether("0.5").unwrap()
}

/// Chain where the signer holds 100 ether and 10 LINK.
fn funded_chain() -> SimulatedChain {
    SimulatedChain::builder()
        .signer(signer())
        .token_balance(*KOVAN_LINK_TOKEN, signer(), parse_ether(10u64).unwrap())
        .build()
}

async fn run(chain: &SimulatedChain, config: &AppConfig, network: &str) -> MigrationOutcome {
    let provider = SimulatedSignerProvider::new(chain.clone(), AccountSelection::default());
    Migrator::new(config, &provider).with_artifact(artifact()).run(network).await
}

fn failure_kind(outcome: &MigrationOutcome) -> (StateKind, &'static str, Option<Address>) {
    let failure = outcome.failure().expect("run should have failed");
    (failure.at, failure.error.kind(), failure.game)
}

// --- Happy path ---

#[tokio::test]
async fn full_run_deploys_funds_and_verifies() -> Result<()> {
    let chain = funded_chain();
    let outcome = run(&chain, &config(), "testnet").await;

    assert_eq!(
        outcome.history,
        vec![
            StateKind::Idle,
            StateKind::NetworkResolved,
            StateKind::Signed,
            StateKind::Deployed,
            StateKind::Funded,
            StateKind::Verified,
            StateKind::Done,
        ]
    );
    let report = outcome.report().expect("done");
    assert_ne!(report.game, Address::zero());
    assert_eq!(report.deployer, signer());
    assert_eq!(report.funding.amount, funding());
    assert_eq!(report.balance.map(|b| b.amount), Some(funding()));
    assert_eq!(chain.token_balance(*KOVAN_LINK_TOKEN, report.game).await, funding());
    assert_eq!(chain.token_balance(*KOVAN_LINK_TOKEN, signer()).await, parse_ether(10u64)? - funding());

    let args = chain.constructor_args(report.game, &artifact()).await.expect("game code");
    assert_eq!(args.participant_count, 3);
    assert_eq!(args.stake_amount, U256::exp10(15));
    Ok(())
}

#[tokio::test]
async fn report_serializes_for_operators() -> Result<()> {
    let chain = funded_chain();
    let outcome = run(&chain, &config(), "testnet").await;
    let json = serde_json::to_value(outcome.report().expect("done"))?;
    assert_eq!(json["network"], "testnet");
    assert_eq!(json["chain_id"], 1337);
    assert!(json["started_at"].is_string());
    Ok(())
}

#[tokio::test]
async fn artifact_is_read_from_the_configured_path() -> Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    write!(file, r#"{{"contractName":"GamblingGame","abi":{GAME_ABI},"bytecode":"{GAME_BYTECODE}"}}"#)?;

    let mut config = config();
    config.plan.artifact_path = file.path().to_path_buf();
    let chain = funded_chain();
    let provider = SimulatedSignerProvider::new(chain.clone(), AccountSelection::default());
    let outcome = Migrator::new(&config, &provider).run("testnet").await;
    assert!(outcome.is_done(), "{:?}", outcome.failure().map(|f| f.to_string()));
    Ok(())
}

// --- Non-idempotence ---

#[tokio::test]
async fn rerunning_deploys_a_distinct_contract_and_funds_it_again() {
    let chain = funded_chain();
    let config = config();
    let first = run(&chain, &config, "testnet").await.report().cloned().expect("first run");
    let second = run(&chain, &config, "testnet").await.report().cloned().expect("second run");

    assert_ne!(first.game, second.game);
    assert_eq!(chain.contract_count().await, 2);
    assert_eq!(chain.token_balance(*KOVAN_LINK_TOKEN, signer()).await, parse_ether(9u64).unwrap());
}

#[tokio::test]
async fn funding_twice_transfers_twice() {
    let chain = funded_chain();
    let profile = chain.profile();
    let nonces = NonceManager::new(chain.signer_address());
    let token = TokenContract { address: *KOVAN_LINK_TOKEN, decimals: 18 };
    let recipient = Address::repeat_byte(0x42);

    fund(&chain, &nonces, &profile, &token, recipient, funding()).await.unwrap();
    assert_eq!(chain.token_balance(token.address, recipient).await, funding());
    fund(&chain, &nonces, &profile, &token, recipient, funding()).await.unwrap();
    assert_eq!(chain.token_balance(token.address, recipient).await, funding() * 2);
    assert_eq!(chain.token_balance(token.address, signer()).await, parse_ether(9u64).unwrap());
}

#[tokio::test]
async fn top_up_policy_only_sends_the_shortfall() {
    let game = get_contract_address(signer(), 0u64);
    let chain = SimulatedChain::builder()
        .signer(signer())
        .token_balance(*KOVAN_LINK_TOKEN, signer(), parse_ether(10u64).unwrap())
        .token_balance(*KOVAN_LINK_TOKEN, game, parse_ether("0.2").unwrap())
        .build();
    let mut config = config();
    config.plan.funding_policy = FundingPolicy::TopUp;

    let report = run(&chain, &config, "testnet").await.report().cloned().expect("done");
    assert_eq!(report.game, game);
    assert_eq!(report.funding.amount, parse_ether("0.3").unwrap());
    assert_eq!(chain.token_balance(*KOVAN_LINK_TOKEN, game).await, funding());
}

#[tokio::test]
async fn unconditional_policy_overfunds_a_prefunded_game() {
    let game = get_contract_address(signer(), 0u64);
    let chain = SimulatedChain::builder()
        .signer(signer())
        .token_balance(*KOVAN_LINK_TOKEN, signer(), parse_ether(10u64).unwrap())
        .token_balance(*KOVAN_LINK_TOKEN, game, parse_ether("0.2").unwrap())
        .build();

    let report = run(&chain, &config(), "testnet").await.report().cloned().expect("done");
    assert_eq!(report.funding.amount, funding());
    assert_eq!(chain.token_balance(*KOVAN_LINK_TOKEN, game).await, parse_ether("0.7").unwrap());
}

#[tokio::test]
async fn only_a_top_up_reads_the_game_balance_before_funding() {
    let game = get_contract_address(signer(), 0u64);

    let chain = funded_chain();
    assert!(run(&chain, &config(), "testnet").await.is_done());
    assert_eq!(chain.balance_reads_for(game).await, 1, "verification read only");

    let chain = funded_chain();
    let mut config = config();
    config.plan.funding_policy = FundingPolicy::TopUp;
    assert!(run(&chain, &config, "testnet").await.is_done());
    assert_eq!(chain.balance_reads_for(game).await, 2);
}

// --- Preconditions ---

#[tokio::test]
async fn insufficient_native_balance_stops_before_deploying() {
    let chain = SimulatedChain::builder()
        .signer(signer())
        .native_balance(signer(), U256::from(1_000u64))
        .token_balance(*KOVAN_LINK_TOKEN, signer(), parse_ether(10u64).unwrap())
        .build();
    let outcome = run(&chain, &config(), "testnet").await;

    assert_eq!(failure_kind(&outcome), (StateKind::Signed, "InsufficientFundsError", None));
    assert_eq!(chain.contract_count().await, 0);
    assert_eq!(chain.transactions_sent().await, 0);
}

#[tokio::test]
async fn insufficient_token_balance_leaves_the_game_unfunded() {
    let chain = SimulatedChain::builder()
        .signer(signer())
        .token_balance(*KOVAN_LINK_TOKEN, signer(), parse_ether("0.1").unwrap())
        .build();
    let outcome = run(&chain, &config(), "testnet").await;

    let (at, kind, game) = failure_kind(&outcome);
    assert_eq!((at, kind), (StateKind::Deployed, "InsufficientTokenBalanceError"));
    let game = game.expect("game was deployed before funding failed");
    assert_eq!(chain.token_balance(*KOVAN_LINK_TOKEN, game).await, U256::zero());
    assert_eq!(chain.transactions_sent().await, 1);
}

// --- Confirmation failures ---

#[tokio::test]
async fn stalled_deployment_times_out_and_skips_funding() {
    let chain = funded_chain();
    chain.stall_inclusion(true).await;
    let outcome = run(&chain, &config(), "testnet").await;

    assert_eq!(failure_kind(&outcome), (StateKind::Signed, "TimeoutError", None));
    assert!(!outcome.history.contains(&StateKind::Funded));
    assert_eq!(chain.transactions_sent().await, 1);
    assert_eq!(chain.token_balance(*KOVAN_LINK_TOKEN, signer()).await, parse_ether(10u64).unwrap());
}

#[tokio::test]
async fn constructor_revert_carries_the_reason() {
    let chain = funded_chain();
    chain.revert_next("N must be at least 2").await;
    let outcome = run(&chain, &config(), "testnet").await;

    assert_eq!(failure_kind(&outcome), (StateKind::Signed, "RevertError", None));
    let message = outcome.failure().unwrap().error.to_string();
    assert!(message.contains("N must be at least 2"), "{message}");
    assert_eq!(chain.contract_count().await, 0);
}

#[tokio::test]
async fn stalled_funding_times_out_after_deployment() {
    let chain = funded_chain();
    chain.stall_after(1).await;
    let outcome = run(&chain, &config(), "testnet").await;

    let game = get_contract_address(signer(), 0u64);
    assert_eq!(failure_kind(&outcome), (StateKind::Deployed, "TimeoutError", Some(game)));
    assert!(!outcome.history.contains(&StateKind::Verified));
    assert_eq!(chain.contract_count().await, 1);
    assert_eq!(chain.transactions_sent().await, 2);
    assert_eq!(chain.token_balance(*KOVAN_LINK_TOKEN, game).await, U256::zero());
    assert_eq!(chain.token_balance(*KOVAN_LINK_TOKEN, signer()).await, parse_ether(10u64).unwrap());
}

#[tokio::test]
async fn rejected_transfer_reverts_after_deployment() {
    let chain = funded_chain();
    chain.revert_nth(1, "transfer hook rejected").await;
    let outcome = run(&chain, &config(), "testnet").await;

    let game = get_contract_address(signer(), 0u64);
    assert_eq!(failure_kind(&outcome), (StateKind::Deployed, "RevertError", Some(game)));
    assert!(!outcome.history.contains(&StateKind::Verified));
    let message = outcome.failure().unwrap().to_string();
    assert!(message.contains("transfer hook rejected"), "{message}");
    assert!(message.contains("game already deployed"), "{message}");
    assert_eq!(chain.token_balance(*KOVAN_LINK_TOKEN, game).await, U256::zero());
    assert_eq!(chain.token_balance(*KOVAN_LINK_TOKEN, signer()).await, parse_ether(10u64).unwrap());
}

// --- Verification ---

#[tokio::test]
async fn failed_verification_read_still_completes() {
    let chain = funded_chain();
    let game = get_contract_address(signer(), 0u64);
    chain.fail_balance_reads_for(game).await;
    let outcome = run(&chain, &config(), "testnet").await;

    let report = outcome.report().expect("verification failures are not fatal");
    assert_eq!(report.game, game);
    assert!(report.balance.is_none());
    assert_eq!(chain.token_balance(*KOVAN_LINK_TOKEN, game).await, funding());
}

// --- Configuration and signer ---

#[tokio::test]
async fn missing_mnemonic_fails_before_any_transaction() {
    let chain = funded_chain();
    let mut config = config();
    config.secrets.mnemonic = None;
    let outcome = run(&chain, &config, "testnet").await;

    assert_eq!(failure_kind(&outcome), (StateKind::NetworkResolved, "ConfigurationError", None));
    assert_eq!(chain.transactions_sent().await, 0);
}

#[tokio::test]
async fn unknown_network_fails_in_idle() {
    let outcome = run(&funded_chain(), &config(), "mainnet").await;
    assert_eq!(failure_kind(&outcome), (StateKind::Idle, "ConfigurationError", None));
    assert_eq!(outcome.history, vec![StateKind::Idle, StateKind::Failed]);
}

#[tokio::test]
async fn chain_id_mismatch_is_rejected() {
    let outcome = run(&funded_chain(), &config(), "wrongchain").await;
    assert_eq!(failure_kind(&outcome), (StateKind::NetworkResolved, "ConfigurationError", None));
}

// --- Dry run ---

#[tokio::test]
async fn dry_run_rehearses_then_deploys_once() {
    let chain = funded_chain();
    let outcome = run(&chain, &config(), "rehearsed").await;

    assert!(outcome.is_done());
    assert_eq!(chain.contract_count().await, 1);
    assert_eq!(chain.transactions_sent().await, 2);
}

#[tokio::test]
async fn failed_rehearsal_broadcasts_nothing() {
    let chain = SimulatedChain::builder()
        .signer(signer())
        .token_balance(*KOVAN_LINK_TOKEN, signer(), parse_ether("0.1").unwrap())
        .build();
    let outcome = run(&chain, &config(), "rehearsed").await;

    assert_eq!(failure_kind(&outcome), (StateKind::Signed, "InsufficientTokenBalanceError", None));
    assert_eq!(chain.transactions_sent().await, 0);
}

// --- Preview ---

#[tokio::test]
async fn preview_runs_without_a_build_directory() {
    let outcome = preview(MigrationPlan::default(), None).await.unwrap();

    assert!(outcome.is_done(), "{:?}", outcome.failure().map(|f| f.to_string()));
    let report = outcome.report().unwrap();
    assert_eq!(report.funding.amount, funding());
    assert_eq!(report.balance.map(|b| b.amount), Some(funding()));
}

#[tokio::test]
async fn preview_with_missing_artifact_fails_in_idle() {
    let missing = std::path::Path::new("/definitely/not/GamblingGame.json");
    let outcome = preview(MigrationPlan::default(), Some(missing)).await.unwrap();
    assert_eq!(failure_kind(&outcome), (StateKind::Idle, "ConfigurationError", None));
}
