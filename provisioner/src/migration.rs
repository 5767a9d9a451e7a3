// provisioner/src/migration.rs
//
// Drives one provisioning run:
// Idle -> NetworkResolved -> Signed -> Deployed -> Funded -> Verified -> Done,
// with Failed reachable from every non-terminal state. One blocking step per
// transition; nothing already broadcast is rolled back.

use crate::artifact::GameArtifact;
use crate::client::ChainClient;
use crate::config::{AppConfig, FundingPolicy, MigrationPlan, NetworkProfile, NetworkRegistry, Secrets};
use crate::deploy::{deploy_game, DeployedGame, GameConstructorArgs};
use crate::error::ProvisionError;
use crate::funding::{amount_to_send, fund};
use crate::signer::{derive_wallets, AccountSelection, SignerProvider};
use crate::simulation::{SimulatedChain, SimulatedSignerProvider, DEFAULT_SIM_CHAIN_ID};
use crate::transaction::NonceManager;
use crate::utils::format_units;
use crate::verify::{observe_balance, query_balance, BalanceObservation, TokenContract};
use chrono::{DateTime, Utc};
use ethers::{
    signers::{
        coins_bip39::{English, Mnemonic},
        Signer,
    },
    types::{Address, TxHash, U256},
};
use rand::thread_rng;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Built-in profile the preview runs under.
pub const PREVIEW_NETWORK: &str = "develop";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StateKind {
    Idle,
    NetworkResolved,
    Signed,
    Deployed,
    Funded,
    Verified,
    Done,
    Failed,
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Everything a run holds once the signer exists. Dropping it closes the connection.
pub struct Session {
    pub profile: NetworkProfile,
    pub artifact: GameArtifact,
    pub client: Box<dyn ChainClient>,
    pub nonces: NonceManager,
    pub token: TokenContract,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("network", &self.profile.name)
            .field("endpoint", &self.client.endpoint())
            .field("signer", &self.client.signer_address())
            .field("token", &self.token.address)
            .finish()
    }
}

/// Result of the funding step. `tx_hash` is `None` when a top-up found nothing missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FundingRecord {
    pub tx_hash: Option<TxHash>,
    pub amount: U256,
}

/// Where a run stopped and why.
#[derive(Debug)]
pub struct Failure {
    pub at: StateKind,
    pub error: ProvisionError,
    /// Set when the game was already deployed; the operator must reconcile it by hand.
    pub game: Option<Address>,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in state {}: {}", self.error.kind(), self.at, self.error)?;
        if let Some(game) = self.game {
            write!(f, " (game already deployed at {game:?})")?;
        }
        Ok(())
    }
}

/// Operator-facing summary of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub network: String,
    pub chain_id: u64,
    pub deployer: Address,
    pub game: Address,
    pub constructor_args: GameConstructorArgs,
    pub deploy_tx: TxHash,
    pub deploy_block: u64,
    pub token: Address,
    pub funding: FundingRecord,
    /// `None` when the post-funding read failed; the transfer itself was confirmed.
    pub balance: Option<BalanceObservation>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum MigrationState {
    Idle,
    NetworkResolved { profile: NetworkProfile, artifact: GameArtifact },
    Signed(Session),
    Deployed { session: Session, game: DeployedGame },
    Funded { session: Session, game: DeployedGame, funding: FundingRecord },
    Verified { session: Session, game: DeployedGame, funding: FundingRecord, balance: Option<BalanceObservation> },
    Done(MigrationReport),
    Failed(Failure),
}

impl MigrationState {
    pub fn kind(&self) -> StateKind {
        match self {
            Self::Idle => StateKind::Idle,
            Self::NetworkResolved { .. } => StateKind::NetworkResolved,
            Self::Signed(_) => StateKind::Signed,
            Self::Deployed { .. } => StateKind::Deployed,
            Self::Funded { .. } => StateKind::Funded,
            Self::Verified { .. } => StateKind::Verified,
            Self::Done(_) => StateKind::Done,
            Self::Failed(_) => StateKind::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Failed(_))
    }

    fn game_address(&self) -> Option<Address> {
        match self {
            Self::Deployed { game, .. } | Self::Funded { game, .. } | Self::Verified { game, .. } => Some(game.address),
            _ => None,
        }
    }
}

/// Terminal state of a run plus every state it passed through.
#[derive(Debug)]
pub struct MigrationOutcome {
    pub state: MigrationState,
    pub history: Vec<StateKind>,
}

impl MigrationOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self.state, MigrationState::Done(_))
    }

    pub fn report(&self) -> Option<&MigrationReport> {
        match &self.state {
            MigrationState::Done(report) => Some(report),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&Failure> {
        match &self.state {
            MigrationState::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Runs the provisioning state machine for one network.
pub struct Migrator<'a, P: ?Sized> {
    config: &'a AppConfig,
    provider: &'a P,
    artifact: Option<GameArtifact>,
}

impl<'a, P: SignerProvider + ?Sized> Migrator<'a, P> {
    pub fn new(config: &'a AppConfig, provider: &'a P) -> Self {
        Self { config, provider, artifact: None }
    }

    /// Uses `artifact` instead of loading `plan.artifact_path`.
    pub fn with_artifact(mut self, artifact: GameArtifact) -> Self {
        self.artifact = Some(artifact);
        self
    }

    #[instrument(skip(self), name = "migration")]
    pub async fn run(&self, network: &str) -> MigrationOutcome {
        let started_at = Utc::now();
        let mut state = MigrationState::Idle;
        let mut history = vec![StateKind::Idle];

        while !state.is_terminal() {
            let from = state.kind();
            let game = state.game_address();
            state = match self.advance(state, network, started_at).await {
                Ok(next) => next,
                Err(error) => {
                    let failure = Failure { at: from, error, game };
                    error!(state = %from, kind = failure.error.kind(), error = %failure.error, game = ?game, "❌ Migration failed");
                    MigrationState::Failed(failure)
                }
            };
            info!(from = %from, to = %state.kind(), "State transition");
            history.push(state.kind());
        }

        MigrationOutcome { state, history }
    }

    async fn advance(
        &self,
        state: MigrationState,
        network: &str,
        started_at: DateTime<Utc>,
    ) -> Result<MigrationState, ProvisionError> {
        let plan = &self.config.plan;
        match state {
            MigrationState::Idle => {
                let profile = self.config.registry.resolve(network, &self.config.secrets)?;
                let artifact = match &self.artifact {
                    Some(artifact) => artifact.clone(),
                    None => GameArtifact::load(&plan.artifact_path)?,
                };
                info!(network = %profile.name, endpoint = %profile.endpoint, contract = %artifact.name, "Network resolved");
                Ok(MigrationState::NetworkResolved { profile, artifact })
            }

            MigrationState::NetworkResolved { profile, artifact } => {
                let client = self.provider.create_signer(&self.config.secrets, &profile).await?;
                let nonces = NonceManager::new(client.signer_address());
                let token = TokenContract { address: plan.token, decimals: plan.token_decimals };
                info!(signer = ?client.signer_address(), chain_id = client.chain_id(), "Signer ready");
                Ok(MigrationState::Signed(Session { profile, artifact, client, nonces, token }))
            }

            MigrationState::Signed(session) => {
                if session.profile.dry_run {
                    rehearse(&session, plan.constructor_args, plan.funding_amount, plan.funding_policy).await?;
                }
                let game = deploy_game(
                    session.client.as_ref(),
                    &session.nonces,
                    &session.artifact,
                    plan.constructor_args,
                    &session.profile,
                )
                .await?;
                info!("contract deployed at {:?}", game.address);
                Ok(MigrationState::Deployed { session, game })
            }

            MigrationState::Deployed { session, game } => {
                let client = session.client.as_ref();
                let amount = funding_amount(client, &session.token, game.address, plan.funding_amount, plan.funding_policy)
                    .await?;
                let funding = if amount.is_zero() {
                    info!("Game already holds the funding amount; no transfer sent");
                    FundingRecord { tx_hash: None, amount }
                } else {
                    let receipt =
                        fund(client, &session.nonces, &session.profile, &session.token, game.address, amount).await?;
                    FundingRecord { tx_hash: Some(receipt.transaction_hash), amount }
                };
                Ok(MigrationState::Funded { session, game, funding })
            }

            MigrationState::Funded { session, game, funding } => {
                let balance = match observe_balance(session.client.as_ref(), &session.token, game.address).await {
                    Ok(observation) => {
                        info!(
                            "token balance of {:?}: {}",
                            game.address,
                            format_units(observation.amount, session.token.decimals)
                        );
                        Some(observation)
                    }
                    Err(e) => {
                        // Funds already moved; the read is informational only.
                        warn!(error = %e, retryable = e.is_retryable_read(), "Balance verification failed");
                        None
                    }
                };
                Ok(MigrationState::Verified { session, game, funding, balance })
            }

            MigrationState::Verified { session, game, funding, balance } => {
                let report = MigrationReport {
                    network: session.profile.name.clone(),
                    chain_id: session.client.chain_id(),
                    deployer: session.client.signer_address(),
                    game: game.address,
                    constructor_args: game.args,
                    deploy_tx: game.tx_hash,
                    deploy_block: game.block_number,
                    token: session.token.address,
                    funding,
                    balance,
                    started_at,
                    finished_at: Utc::now(),
                };
                info!(game = ?report.game, "✅ Migration complete");
                Ok(MigrationState::Done(report))
            }

            terminal @ (MigrationState::Done(_) | MigrationState::Failed(_)) => Ok(terminal),
        }
    }
}

/// How much the funding step sends. Only a top-up reads the game's balance first.
async fn funding_amount(
    client: &dyn ChainClient,
    token: &TokenContract,
    game: Address,
    target: U256,
    policy: FundingPolicy,
) -> Result<U256, ProvisionError> {
    match policy {
        FundingPolicy::TopUp => {
            let existing = query_balance(client, token, game).await?;
            if !existing.is_zero() {
                warn!(existing = %format_units(existing, token.decimals), "Game already holds tokens; topping up");
            }
            Ok(amount_to_send(policy, target, existing))
        }
        FundingPolicy::Unconditional => Ok(target),
    }
}

/// Replays deploy, fund and verify on a fork of the signer's live state.
/// Nothing reaches the live network.
#[instrument(skip_all, name = "dry_run", fields(network = %session.profile.name))]
async fn rehearse(
    session: &Session,
    args: GameConstructorArgs,
    amount: U256,
    policy: FundingPolicy,
) -> Result<(), ProvisionError> {
    info!("Rehearsing migration on a simulated fork...");
    let fork = SimulatedChain::fork(session.client.as_ref(), &session.token).await?;
    let nonces = NonceManager::new(fork.signer_address());
    let profile = NetworkProfile { poll_interval: Duration::ZERO, ..session.profile.clone() };

    let game = deploy_game(&fork, &nonces, &session.artifact, args, &profile).await?;
    let amount = amount_to_send(policy, amount, U256::zero());
    if !amount.is_zero() {
        fund(&fork, &nonces, &profile, &session.token, game.address, amount).await?;
    }
    let balance = query_balance(&fork, &session.token, game.address).await?;
    info!(balance = %format_units(balance, session.token.decimals), "✅ Dry run passed");
    Ok(())
}

/// Full run on a fresh [`SimulatedChain`] under a random mnemonic, with the
/// signer holding ten times the funding amount. Without `artifact_path` the
/// built-in [`GameArtifact::preview`] stands in for the compiled game.
#[instrument(skip_all, name = "preview")]
pub async fn preview(mut plan: MigrationPlan, artifact_path: Option<&Path>) -> Result<MigrationOutcome, ProvisionError> {
    let phrase = Mnemonic::<English>::new(&mut thread_rng()).to_phrase();
    let secrets = Secrets { mnemonic: Some(phrase), ..Default::default() };
    let selection = AccountSelection::from(&plan);
    let signer = derive_wallets(&secrets, selection, DEFAULT_SIM_CHAIN_ID)?
        .get(selection.index as usize)
        .map(|wallet| wallet.address())
        .ok_or_else(|| ProvisionError::configuration("signer account was not derived"))?;
    info!(?signer, "Generated throwaway signer");

    let registry = NetworkRegistry::builtin();
    let profile = registry.resolve(PREVIEW_NETWORK, &secrets)?;
    let chain = SimulatedChain::builder()
        .endpoint(profile.endpoint)
        .signer(signer)
        .token_balance(plan.token, signer, plan.funding_amount.saturating_mul(U256::from(10u64)))
        .build();
    let provider = SimulatedSignerProvider::new(chain, selection);

    let artifact = match artifact_path {
        Some(path) => {
            plan.artifact_path = path.to_path_buf();
            None
        }
        None => Some(GameArtifact::preview()?),
    };
    let config = AppConfig { registry, plan, secrets };
    let migrator = Migrator::new(&config, &provider);
    let migrator = match artifact {
        Some(artifact) => migrator.with_artifact(artifact),
        None => migrator,
    };
    Ok(migrator.run(PREVIEW_NETWORK).await)
}
