// provisioner/src/config.rs

use crate::deploy::GameConstructorArgs;
use crate::error::ProvisionError;
use crate::utils::parse_amount;
use crate::KOVAN_LINK_TOKEN;
use dotenv::dotenv;
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fmt, fs};
use tracing::{debug, info};

pub const MNEMONIC_ENV: &str = "MNEMONIC";
pub const ENDPOINT_KEY_ENV: &str = "INFURA_KEY";
pub const VERIFICATION_API_KEY_ENV: &str = "ETHERSCAN_API_KEY";

/// Placeholder substituted with the RPC endpoint key when a profile is resolved.
pub const ENDPOINT_KEY_PLACEHOLDER: &str = "{INFURA_KEY}";

/// Config file picked up from the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "provision.toml";

const DEFAULT_TIMEOUT_BLOCKS: u64 = 50;
const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;
const DEVELOP_GAS_LIMIT: u64 = 6_721_975;

// --- Secrets ---

/// Secrets read from the environment exactly once at start-up.
#[derive(Clone, Default)]
pub struct Secrets {
    pub mnemonic: Option<String>,
    pub endpoint_key: Option<String>,
    pub verification_api_key: Option<String>,
}

impl Secrets {
    /// Loads `.env` (if present) and reads the three secret variables.
    pub fn from_env() -> Self {
        dotenv().ok();
        let read = |name: &str| env::var(name).ok().filter(|v| !v.trim().is_empty());
        let secrets = Self {
            mnemonic: read(MNEMONIC_ENV),
            endpoint_key: read(ENDPOINT_KEY_ENV),
            verification_api_key: read(VERIFICATION_API_KEY_ENV),
        };
        debug!(?secrets, "Secrets read from environment");
        secrets
    }
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mask = |v: &Option<String>| if v.is_some() { "<set>" } else { "<unset>" };
        f.debug_struct("Secrets")
            .field("mnemonic", &mask(&self.mnemonic))
            .field("endpoint_key", &mask(&self.endpoint_key))
            .field("verification_api_key", &mask(&self.verification_api_key))
            .finish()
    }
}

// --- Network profiles ---

/// Which chain ids a profile accepts. `*` in config files means any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkId {
    Any,
    Exact(u64),
}

impl NetworkId {
    pub fn accepts(&self, chain_id: u64) -> bool {
        match self {
            NetworkId::Any => true,
            NetworkId::Exact(id) => *id == chain_id,
        }
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkId::Any => write!(f, "*"),
            NetworkId::Exact(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawNetworkId {
    Number(u64),
    Text(String),
}

impl RawNetworkId {
    fn parse(&self) -> Result<NetworkId, ProvisionError> {
        match self {
            RawNetworkId::Number(id) => Ok(NetworkId::Exact(*id)),
            RawNetworkId::Text(s) if s.trim() == "*" => Ok(NetworkId::Any),
            RawNetworkId::Text(s) => s
                .trim()
                .parse::<u64>()
                .map(NetworkId::Exact)
                .map_err(|_| ProvisionError::configuration(format!("network_id must be numeric or \"*\", got {s:?}"))),
        }
    }
}

/// A resolved, immutable network configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkProfile {
    pub name: String,
    pub endpoint: String,
    pub network_id: NetworkId,
    pub gas_limit: u64,
    pub gas_price: Option<U256>,
    pub confirmations: u64,
    pub timeout_blocks: u64,
    pub dry_run: bool,
    pub poll_interval: Duration,
}

impl NetworkProfile {
    pub fn is_websocket(&self) -> bool {
        self.endpoint.starts_with("ws://") || self.endpoint.starts_with("wss://")
    }

    /// Confirmations actually waited for. Zero means "included", same as one.
    pub fn required_depth(&self) -> u64 {
        self.confirmations.max(1)
    }
}

/// One `[networks.<name>]` table as written in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkEntry {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    pub network_id: RawNetworkId,
    #[serde(default)]
    pub gas: Option<u64>,
    #[serde(default)]
    pub gas_price_gwei: Option<String>,
    #[serde(default)]
    pub confirmations: u64,
    #[serde(default = "default_timeout_blocks")]
    pub timeout_blocks: u64,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_timeout_blocks() -> u64 {
    DEFAULT_TIMEOUT_BLOCKS
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

/// Named network profiles, keyed by name.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkRegistry {
    entries: BTreeMap<String, NetworkEntry>,
}

impl NetworkRegistry {
    /// The two networks every installation knows about: a local dev node and Kovan.
    pub fn builtin() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(
            "develop".to_string(),
            NetworkEntry {
                endpoint: None,
                host: Some("127.0.0.1".into()),
                port: Some(8545),
                network_id: RawNetworkId::Text("*".into()),
                gas: Some(DEVELOP_GAS_LIMIT),
                gas_price_gwei: None,
                confirmations: 0,
                timeout_blocks: DEFAULT_TIMEOUT_BLOCKS,
                dry_run: false,
                poll_interval_ms: 1000,
            },
        );
        entries.insert(
            "kovan".to_string(),
            NetworkEntry {
                endpoint: Some(format!("wss://kovan.infura.io/ws/v3/{ENDPOINT_KEY_PLACEHOLDER}")),
                host: None,
                port: None,
                network_id: RawNetworkId::Number(42),
                gas: Some(5_500_000),
                gas_price_gwei: None,
                confirmations: 2,
                timeout_blocks: 200,
                dry_run: false,
                poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            },
        );
        Self { entries }
    }

    /// Adds or replaces profiles by name.
    pub fn merge(&mut self, overrides: BTreeMap<String, NetworkEntry>) {
        self.entries.extend(overrides);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Looks up `name` and validates it into a [`NetworkProfile`].
    pub fn resolve(&self, name: &str, secrets: &Secrets) -> Result<NetworkProfile, ProvisionError> {
        let entry = self.entries.get(name).ok_or_else(|| {
            let known: Vec<&str> = self.names().collect();
            ProvisionError::configuration(format!("unknown network {name:?} (known: {})", known.join(", ")))
        })?;

        let raw_endpoint = match (&entry.endpoint, &entry.host, entry.port) {
            (Some(endpoint), _, _) => endpoint.clone(),
            (None, Some(host), Some(port)) => format!("http://{host}:{port}"),
            _ => {
                return Err(ProvisionError::configuration(format!(
                    "network {name:?} needs either `endpoint` or `host` + `port`"
                )))
            }
        };
        let endpoint = substitute_endpoint_key(&raw_endpoint, secrets)?;
        validate_endpoint(&endpoint)?;

        let gas_limit = entry.gas.unwrap_or(DEVELOP_GAS_LIMIT);
        if gas_limit == 0 {
            return Err(ProvisionError::configuration(format!("network {name:?}: gas limit must be positive")));
        }
        if entry.timeout_blocks == 0 {
            return Err(ProvisionError::configuration(format!("network {name:?}: timeout_blocks must be positive")));
        }
        let gas_price = entry
            .gas_price_gwei
            .as_deref()
            .map(|gwei| parse_amount(gwei, 9))
            .transpose()?;

        Ok(NetworkProfile {
            name: name.to_string(),
            endpoint,
            network_id: entry.network_id.parse()?,
            gas_limit,
            gas_price,
            confirmations: entry.confirmations,
            timeout_blocks: entry.timeout_blocks,
            dry_run: entry.dry_run,
            poll_interval: Duration::from_millis(entry.poll_interval_ms),
        })
    }
}

fn substitute_endpoint_key(endpoint: &str, secrets: &Secrets) -> Result<String, ProvisionError> {
    if !endpoint.contains(ENDPOINT_KEY_PLACEHOLDER) {
        return Ok(endpoint.to_string());
    }
    let key = secrets.endpoint_key.as_deref().ok_or_else(|| {
        ProvisionError::configuration(format!("endpoint needs {ENDPOINT_KEY_ENV} but it is not set"))
    })?;
    Ok(endpoint.replace(ENDPOINT_KEY_PLACEHOLDER, key))
}

fn validate_endpoint(endpoint: &str) -> Result<(), ProvisionError> {
    let rest = ["http://", "https://", "ws://", "wss://"]
        .iter()
        .find_map(|scheme| endpoint.strip_prefix(scheme))
        .ok_or_else(|| ProvisionError::configuration(format!("endpoint {endpoint:?} must use http(s):// or ws(s)://")))?;
    let host = rest.split(['/', '?']).next().unwrap_or_default();
    if host.is_empty() || rest.contains(char::is_whitespace) {
        return Err(ProvisionError::configuration(format!("endpoint {endpoint:?} is malformed")));
    }
    Ok(())
}

// --- Migration plan ---

/// How the funding step treats tokens the game already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundingPolicy {
    /// Always transfer the full amount.
    #[default]
    Unconditional,
    /// Transfer only what is missing to reach the amount. Opt-in.
    TopUp,
}

/// What gets deployed and how it gets funded.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationPlan {
    pub constructor_args: GameConstructorArgs,
    pub token: Address,
    pub token_decimals: u32,
    pub funding_amount: U256,
    pub artifact_path: PathBuf,
    pub account_index: u32,
    pub accounts: u32,
    pub funding_policy: FundingPolicy,
}

/// The `[migration]` table. Amounts are decimal strings in whole units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MigrationSection {
    pub participant_count: u64,
    pub stake_amount: String,
    pub token_address: Option<String>,
    pub token_decimals: u32,
    pub funding_amount: String,
    pub artifact: PathBuf,
    pub account_index: u32,
    pub accounts: u32,
    pub funding_policy: FundingPolicy,
}

impl Default for MigrationSection {
    fn default() -> Self {
        Self {
            participant_count: 3,
            stake_amount: "0.001".into(),
            token_address: None,
            token_decimals: 18,
            funding_amount: "0.5".into(),
            artifact: PathBuf::from("build/contracts/GamblingGame.json"),
            account_index: 0,
            accounts: 1,
            funding_policy: FundingPolicy::Unconditional,
        }
    }
}

impl MigrationSection {
    pub fn into_plan(self) -> Result<MigrationPlan, ProvisionError> {
        let stake_amount = parse_amount(&self.stake_amount, 18)?;
        let constructor_args = GameConstructorArgs::new(self.participant_count, stake_amount)?;
        let token = match self.token_address.as_deref() {
            Some(addr) => addr
                .parse::<Address>()
                .map_err(|e| ProvisionError::configuration(format!("token_address {addr:?}: {e}")))?,
            None => *KOVAN_LINK_TOKEN,
        };
        let funding_amount = parse_amount(&self.funding_amount, self.token_decimals)?;
        if self.accounts == 0 || self.account_index >= self.accounts {
            return Err(ProvisionError::configuration(format!(
                "account_index {} must be below accounts {}",
                self.account_index, self.accounts
            )));
        }
        Ok(MigrationPlan {
            constructor_args,
            token,
            token_decimals: self.token_decimals,
            funding_amount,
            artifact_path: self.artifact,
            account_index: self.account_index,
            accounts: self.accounts,
            funding_policy: self.funding_policy,
        })
    }
}

impl Default for MigrationPlan {
    fn default() -> Self {
        // 0.001 ether stake, 0.5 LINK: both literals parse.
        Self {
            constructor_args: GameConstructorArgs {
                participant_count: 3,
                stake_amount: U256::exp10(15),
            },
            token: *KOVAN_LINK_TOKEN,
            token_decimals: 18,
            funding_amount: U256::exp10(17) * 5,
            artifact_path: PathBuf::from("build/contracts/GamblingGame.json"),
            account_index: 0,
            accounts: 1,
            funding_policy: FundingPolicy::Unconditional,
        }
    }
}

// --- Whole config ---

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    networks: BTreeMap<String, NetworkEntry>,
    #[serde(default)]
    migration: Option<MigrationSection>,
}

/// Everything a run needs, built once at start-up and passed by reference.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub registry: NetworkRegistry,
    pub plan: MigrationPlan,
    pub secrets: Secrets,
}

impl AppConfig {
    /// Builds the config from TOML text on top of the built-in profiles.
    pub fn from_toml_str(text: &str, secrets: Secrets) -> Result<Self, ProvisionError> {
        let file: ConfigFile =
            toml::from_str(text).map_err(|e| ProvisionError::configuration(format!("invalid config file: {e}")))?;
        let mut registry = NetworkRegistry::builtin();
        registry.merge(file.networks);
        let plan = file.migration.unwrap_or_default().into_plan()?;
        Ok(Self { registry, plan, secrets })
    }
}

/// Reads secrets from the environment and the optional config file.
///
/// An explicit `path` must exist; without one, `provision.toml` in the
/// working directory is used when present.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ProvisionError> {
    info!("Loading configuration...");
    let secrets = Secrets::from_env();

    let text = match path {
        Some(path) => Some(
            fs::read_to_string(path)
                .map_err(|e| ProvisionError::configuration(format!("cannot read {}: {e}", path.display())))?,
        ),
        None => fs::read_to_string(DEFAULT_CONFIG_FILE).ok(),
    };

    let config = match text {
        Some(text) => AppConfig::from_toml_str(&text, secrets)?,
        None => AppConfig { registry: NetworkRegistry::builtin(), plan: MigrationPlan::default(), secrets },
    };
    info!(networks = ?config.registry.names().collect::<Vec<_>>(), "✅ Configuration loaded.");
    Ok(config)
}
