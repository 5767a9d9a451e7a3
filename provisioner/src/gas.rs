// provisioner/src/gas.rs
// Gas pricing and the native-balance precondition for submissions.

use crate::client::ChainClient;
use crate::config::NetworkProfile;
use crate::error::ProvisionError;
use crate::utils::format_units;
use ethers::types::U256;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasQuote {
    pub gas_limit: U256,
    pub gas_price: U256,
}

impl GasQuote {
    /// Worst-case native cost of one transaction.
    pub fn max_cost(&self) -> U256 {
        self.gas_limit.saturating_mul(self.gas_price)
    }
}

/// Gas limit from the profile, price from the profile override or the node.
#[instrument(skip_all, level = "debug", fields(network = %profile.name))]
pub async fn quote_gas(client: &dyn ChainClient, profile: &NetworkProfile) -> Result<GasQuote, ProvisionError> {
    let gas_price = match profile.gas_price {
        Some(price) => price,
        None => client.gas_price().await?,
    };
    let quote = GasQuote { gas_limit: U256::from(profile.gas_limit), gas_price };
    debug!(gas_limit = %quote.gas_limit, gas_price = %quote.gas_price, "Gas quote ready");
    Ok(quote)
}

/// Fails with `InsufficientFunds` unless the signer can pay `gas limit x gas price`.
pub async fn ensure_affordable(client: &dyn ChainClient, quote: &GasQuote) -> Result<(), ProvisionError> {
    let available = client.native_balance(client.signer_address()).await?;
    let required = quote.max_cost();
    if available < required {
        warn!(
            required = %format_units(required, 18),
            available = %format_units(available, 18),
            "Signer cannot cover gas"
        );
        return Err(ProvisionError::InsufficientFunds { required, available });
    }
    Ok(())
}
