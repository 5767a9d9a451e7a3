// provisioner/src/utils.rs

use crate::error::ProvisionError;
use ethers::types::U256;
use ethers::utils::{format_units as ethers_format_units, parse_units};

/// Parses a decimal amount such as `"0.5"` into base units with `decimals` places.
pub fn parse_amount(amount: &str, decimals: u32) -> Result<U256, ProvisionError> {
    let amount = amount.trim();
    if amount.starts_with('-') {
        return Err(ProvisionError::configuration(format!("amount {amount:?} must not be negative")));
    }
    parse_units(amount, decimals)
        .map(Into::into)
        .map_err(|e| ProvisionError::configuration(format!("invalid amount {amount:?}: {e}")))
}

/// Formats base units for logs; falls back to the raw integer if formatting fails.
pub fn format_units(value: U256, decimals: u32) -> String {
    ethers_format_units(value, decimals).unwrap_or_else(|_| value.to_string())
}
