// provisioner/src/error.rs

use ethers::types::{TxHash, U256};
use thiserror::Error;

/// Every way a provisioning run can stop.
///
/// State-mutating steps (deployment, funding) are never retried on any of
/// these. Only [`ProvisionError::Network`] on a read-only call may be retried.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Missing or malformed static/secret configuration. Raised before any network call.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The signing identity could not be derived.
    #[error("credential error: {0}")]
    Credential(String),

    /// Signer cannot pay `gas limit x gas price` in native currency.
    #[error("insufficient native funds: required {required} wei, available {available} wei (short {} wei)", shortfall(.required, .available))]
    InsufficientFunds { required: U256, available: U256 },

    /// Signer holds fewer tokens than the transfer amount.
    #[error("insufficient token balance: required {required}, available {available} (short {})", shortfall(.required, .available))]
    InsufficientTokenBalance { required: U256, available: U256 },

    /// Confirmations not reached within the timeout window. The transaction may still land.
    #[error("transaction {tx_hash:?} not confirmed within {timeout_blocks} blocks; reconcile manually before re-running")]
    Timeout { tx_hash: TxHash, timeout_blocks: u64 },

    /// On-chain logic rejected the call.
    #[error("transaction reverted{}", revert_detail(.tx_hash, .reason))]
    Revert { tx_hash: Option<TxHash>, reason: Option<String> },

    /// Transport-level failure talking to the node.
    #[error("network error: {0}")]
    Network(String),
}

fn shortfall(required: &U256, available: &U256) -> U256 {
    required.saturating_sub(*available)
}

fn revert_detail(tx_hash: &Option<TxHash>, reason: &Option<String>) -> String {
    let mut out = String::new();
    if let Some(hash) = tx_hash {
        out.push_str(&format!(" ({hash:?})"));
    }
    if let Some(reason) = reason {
        out.push_str(&format!(": {reason}"));
    }
    out
}

impl ProvisionError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn network(err: impl std::fmt::Display) -> Self {
        Self::Network(err.to_string())
    }

    /// Short category name used in logs and run reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "ConfigurationError",
            Self::Credential(_) => "CredentialError",
            Self::InsufficientFunds { .. } => "InsufficientFundsError",
            Self::InsufficientTokenBalance { .. } => "InsufficientTokenBalanceError",
            Self::Timeout { .. } => "TimeoutError",
            Self::Revert { .. } => "RevertError",
            Self::Network(_) => "NetworkError",
        }
    }

    /// True only for transient failures, and only callers doing reads may act on it.
    pub fn is_retryable_read(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Shortfall carried by the two precondition errors.
    pub fn shortfall(&self) -> Option<U256> {
        match self {
            Self::InsufficientFunds { required, available }
            | Self::InsufficientTokenBalance { required, available } => {
                Some(shortfall(required, available))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shortfall_is_reported_in_message() {
        let err = ProvisionError::InsufficientTokenBalance {
            required: U256::from(500u64),
            available: U256::from(120u64),
        };
        assert_eq!(err.shortfall(), Some(U256::from(380u64)));
        assert!(err.to_string().contains("short 380"));
        assert_eq!(err.kind(), "InsufficientTokenBalanceError");
    }

    #[test]
    fn only_network_errors_are_retryable() {
        assert!(ProvisionError::network("connection reset").is_retryable_read());
        assert!(!ProvisionError::Timeout { tx_hash: TxHash::zero(), timeout_blocks: 50 }.is_retryable_read());
        assert!(!ProvisionError::Revert { tx_hash: None, reason: None }.is_retryable_read());
    }

    #[test]
    fn revert_message_includes_reason() {
        let err = ProvisionError::Revert { tx_hash: None, reason: Some("N must be at least 2".into()) };
        assert_eq!(err.to_string(), "transaction reverted: N must be at least 2");
    }
}
