// provisioner/src/encoding.rs
// Calldata for the two contracts the migration talks to: the game's
// constructor and the fee token.

use crate::artifact::GameArtifact;
use crate::bindings::link_token_interface::{BalanceOfCall, BalanceOfReturn, TransferCall};
use crate::deploy::GameConstructorArgs;
use crate::error::ProvisionError;
use ethers::{
    abi::{AbiDecode, AbiEncode, ParamType, Token},
    types::{Address, Bytes, U256},
};

/// Creation code: artifact bytecode followed by the ABI-encoded `(uint N, uint stakeAmount)`.
pub fn encode_deployment(artifact: &GameArtifact, args: GameConstructorArgs) -> Result<Bytes, ProvisionError> {
    let constructor = artifact
        .abi
        .constructor()
        .ok_or_else(|| ProvisionError::configuration(format!("{} has no constructor in its ABI", artifact.name)))?;
    constructor
        .encode_input(artifact.bytecode.to_vec(), &args.tokens())
        .map(Bytes::from)
        .map_err(|e| ProvisionError::configuration(format!("cannot encode constructor of {}: {e}", artifact.name)))
}

/// Reads the constructor arguments back out of creation code built by [`encode_deployment`].
pub fn decode_constructor_args(bytecode: &[u8], creation_code: &[u8]) -> Option<GameConstructorArgs> {
    let encoded = creation_code.strip_prefix(bytecode)?;
    let tokens = ethers::abi::decode(&[ParamType::Uint(256), ParamType::Uint(256)], encoded).ok()?;
    match tokens.as_slice() {
        [Token::Uint(n), Token::Uint(stake)] if *n <= U256::from(u64::MAX) => Some(GameConstructorArgs {
            participant_count: n.as_u64(),
            stake_amount: *stake,
        }),
        _ => None,
    }
}

pub fn encode_transfer(to: Address, amount: U256) -> Bytes {
    TransferCall { to, value: amount }.encode().into()
}

pub fn encode_balance_of(owner: Address) -> Bytes {
    BalanceOfCall { owner }.encode().into()
}

pub fn decode_balance(output: &[u8]) -> Result<U256, ProvisionError> {
    BalanceOfReturn::decode(output)
        .map(|ret| ret.0)
        .map_err(|e| ProvisionError::network(format!("malformed balanceOf result: {e}")))
}
