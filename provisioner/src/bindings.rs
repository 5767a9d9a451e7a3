// provisioner/src/bindings.rs
#![allow(clippy::all)]
use ethers::prelude::abigen;

// Fee token interface of the oracle service the game pays with.
abigen!(
    LinkTokenInterface,
    r#"[
        event Transfer(address indexed from, address indexed to, uint256 value)
        function balanceOf(address owner) external view returns (uint256)
        function decimals() external view returns (uint8)
        function transfer(address to, uint256 value) external returns (bool)
        function transferAndCall(address to, uint256 value, bytes data) external returns (bool)
    ]"#,
    event_derives(serde::Deserialize, serde::Serialize)
);

// END OF FILE: provisioner/src/bindings.rs
