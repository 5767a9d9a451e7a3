// provisioner/src/artifact.rs

use crate::error::ProvisionError;
use ethers::{
    abi::{Abi, ParamType},
    types::Bytes,
};
use serde::Deserialize;
use std::{fs, path::Path};
use tracing::debug;

/// Compiled game contract as written by the external build step.
#[derive(Debug, Clone)]
pub struct GameArtifact {
    pub name: String,
    pub abi: Abi,
    pub bytecode: Bytes,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArtifactFile {
    #[serde(default)]
    contract_name: Option<String>,
    abi: Abi,
    bytecode: String,
}

impl GameArtifact {
    /// Loads `{ "contractName", "abi", "bytecode" }` JSON and checks the constructor shape.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProvisionError> {
        let path = path.as_ref();
        debug!(?path, "Loading contract artifact");
        let text = fs::read_to_string(path)
            .map_err(|e| ProvisionError::configuration(format!("cannot read artifact {}: {e}", path.display())))?;
        let file: ArtifactFile = serde_json::from_str(&text)
            .map_err(|e| ProvisionError::configuration(format!("invalid artifact {}: {e}", path.display())))?;

        let name = file.contract_name.unwrap_or_else(|| {
            path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_else(|| "contract".into())
        });
        Self::from_parts(name, file.abi, &file.bytecode)
    }

    pub fn from_parts(name: impl Into<String>, abi: Abi, bytecode_hex: &str) -> Result<Self, ProvisionError> {
        let name = name.into();
        let cleaned = bytecode_hex.trim().trim_start_matches("0x");
        let bytecode = hex::decode(cleaned)
            .map_err(|e| ProvisionError::configuration(format!("{name}: bytecode is not hex: {e}")))?;
        if bytecode.is_empty() {
            return Err(ProvisionError::configuration(format!("{name}: bytecode is empty (abstract contract or interface?)")));
        }

        let inputs: Vec<&ParamType> = abi
            .constructor()
            .map(|c| c.inputs.iter().map(|p| &p.kind).collect())
            .unwrap_or_default();
        if inputs != [&ParamType::Uint(256), &ParamType::Uint(256)] {
            return Err(ProvisionError::configuration(format!(
                "{name}: constructor must be (uint256 participantCount, uint256 stakeAmount), found {inputs:?}"
            )));
        }

        Ok(Self { name, abi, bytecode: Bytes::from(bytecode) })
    }
}

/// Constructor ABI of the game, for artifacts that ship without one.
const PREVIEW_ABI: &str = r#"[
    {"type":"constructor","stateMutability":"nonpayable","inputs":[
        {"name":"_N","type":"uint256","internalType":"uint256"},
        {"name":"_stakeAmount","type":"uint256","internalType":"uint256"}
    ]}
]"#;

/// Init code that rejects value and deploys empty runtime code.
const PREVIEW_BYTECODE: &str = "0x6080604052348015600f57600080fd5b50";

impl GameArtifact {
    /// Stand-in game with the real constructor shape, for previews without a compiled build.
    pub fn preview() -> Result<Self, ProvisionError> {
        let abi: Abi = serde_json::from_str(PREVIEW_ABI)
            .map_err(|e| ProvisionError::configuration(format!("preview ABI: {e}")))?;
        Self::from_parts("GamblingGame", abi, PREVIEW_BYTECODE)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) const GAME_ABI: &str = PREVIEW_ABI;

    pub(crate) fn sample_artifact() -> GameArtifact {
        GameArtifact::preview().unwrap()
    }

    #[test]
    fn loads_compiler_output() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"contractName":"GamblingGame","abi":{GAME_ABI},"bytecode":"0x60806040","deployedBytecode":"0x"}}"#
        )
        .unwrap();
        let artifact = GameArtifact::load(file.path()).unwrap();
        assert_eq!(artifact.name, "GamblingGame");
        assert_eq!(artifact.bytecode.to_vec(), vec![0x60, 0x80, 0x60, 0x40]);
    }

    #[test]
    fn missing_file_is_configuration_error() {
        let err = GameArtifact::load("/definitely/not/here.json").unwrap_err();
        assert_eq!(err.kind(), "ConfigurationError");
    }

    #[test]
    fn rejects_wrong_constructor() {
        let abi: Abi = serde_json::from_str(
            r#"[{"type":"constructor","stateMutability":"nonpayable","inputs":[{"name":"n","type":"uint8"}]}]"#,
        )
        .unwrap();
        assert!(GameArtifact::from_parts("Other", abi, "0x6080").is_err());
    }

    #[test]
    fn preview_artifact_has_the_game_constructor() {
        let artifact = GameArtifact::preview().unwrap();
        assert_eq!(artifact.name, "GamblingGame");
        assert_eq!(artifact.abi.constructor().map(|c| c.inputs.len()), Some(2));
        assert!(!artifact.bytecode.is_empty());
    }

    #[test]
    fn rejects_empty_bytecode() {
        let abi: Abi = serde_json::from_str(GAME_ABI).unwrap();
        assert!(GameArtifact::from_parts("GamblingGame", abi, "0x").is_err());
    }
}
