use std::collections::BTreeMap;

use alloy_core::primitives::{B256, keccak256};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    config::DeployParams,
    contracts::{Artifact, ContractName},
    network::{CompilerSettings, NetworkConfig},
};

/// Inputs that determine what the deployer puts on chain.
///
/// When any of these change, previously deployed contracts can no longer be reused.
/// Runtime parameters applied by the configurator are deliberately excluded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentConfigHash {
    /// Chain the contracts live on.
    pub chain_id: u64,
    /// Compiler settings the artifacts were produced with.
    pub compiler: CompilerSettings,
    /// Constructor arguments.
    pub params: DeployParams,
    /// keccak256 of each contract's creation code.
    pub bytecode: BTreeMap<ContractName, B256>,
}

impl DeploymentConfigHash {
    pub fn new(
        network: &NetworkConfig,
        params: &DeployParams,
        artifacts: &BTreeMap<ContractName, Artifact>,
    ) -> Self {
        Self {
            chain_id: network.chain_id,
            compiler: network.compiler.clone(),
            params: params.clone(),
            bytecode: artifacts
                .iter()
                .map(|(name, artifact)| (*name, keccak256(&artifact.bytecode)))
                .collect(),
        }
    }

    /// Compute a SHA-256 hash of this configuration.
    ///
    /// The configuration is serialized to JSON first; struct fields and map keys
    /// serialize in a fixed order so the same configuration always gives the same hash.
    pub fn compute_hash(&self) -> Result<String> {
        let json =
            serde_json::to_string(self).context("Failed to serialize deployment configuration")?;

        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());

        Ok(hex::encode(hasher.finalize()))
    }
}
