//! The deployment record: persisted state shared by the pipeline stages.
//!
//! A record is created by the deployer, updated by the configurator and read by the
//! verifier. Stages take the record by value and hand back the updated copy; only the
//! binary writes it to disk.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use alloy_core::primitives::{Address, B256, Bytes};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    PipelineError,
    chain::TxReceipt,
    contracts::{ContractName, parse_address},
    fs::FsHandler,
    network::NetworkConfig,
};

/// Current layout version of the record file.
pub const RECORD_VERSION: u32 = 1;

/// A contract recorded after its creation transaction confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployedContract {
    /// Kept as text so a hand-edited or corrupted entry can be reported instead of
    /// failing the whole load.
    pub address: String,
    pub tx_hash: B256,
    pub gas_used: u64,
    pub block_number: u64,
    /// ABI-encoded constructor arguments, needed to publish the source.
    #[serde(default, skip_serializing_if = "<[u8]>::is_empty")]
    pub constructor_args: Bytes,
}

impl DeployedContract {
    pub fn from_receipt(address: Address, receipt: &TxReceipt, constructor_args: Bytes) -> Self {
        Self {
            address: address.to_string(),
            tx_hash: receipt.tx_hash,
            gas_used: receipt.gas_used,
            block_number: receipt.block_number,
            constructor_args,
        }
    }
}

/// The stage and operation that interrupted the last run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedStage {
    pub stage: String,
    pub operation: String,
    pub error: String,
}

/// Persisted state of a deployment on one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    pub version: u32,
    pub network: String,
    pub chain_id: u64,
    /// Time of the last write by the deployer or configurator.
    pub timestamp: DateTime<Utc>,
    pub deployer: Address,
    #[serde(default)]
    pub contracts: BTreeMap<ContractName, DeployedContract>,
    #[serde(default)]
    pub integration_complete: bool,
    /// Gas spent by the last configure run, including a run that aborted.
    #[serde(default)]
    pub configure_gas_used: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<FailedStage>,
    /// Hash of the parameters the contracts were constructed with.
    #[serde(default)]
    pub config_hash: String,
}

/// The four addresses, once every one of them is known to be present and valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContractAddresses {
    pub price_oracle: Address,
    pub reward_distributor: Address,
    pub vault_manager: Address,
    pub token_vault: Address,
}

impl ContractAddresses {
    pub fn get(&self, name: ContractName) -> Address {
        match name {
            ContractName::PriceOracle => self.price_oracle,
            ContractName::RewardDistributor => self.reward_distributor,
            ContractName::VaultManager => self.vault_manager,
            ContractName::TokenVault => self.token_vault,
        }
    }
}

impl DeploymentRecord {
    /// An empty record for `network`, deployed from `deployer`.
    pub fn new(network: &NetworkConfig, deployer: Address, config_hash: String) -> Self {
        Self {
            version: RECORD_VERSION,
            network: network.name.clone(),
            chain_id: network.chain_id,
            timestamp: Utc::now(),
            deployer,
            contracts: BTreeMap::new(),
            integration_complete: false,
            configure_gas_used: 0,
            failed_stage: None,
            config_hash,
        }
    }

    /// Location of the record for `network` inside `dir`.
    pub fn path_for(dir: &Path, network: &str) -> PathBuf {
        dir.join(format!("{network}.json"))
    }

    /// Load the record for `network`, failing if none exists.
    pub fn load(dir: &Path, network: &str) -> Result<Self> {
        Self::load_optional(dir, network)?.ok_or_else(|| {
            PipelineError::configuration(format!(
                "no deployment record for '{network}' at {}, run the deploy stage first",
                Self::path_for(dir, network).display()
            ))
            .into()
        })
    }

    /// Load the record for `network` if one has been written.
    pub fn load_optional(dir: &Path, network: &str) -> Result<Option<Self>> {
        let path = Self::path_for(dir, network);
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read deployment record {}", path.display()))?;
        let record: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse deployment record {}", path.display()))?;

        if record.version > RECORD_VERSION {
            return Err(PipelineError::configuration(format!(
                "deployment record {} has version {}, this build understands up to {}",
                path.display(),
                record.version,
                RECORD_VERSION
            ))
            .into());
        }

        tracing::debug!(
            path = %path.display(),
            contracts = record.contracts.len(),
            integration_complete = record.integration_complete,
            "Loaded deployment record"
        );
        Ok(Some(record))
    }

    /// Write the record to `<dir>/<network>.json`, returning the path written.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let path = Self::path_for(dir, &self.network);
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize deployment record")?;

        FsHandler::write_atomic(&path, json.as_bytes())?;

        tracing::debug!(path = %path.display(), "Saved deployment record");
        Ok(path)
    }

    /// Address of `name`, failing if it is missing or malformed.
    pub fn address_of(&self, name: ContractName) -> Result<Address> {
        let entry = self
            .contracts
            .get(&name)
            .ok_or_else(|| PipelineError::IncompleteRecord {
                missing: vec![name.to_string()],
            })?;

        parse_address(&entry.address).map_err(|e| {
            PipelineError::IncompleteRecord {
                missing: vec![format!("{name} (malformed address: {e})")],
            }
            .into()
        })
    }

    /// All four addresses, or an [`PipelineError::IncompleteRecord`] listing every gap.
    pub fn require_complete(&self) -> Result<ContractAddresses> {
        let mut missing = Vec::new();
        let mut resolved = BTreeMap::new();

        for name in ContractName::DEPLOY_ORDER {
            match self.contracts.get(&name) {
                None => missing.push(name.to_string()),
                Some(entry) => match parse_address(&entry.address) {
                    Ok(address) => {
                        resolved.insert(name, address);
                    }
                    Err(_) => missing.push(format!("{name} (malformed address)")),
                },
            }
        }

        if !missing.is_empty() {
            return Err(PipelineError::IncompleteRecord { missing }.into());
        }

        let get = |name: ContractName| resolved.get(&name).copied().unwrap_or_default();
        Ok(ContractAddresses {
            price_oracle: get(ContractName::PriceOracle),
            reward_distributor: get(ContractName::RewardDistributor),
            vault_manager: get(ContractName::VaultManager),
            token_vault: get(ContractName::TokenVault),
        })
    }

    /// Fail with [`PipelineError::NetworkMismatch`] if the record belongs to another network.
    pub fn ensure_network(&self, network: &NetworkConfig) -> Result<()> {
        if self.network != network.name || self.chain_id != network.chain_id {
            return Err(PipelineError::NetworkMismatch {
                expected: format!("{} (chain id {})", self.network, self.chain_id),
                actual: format!("{} (chain id {})", network.name, network.chain_id),
            }
            .into());
        }
        Ok(())
    }

    /// Store a freshly deployed contract.
    pub fn record_deployment(
        &mut self,
        name: ContractName,
        address: Address,
        receipt: &TxReceipt,
        constructor_args: Bytes,
    ) {
        self.contracts.insert(
            name,
            DeployedContract::from_receipt(address, receipt, constructor_args),
        );
        self.timestamp = Utc::now();
    }

    /// Remember which operation interrupted `stage`.
    pub fn mark_failed(&mut self, stage: &str, operation: impl Into<String>, error: &anyhow::Error) {
        self.failed_stage = Some(FailedStage {
            stage: stage.to_string(),
            operation: operation.into(),
            error: format!("{error:#}"),
        });
        self.timestamp = Utc::now();
    }

    /// Total gas spent on the recorded deployments.
    pub fn total_gas_used(&self) -> u64 {
        self.contracts.values().map(|c| c.gas_used).sum()
    }
}

#[cfg(test)]
mod tests {
    use alloy_core::primitives::address;
    use tempdir::TempDir;

    use super::*;
    use crate::{PipelineConfig, network::LOCAL_NETWORK};

    fn local_network() -> NetworkConfig {
        NetworkConfig::resolve_with(LOCAL_NETWORK, &PipelineConfig::default(), |_| None).unwrap()
    }

    fn receipt(n: u8) -> TxReceipt {
        TxReceipt {
            tx_hash: B256::repeat_byte(n),
            block_number: u64::from(n),
            gas_used: 100_000 * u64::from(n),
            contract_address: None,
        }
    }

    fn full_record() -> DeploymentRecord {
        let network = local_network();
        let mut record = DeploymentRecord::new(&network, network.wallet.address(), "hash".into());
        for (i, name) in ContractName::DEPLOY_ORDER.into_iter().enumerate() {
            let n = i as u8 + 1;
            record.record_deployment(name, Address::repeat_byte(n), &receipt(n), Bytes::new());
        }
        record
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new("vault-record").unwrap();
        let record = full_record();

        let path = record.save(dir.path()).unwrap();
        assert_eq!(path, dir.path().join("hardhat.json"));

        let loaded = DeploymentRecord::load(dir.path(), LOCAL_NETWORK).unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_json_layout() {
        let record = full_record();
        let json: serde_json::Value = serde_json::to_value(&record).unwrap();

        assert_eq!(json["version"], 1);
        assert_eq!(json["network"], "hardhat");
        assert_eq!(json["chainId"], 31337);
        assert_eq!(json["integrationComplete"], false);
        assert!(json["contracts"]["TokenVault"]["address"].is_string());
        assert!(json["contracts"]["PriceOracle"]["txHash"].is_string());
        assert!(json.get("failedStage").is_none());
    }

    #[test]
    fn test_missing_record_is_configuration_error() {
        let dir = TempDir::new("vault-record").unwrap();
        let err = DeploymentRecord::load(dir.path(), LOCAL_NETWORK).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Configuration(_))
        ));
        assert!(
            DeploymentRecord::load_optional(dir.path(), LOCAL_NETWORK)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_require_complete_lists_every_gap() {
        let mut record = full_record();
        record.contracts.remove(&ContractName::VaultManager);
        record
            .contracts
            .get_mut(&ContractName::TokenVault)
            .unwrap()
            .address = "0xnot-an-address".to_string();

        match record.require_complete().unwrap_err().downcast_ref::<PipelineError>() {
            Some(PipelineError::IncompleteRecord { missing }) => {
                assert_eq!(missing.len(), 2);
                assert_eq!(missing[0], "VaultManager");
                assert!(missing[1].starts_with("TokenVault"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_require_complete() {
        let addresses = full_record().require_complete().unwrap();
        assert_eq!(addresses.price_oracle, Address::repeat_byte(1));
        assert_eq!(addresses.token_vault, Address::repeat_byte(4));
        assert_eq!(
            addresses.get(ContractName::VaultManager),
            Address::repeat_byte(3)
        );
    }

    #[test]
    fn test_network_mismatch() {
        let mut record = full_record();
        record.network = "plume-testnet".to_string();
        record.chain_id = 98867;

        let err = record.ensure_network(&local_network()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::NetworkMismatch { .. })
        ));
    }

    #[test]
    fn test_mark_failed_and_gas_total() {
        let mut record = full_record();
        assert_eq!(record.total_gas_used(), 1_000_000);

        record.mark_failed(
            "deploy",
            "deploy TokenVault",
            &anyhow::anyhow!("execution reverted"),
        );
        let failed = record.failed_stage.as_ref().unwrap();
        assert_eq!(failed.stage, "deploy");
        assert!(failed.error.contains("reverted"));

        let address = record.address_of(ContractName::PriceOracle).unwrap();
        assert_eq!(address, address!("0101010101010101010101010101010101010101"));
    }

    #[test]
    fn test_newer_version_rejected() {
        let dir = TempDir::new("vault-record").unwrap();
        let mut record = full_record();
        record.version = RECORD_VERSION + 1;
        record.save(dir.path()).unwrap();

        assert!(DeploymentRecord::load(dir.path(), LOCAL_NETWORK).is_err());
    }
}
