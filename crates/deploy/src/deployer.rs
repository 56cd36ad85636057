//! Deploys the four vault contracts in dependency order.

use std::collections::BTreeMap;

use alloy_core::{
    primitives::{Address, Bytes, U256},
    sol_types::SolValue,
};
use anyhow::{Context, Result};

use crate::{
    PipelineError,
    chain::{ChainClient, TxRequest},
    config::DeployParams,
    contracts::{Artifact, ArtifactStore, ContractName},
    deployment_hash::DeploymentConfigHash,
    network::NetworkConfig,
    record::DeploymentRecord,
};

/// Stage name used in failure reports.
pub const STAGE: &str = "deploy";

/// What a deploy run did.
#[derive(Debug, Clone)]
pub struct DeployOutcome {
    pub record: DeploymentRecord,
    /// Contracts created by this run, in deployment order.
    pub deployed: Vec<ContractName>,
    /// Contracts taken over from a previous run.
    pub reused: Vec<ContractName>,
}

/// Deploys PriceOracle, RewardDistributor, VaultManager and TokenVault.
///
/// Progress is handed to a checkpoint callback after every confirmed deployment, so an
/// interrupted run leaves a record naming the failed step and can be resumed.
pub struct Deployer<'a, C> {
    chain: &'a C,
    network: &'a NetworkConfig,
    artifacts: &'a ArtifactStore,
    params: &'a DeployParams,
}

impl<'a, C: ChainClient> Deployer<'a, C> {
    pub fn new(
        chain: &'a C,
        network: &'a NetworkConfig,
        artifacts: &'a ArtifactStore,
        params: &'a DeployParams,
    ) -> Self {
        Self {
            chain,
            network,
            artifacts,
            params,
        }
    }

    /// Run the deploy stage.
    ///
    /// `previous` is the record left by an earlier run, if any. Unless `redeploy` is set,
    /// contracts it holds are reused when their code is still on chain and the deployment
    /// parameters are unchanged. `checkpoint` receives the record after every change.
    ///
    /// `integrationComplete` is cleared only when at least one contract gets deployed; a
    /// rerun that reuses the whole system leaves the configuration state untouched.
    pub async fn deploy<F>(
        &self,
        previous: Option<DeploymentRecord>,
        redeploy: bool,
        mut checkpoint: F,
    ) -> Result<DeployOutcome>
    where
        F: FnMut(&DeploymentRecord) -> Result<()>,
    {
        self.network.ensure_chain_id(self.chain.chain_id().await?)?;

        if self.params.price_feeds.is_empty() {
            return Err(
                PipelineError::configuration("at least one price feed must be configured").into(),
            );
        }
        let min_deposit = self.params.min_deposit_wei()?;

        let artifacts = ContractName::DEPLOY_ORDER
            .into_iter()
            .map(|name| Ok((name, self.artifacts.load(name)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        let config_hash =
            DeploymentConfigHash::new(self.network, self.params, &artifacts).compute_hash()?;

        let mut record = match previous {
            Some(previous) if !redeploy => self.resume(previous, &config_hash).await?,
            _ => DeploymentRecord::new(self.network, self.chain.sender(), config_hash.clone()),
        };

        let reused: Vec<_> = record.contracts.keys().copied().collect();
        record.deployer = self.chain.sender();
        if reused.len() < ContractName::DEPLOY_ORDER.len() {
            // New contracts start unwired.
            record.integration_complete = false;
            record.configure_gas_used = 0;
            record.failed_stage = None;
        } else if record
            .failed_stage
            .as_ref()
            .is_some_and(|failed| failed.stage == STAGE)
        {
            record.failed_stage = None;
        }
        checkpoint(&record)?;

        let mut deployed = Vec::new();
        for name in ContractName::DEPLOY_ORDER {
            if record.contracts.contains_key(&name) {
                tracing::info!(contract = %name, "Already deployed, skipping");
                continue;
            }

            let Some(artifact) = artifacts.get(&name) else {
                continue;
            };

            if let Err(err) = self
                .deploy_contract(name, artifact, min_deposit, &mut record)
                .await
            {
                let operation = format!("deploy {name}");
                record.mark_failed(STAGE, &operation, &err);
                if let Err(save_err) = checkpoint(&record) {
                    tracing::warn!(error = %save_err, "Failed to record the failed deploy step");
                }

                return Err(match err.downcast::<PipelineError>() {
                    Ok(pipeline_err) => pipeline_err.into(),
                    Err(err) => PipelineError::TransactionFailure {
                        stage: STAGE,
                        operation,
                        contract: name.to_string(),
                        address: "(not deployed)".to_string(),
                        reason: format!("{err:#}"),
                    }
                    .into(),
                });
            }

            deployed.push(name);
            checkpoint(&record)
                .with_context(|| format!("{name} was deployed but the record could not be saved"))?;
        }

        tracing::info!(
            network = %record.network,
            deployed = deployed.len(),
            reused = reused.len(),
            total_gas = record.total_gas_used(),
            "Deployment complete"
        );

        Ok(DeployOutcome {
            record,
            deployed,
            reused,
        })
    }

    /// Keep what a previous run deployed, as long as it is still usable.
    async fn resume(
        &self,
        mut previous: DeploymentRecord,
        config_hash: &str,
    ) -> Result<DeploymentRecord> {
        previous.ensure_network(self.network)?;

        if previous.contracts.is_empty() {
            previous.config_hash = config_hash.to_string();
            return Ok(previous);
        }

        if previous.config_hash != config_hash {
            return Err(PipelineError::configuration(format!(
                "deployment parameters or artifacts changed since the contracts on '{}' were \
                 deployed, rerun with --redeploy to start over",
                previous.network
            ))
            .into());
        }

        // A contract is reusable only if its code is live and everything it was built
        // against is reusable too.
        for name in ContractName::DEPLOY_ORDER {
            let Some(entry) = previous.contracts.get(&name) else {
                continue;
            };

            let deps_kept = name
                .dependencies()
                .iter()
                .all(|dep| previous.contracts.contains_key(dep));
            let live = match previous.address_of(name) {
                Ok(address) => !self.chain.code_at(address).await?.is_empty(),
                Err(_) => false,
            };

            if !(deps_kept && live) {
                tracing::warn!(
                    contract = %name,
                    address = %entry.address,
                    "Recorded contract is not usable, it will be redeployed"
                );
                previous.contracts.remove(&name);
            }
        }

        Ok(previous)
    }

    async fn deploy_contract(
        &self,
        name: ContractName,
        artifact: &Artifact,
        min_deposit: U256,
        record: &mut DeploymentRecord,
    ) -> Result<()> {
        let args = self.constructor_args(name, min_deposit, record)?;

        let mut code = artifact.bytecode.to_vec();
        code.extend_from_slice(&args);

        tracing::info!(contract = %name, "Deploying...");

        let receipt = self
            .chain
            .send_transaction(TxRequest::create(Bytes::from(code)))
            .await?;
        let address = receipt
            .contract_address
            .with_context(|| format!("receipt {} has no contract address", receipt.tx_hash))?;

        if self.chain.code_at(address).await?.is_empty() {
            anyhow::bail!("no code found at {address} after deployment");
        }

        tracing::info!(
            contract = %name,
            address = %address,
            tx_hash = %receipt.tx_hash,
            gas_used = receipt.gas_used,
            "Deployed"
        );

        record.record_deployment(name, address, &receipt, Bytes::from(args));
        Ok(())
    }

    /// ABI-encoded constructor arguments for `name`.
    ///
    /// Every dependency must already be recorded.
    fn constructor_args(
        &self,
        name: ContractName,
        min_deposit: U256,
        record: &DeploymentRecord,
    ) -> Result<Vec<u8>> {
        let deps = name
            .dependencies()
            .iter()
            .map(|dep| Ok((*dep, record.address_of(*dep)?)))
            .collect::<Result<BTreeMap<ContractName, Address>>>()
            .with_context(|| format!("{name} cannot be deployed before its dependencies"))?;
        let dep = |dep: ContractName| deps.get(&dep).copied().unwrap_or_default();

        Ok(match name {
            ContractName::PriceOracle => (self.params.feed_addresses(),).abi_encode_params(),
            ContractName::RewardDistributor => {
                (dep(ContractName::PriceOracle),).abi_encode_params()
            }
            ContractName::VaultManager => Vec::new(),
            ContractName::TokenVault => (
                dep(ContractName::VaultManager),
                dep(ContractName::RewardDistributor),
                dep(ContractName::PriceOracle),
                U256::from(self.params.fee_rate_bps),
                min_deposit,
            )
                .abi_encode_params(),
        })
    }
}

#[cfg(test)]
mod tests {
    use alloy_core::primitives::address;

    use super::*;
    use crate::{PipelineConfig, chain::TxReceipt, network::LOCAL_NETWORK};

    fn network() -> NetworkConfig {
        NetworkConfig::resolve_with(LOCAL_NETWORK, &PipelineConfig::default(), |_| None).unwrap()
    }

    fn record_with(names: &[ContractName]) -> DeploymentRecord {
        let network = network();
        let mut record = DeploymentRecord::new(&network, Address::ZERO, String::new());
        for (i, name) in names.iter().enumerate() {
            let receipt = TxReceipt {
                tx_hash: Default::default(),
                block_number: 1,
                gas_used: 1,
                contract_address: None,
            };
            record.record_deployment(
                *name,
                Address::repeat_byte(i as u8 + 1),
                &receipt,
                Bytes::new(),
            );
        }
        record
    }

    struct NoChain;

    impl ChainClient for NoChain {
        fn sender(&self) -> Address {
            Address::ZERO
        }

        async fn chain_id(&self) -> Result<u64> {
            anyhow::bail!("offline")
        }

        async fn code_at(&self, _: Address) -> Result<Bytes> {
            anyhow::bail!("offline")
        }

        async fn call(&self, _: Option<Address>, _: Address, _: Bytes) -> Result<Bytes> {
            anyhow::bail!("offline")
        }

        async fn send_transaction(&self, _: TxRequest) -> Result<TxReceipt> {
            anyhow::bail!("offline")
        }
    }

    #[test]
    fn test_constructor_args_require_dependencies() {
        let network = network();
        let store = ArtifactStore::new("artifacts");
        let params = DeployParams::default();
        let deployer = Deployer::new(&NoChain, &network, &store, &params);

        let record = record_with(&[ContractName::PriceOracle]);
        let err = deployer
            .constructor_args(ContractName::TokenVault, U256::ZERO, &record)
            .unwrap_err();
        assert!(format!("{err:#}").contains("VaultManager"));

        let args = deployer
            .constructor_args(ContractName::RewardDistributor, U256::ZERO, &record)
            .unwrap();
        assert_eq!(args.len(), 32);
        assert_eq!(&args[12..], Address::repeat_byte(1).as_slice());
    }

    #[test]
    fn test_token_vault_constructor_layout() {
        let network = network();
        let store = ArtifactStore::new("artifacts");
        let params = DeployParams::default();
        let deployer = Deployer::new(&NoChain, &network, &store, &params);

        let record = record_with(&[
            ContractName::PriceOracle,
            ContractName::RewardDistributor,
            ContractName::VaultManager,
        ]);
        let min_deposit = params.min_deposit_wei().unwrap();
        let args = deployer
            .constructor_args(ContractName::TokenVault, min_deposit, &record)
            .unwrap();

        let (manager, distributor, oracle, fee, deposit) =
            <(Address, Address, Address, U256, U256)>::abi_decode_params(&args).unwrap();
        assert_eq!(manager, Address::repeat_byte(3));
        assert_eq!(distributor, Address::repeat_byte(2));
        assert_eq!(oracle, Address::repeat_byte(1));
        assert_eq!(fee, U256::from(100));
        assert_eq!(deposit, min_deposit);
    }

    #[test]
    fn test_price_oracle_receives_feeds() {
        let network = network();
        let store = ArtifactStore::new("artifacts");
        let params = DeployParams::default();
        let deployer = Deployer::new(&NoChain, &network, &store, &params);

        let args = deployer
            .constructor_args(ContractName::PriceOracle, U256::ZERO, &record_with(&[]))
            .unwrap();
        let (feeds,) = <(Vec<Address>,)>::abi_decode_params(&args).unwrap();
        assert_eq!(
            feeds,
            vec![
                address!("1000000000000000000000000000000000000001"),
                address!("1000000000000000000000000000000000000002"),
            ]
        );
    }
}
