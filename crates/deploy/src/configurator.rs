//! Wires the deployed contracts together, grants roles and applies system parameters.

use alloy_core::primitives::{Address, B256, U256};
use anyhow::Result;
use serde::Serialize;

use crate::{
    PipelineConfig, PipelineError,
    abi::{IPriceOracle, IRewardDistributor, ITokenVault, IVaultManager, Role},
    chain::{ChainClient, TxReceipt},
    contracts::{
        CallOf, ContractFactory, ContractHandle, ContractInterface, ContractName, PriceOracle,
        RewardDistributor, TokenVault, VaultManager,
    },
    network::NetworkConfig,
    record::{ContractAddresses, DeploymentRecord},
};

/// Stage name used in failure reports.
pub const STAGE: &str = "configure";

/// The configurator runs its phases in this order, each one completing before the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
pub enum Phase {
    Linking,
    Permissions,
    Parameters,
}

/// A confirmed configuration transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedOperation {
    pub phase: Phase,
    pub contract: ContractName,
    pub operation: String,
    pub tx_hash: B256,
    pub gas_used: u64,
}

/// A role granted on `contract` to `grantee`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RoleGrant {
    pub role: Role,
    pub grantee: Address,
    pub contract: ContractName,
}

/// Result of a successful configure run.
#[derive(Debug, Clone)]
pub struct ConfigureOutcome {
    pub record: DeploymentRecord,
    pub applied: Vec<AppliedOperation>,
    pub roles: Vec<RoleGrant>,
}

impl ConfigureOutcome {
    pub fn total_gas_used(&self) -> u64 {
        self.applied.iter().map(|op| op.gas_used).sum()
    }
}

/// Handles on the four contracts plus their resolved addresses.
struct System<'c, C> {
    addresses: ContractAddresses,
    oracle: ContractHandle<'c, C, PriceOracle>,
    distributor: ContractHandle<'c, C, RewardDistributor>,
    manager: ContractHandle<'c, C, VaultManager>,
    vault: ContractHandle<'c, C, TokenVault>,
}

#[derive(Default)]
struct Progress {
    applied: Vec<AppliedOperation>,
    roles: Vec<RoleGrant>,
}

impl Progress {
    fn gas_used(&self) -> u64 {
        self.applied.iter().map(|op| op.gas_used).sum()
    }

    fn push(&mut self, phase: Phase, contract: ContractName, operation: String, receipt: TxReceipt) {
        self.applied.push(AppliedOperation {
            phase,
            contract,
            operation,
            tx_hash: receipt.tx_hash,
            gas_used: receipt.gas_used,
        });
    }
}

pub struct Configurator<'a, C> {
    chain: &'a C,
    network: &'a NetworkConfig,
    config: &'a PipelineConfig,
}

impl<'a, C: ChainClient> Configurator<'a, C> {
    pub fn new(chain: &'a C, network: &'a NetworkConfig, config: &'a PipelineConfig) -> Self {
        Self {
            chain,
            network,
            config,
        }
    }

    /// Run the configure stage against `record`.
    ///
    /// Every precondition is checked before the first transaction. The record handed to
    /// `checkpoint` has `integrationComplete` cleared while the stage runs and set only
    /// once every operation is confirmed.
    pub async fn configure<F>(
        &self,
        mut record: DeploymentRecord,
        mut checkpoint: F,
    ) -> Result<ConfigureOutcome>
    where
        F: FnMut(&DeploymentRecord) -> Result<()>,
    {
        record.ensure_network(self.network)?;
        let addresses = record.require_complete()?;
        self.network.ensure_chain_id(self.chain.chain_id().await?)?;
        self.config.system.validate()?;
        self.config.deploy.min_deposit_wei()?;

        for name in ContractName::DEPLOY_ORDER {
            let address = addresses.get(name);
            if self.chain.code_at(address).await?.is_empty() {
                return Err(PipelineError::configuration(format!(
                    "no code at {address} for {name}, was the chain reset since deployment?"
                ))
                .into());
            }
        }

        record.integration_complete = false;
        record.failed_stage = None;
        checkpoint(&record)?;

        let factory = ContractFactory::new(self.chain, &record);
        let system = System {
            addresses,
            oracle: factory.handle::<PriceOracle>()?,
            distributor: factory.handle::<RewardDistributor>()?,
            manager: factory.handle::<VaultManager>()?,
            vault: factory.handle::<TokenVault>()?,
        };

        let mut progress = Progress::default();
        let result = self.run_phases(&system, &mut progress).await;
        drop(system);
        record.configure_gas_used = progress.gas_used();

        if let Err(err) = result {
            let operation = match err.downcast_ref::<PipelineError>() {
                Some(PipelineError::TransactionFailure {
                    contract, operation, ..
                }) => format!("{contract}.{operation}"),
                _ => "configuration".to_string(),
            };
            tracing::error!(
                operation = %operation,
                applied = progress.applied.len(),
                "Configuration aborted, integration left incomplete"
            );
            record.mark_failed(STAGE, operation, &err);
            if let Err(save_err) = checkpoint(&record) {
                tracing::warn!(error = %save_err, "Failed to record the failed configuration step");
            }
            return Err(err);
        }

        record.integration_complete = true;
        record.timestamp = chrono::Utc::now();
        checkpoint(&record)?;

        let outcome = ConfigureOutcome {
            record,
            applied: progress.applied,
            roles: progress.roles,
        };
        tracing::info!(
            operations = outcome.applied.len(),
            roles = outcome.roles.len(),
            gas_used = outcome.total_gas_used(),
            "Integration complete"
        );
        Ok(outcome)
    }

    async fn run_phases(&self, system: &System<'_, C>, progress: &mut Progress) -> Result<()> {
        tracing::info!(phase = %Phase::Linking, "Starting phase");
        self.link(system, progress).await?;

        tracing::info!(phase = %Phase::Permissions, "Starting phase");
        self.grant_permissions(system, progress).await?;

        tracing::info!(phase = %Phase::Parameters, "Starting phase");
        self.set_parameters(system, progress).await
    }

    /// Point TokenVault at its collaborators and register it with them.
    async fn link(&self, system: &System<'_, C>, progress: &mut Progress) -> Result<()> {
        let addrs = &system.addresses;
        let phase = Phase::Linking;

        apply(&system.vault, phase, progress, ITokenVault::setManagerCall {
            manager: addrs.vault_manager,
        })
        .await?;
        apply(&system.vault, phase, progress, ITokenVault::setRewardDistributorCall {
            distributor: addrs.reward_distributor,
        })
        .await?;
        apply(&system.vault, phase, progress, ITokenVault::setPriceOracleCall {
            oracle: addrs.price_oracle,
        })
        .await?;
        apply(&system.distributor, phase, progress, IRewardDistributor::addVaultCall {
            vault: addrs.token_vault,
        })
        .await?;
        apply(&system.distributor, phase, progress, IRewardDistributor::setRewardTokenCall {
            token: self.config.deploy.reward_token,
        })
        .await?;
        apply(&system.manager, phase, progress, IVaultManager::addVaultCall {
            vault: addrs.token_vault,
        })
        .await
    }

    async fn grant_permissions(&self, system: &System<'_, C>, progress: &mut Progress) -> Result<()> {
        let addrs = &system.addresses;

        grant(&system.vault, progress, Role::Admin, addrs.vault_manager).await?;
        grant(&system.distributor, progress, Role::Vault, addrs.token_vault).await?;
        apply(
            &system.manager,
            Phase::Permissions,
            progress,
            IVaultManager::registerDepositorCall {
                source: addrs.token_vault,
            },
        )
        .await
    }

    async fn set_parameters(&self, system: &System<'_, C>, progress: &mut Progress) -> Result<()> {
        let params = &self.config.system;
        let phase = Phase::Parameters;

        apply(&system.oracle, phase, progress, IPriceOracle::setUpdateIntervalCall {
            interval: U256::from(params.price_update_interval_secs),
        })
        .await?;
        apply(&system.oracle, phase, progress, IPriceOracle::setStalenessThresholdCall {
            threshold: U256::from(params.price_staleness_threshold_secs),
        })
        .await?;
        apply(&system.distributor, phase, progress, IRewardDistributor::setRewardRateCall {
            rate: params.reward_rate_wei()?,
        })
        .await?;
        apply(
            &system.distributor,
            phase,
            progress,
            IRewardDistributor::setDistributionIntervalCall {
                interval: U256::from(params.distribution_interval_secs),
            },
        )
        .await?;
        apply(&system.distributor, phase, progress, IRewardDistributor::setFeeShareCall {
            bps: U256::from(params.fee_share_bps),
        })
        .await?;
        apply(&system.vault, phase, progress, ITokenVault::setFeeRateCall {
            bps: U256::from(self.config.deploy.fee_rate_bps),
        })
        .await?;
        apply(&system.vault, phase, progress, ITokenVault::setMinDepositCall {
            amount: self.config.deploy.min_deposit_wei()?,
        })
        .await?;
        apply(&system.manager, phase, progress, IVaultManager::setVaultCapCall {
            cap: params.vault_cap_wei()?,
        })
        .await
    }
}

async fn apply<C, I, Call>(
    handle: &ContractHandle<'_, C, I>,
    phase: Phase,
    progress: &mut Progress,
    call: Call,
) -> Result<()>
where
    C: ChainClient,
    I: ContractInterface,
    Call: CallOf<I>,
{
    let receipt = handle.send(STAGE, call).await?;
    progress.push(phase, I::NAME, Call::SIGNATURE.to_string(), receipt);
    Ok(())
}

async fn grant<C, I>(
    handle: &ContractHandle<'_, C, I>,
    progress: &mut Progress,
    role: Role,
    grantee: Address,
) -> Result<()>
where
    C: ChainClient,
    I: ContractInterface,
{
    let receipt = handle.grant_role(STAGE, role, grantee).await?;
    progress.push(
        Phase::Permissions,
        I::NAME,
        format!("grantRole({role})"),
        receipt,
    );
    progress.roles.push(RoleGrant {
        role,
        grantee,
        contract: I::NAME,
    });
    Ok(())
}
