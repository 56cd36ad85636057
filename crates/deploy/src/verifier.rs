//! On-chain verification of a deployment.
//!
//! The three checks are independent: an RPC failure or mismatch inside one of them marks
//! the affected item as failed and never stops the remaining items or checks.

use std::fmt::Display;

use alloy_core::primitives::U256;
use anyhow::Result;
use chrono::Utc;

use crate::{
    PipelineConfig,
    abi::{IPriceOracle, IRewardDistributor, ITokenVault, IVaultManager, Role},
    chain::ChainClient,
    contracts::{
        ArtifactStore, ContractFactory, ContractHandle, ContractName, PriceOracle,
        RewardDistributor, TokenVault, VaultManager,
    },
    network::NetworkConfig,
    record::{ContractAddresses, DeploymentRecord},
    report::{CheckItem, CheckKind, CheckResult, ContractSummary, VerificationReport},
};

pub struct Verifier<'a, C> {
    chain: &'a C,
    network: &'a NetworkConfig,
    config: &'a PipelineConfig,
    artifacts: &'a ArtifactStore,
}

struct System<'c, C> {
    addresses: ContractAddresses,
    oracle: ContractHandle<'c, C, PriceOracle>,
    distributor: ContractHandle<'c, C, RewardDistributor>,
    manager: ContractHandle<'c, C, VaultManager>,
    vault: ContractHandle<'c, C, TokenVault>,
}

impl<'a, C: ChainClient> Verifier<'a, C> {
    pub fn new(
        chain: &'a C,
        network: &'a NetworkConfig,
        config: &'a PipelineConfig,
        artifacts: &'a ArtifactStore,
    ) -> Self {
        Self {
            chain,
            network,
            config,
            artifacts,
        }
    }

    /// Run every check against `record` and collect the results.
    ///
    /// Only a record from another network, or an endpoint serving another chain, is an
    /// error; everything else is reported.
    pub async fn verify(&self, record: &DeploymentRecord) -> Result<VerificationReport> {
        record.ensure_network(self.network)?;
        self.network.ensure_chain_id(self.chain.chain_id().await?)?;

        let checks = vec![
            self.deployment_check(record).await,
            self.configuration_check(record).await,
            self.interaction_check(record).await,
        ];

        let report = VerificationReport {
            network: record.network.clone(),
            chain_id: record.chain_id,
            generated_at: Utc::now(),
            compiler: self.network.compiler.clone(),
            deployer: record.deployer,
            deployed_at: record.timestamp,
            integration_complete: record.integration_complete,
            failed_stage: record.failed_stage.clone(),
            contracts: ContractName::DEPLOY_ORDER
                .into_iter()
                .map(|name| ContractSummary::from_record(name, record))
                .collect(),
            configuration_gas_used: record.configure_gas_used,
            checks,
        };

        tracing::info!(
            passed = report.passed_count(),
            failed = report.failed_count(),
            "Verification finished"
        );
        Ok(report)
    }

    /// Every address is well formed and holds code matching the compiled artifact.
    async fn deployment_check(&self, record: &DeploymentRecord) -> CheckResult {
        let mut items = Vec::new();

        for name in ContractName::DEPLOY_ORDER {
            let address = match record.address_of(name) {
                Ok(address) => address,
                Err(e) => {
                    items.push(CheckItem::fail(format!("{name} address"), format!("{e:#}")));
                    continue;
                }
            };

            let code = match self.chain.code_at(address).await {
                Ok(code) => code,
                Err(e) => {
                    items.push(CheckItem::fail(format!("{name} code"), format!("{e:#}")));
                    continue;
                }
            };

            let item_name = format!("{name} code");
            let item = if code.is_empty() {
                CheckItem::fail(item_name, format!("no code at {address}"))
            } else {
                match self.artifacts.load(name) {
                    Ok(artifact) if artifact.deployed_bytecode.len() == code.len() => {
                        CheckItem::pass(item_name, format!("{} bytes at {address}", code.len()))
                    }
                    Ok(artifact) => CheckItem::fail(
                        item_name,
                        format!(
                            "{} bytes at {address}, artifact has {}",
                            code.len(),
                            artifact.deployed_bytecode.len()
                        ),
                    ),
                    Err(_) => CheckItem::pass(
                        item_name,
                        format!("{} bytes at {address} (no artifact to compare)", code.len()),
                    ),
                }
            };
            items.push(item);
        }

        CheckResult::new(CheckKind::Deployment, items)
    }

    /// Cross references, roles, registrations and parameters match the expected wiring.
    async fn configuration_check(&self, record: &DeploymentRecord) -> CheckResult {
        let system = match self.system(record) {
            Ok(system) => system,
            Err(item) => return CheckResult::new(CheckKind::Configuration, vec![item]),
        };
        let addrs = &system.addresses;
        let deploy = &self.config.deploy;
        let params = &self.config.system;

        let mut items = vec![
            expect_eq(
                "TokenVault.manager",
                system.vault.read(ITokenVault::managerCall {}).await,
                addrs.vault_manager,
            ),
            expect_eq(
                "TokenVault.rewardDistributor",
                system.vault.read(ITokenVault::rewardDistributorCall {}).await,
                addrs.reward_distributor,
            ),
            expect_eq(
                "TokenVault.priceOracle",
                system.vault.read(ITokenVault::priceOracleCall {}).await,
                addrs.price_oracle,
            ),
            expect_eq(
                "RewardDistributor.priceOracle",
                system.distributor.read(IRewardDistributor::priceOracleCall {}).await,
                addrs.price_oracle,
            ),
            expect_eq(
                "RewardDistributor.rewardToken",
                system.distributor.read(IRewardDistributor::rewardTokenCall {}).await,
                deploy.reward_token,
            ),
            expect_eq(
                "RewardDistributor.isVault(TokenVault)",
                system
                    .distributor
                    .read(IRewardDistributor::isVaultCall {
                        vault: addrs.token_vault,
                    })
                    .await,
                true,
            ),
            expect_eq(
                "VaultManager.isVault(TokenVault)",
                system
                    .manager
                    .read(IVaultManager::isVaultCall {
                        vault: addrs.token_vault,
                    })
                    .await,
                true,
            ),
            expect_eq(
                "TokenVault.hasRole(ADMIN_ROLE, VaultManager)",
                system.vault.has_role(Role::Admin, addrs.vault_manager).await,
                true,
            ),
            expect_eq(
                "RewardDistributor.hasRole(VAULT_ROLE, TokenVault)",
                system
                    .distributor
                    .has_role(Role::Vault, addrs.token_vault)
                    .await,
                true,
            ),
            expect_eq(
                "VaultManager.isRegisteredDepositor(TokenVault)",
                system
                    .manager
                    .read(IVaultManager::isRegisteredDepositorCall {
                        source: addrs.token_vault,
                    })
                    .await,
                true,
            ),
            expect_eq(
                "PriceOracle.updateInterval",
                system.oracle.read(IPriceOracle::updateIntervalCall {}).await,
                U256::from(params.price_update_interval_secs),
            ),
            expect_eq(
                "PriceOracle.stalenessThreshold",
                system.oracle.read(IPriceOracle::stalenessThresholdCall {}).await,
                U256::from(params.price_staleness_threshold_secs),
            ),
            expect_eq(
                "RewardDistributor.distributionInterval",
                system
                    .distributor
                    .read(IRewardDistributor::distributionIntervalCall {})
                    .await,
                U256::from(params.distribution_interval_secs),
            ),
            expect_eq(
                "RewardDistributor.feeShare",
                system.distributor.read(IRewardDistributor::feeShareCall {}).await,
                U256::from(params.fee_share_bps),
            ),
            expect_eq(
                "TokenVault.feeRate",
                system.vault.read(ITokenVault::feeRateCall {}).await,
                U256::from(deploy.fee_rate_bps),
            ),
        ];

        // Amounts configured in token units.
        items.push(expect_configured(
            "RewardDistributor.rewardRate",
            system.distributor.read(IRewardDistributor::rewardRateCall {}).await,
            params.reward_rate_wei(),
        ));
        items.push(expect_configured(
            "TokenVault.minDeposit",
            system.vault.read(ITokenVault::minDepositCall {}).await,
            deploy.min_deposit_wei(),
        ));
        items.push(expect_configured(
            "VaultManager.vaultCap",
            system.manager.read(IVaultManager::vaultCapCall {}).await,
            params.vault_cap_wei(),
        ));

        items.push(if record.integration_complete {
            CheckItem::pass("integrationComplete", "set by the configure stage")
        } else {
            CheckItem::fail(
                "integrationComplete",
                match &record.failed_stage {
                    Some(failed) => format!("not set, {} failed at {}", failed.stage, failed.operation),
                    None => "not set, run the configure stage".to_string(),
                },
            )
        });

        CheckResult::new(CheckKind::Configuration, items)
    }

    /// Read-only calls across the contracts return well-formed answers.
    async fn interaction_check(&self, record: &DeploymentRecord) -> CheckResult {
        let system = match self.system(record) {
            Ok(system) => system,
            Err(item) => return CheckResult::new(CheckKind::Interaction, vec![item]),
        };
        let addrs = &system.addresses;
        let amount = self.config.deploy.min_deposit_wei().unwrap_or(U256::from(1u64));

        let mut items = Vec::new();

        for feed in &self.config.deploy.price_feeds {
            let name = format!("PriceOracle.getLatestPrice({})", feed.symbol);
            items.push(
                match system
                    .oracle
                    .read(IPriceOracle::getLatestPriceCall { feed: feed.feed })
                    .await
                {
                    Ok(price) if price.is_zero() => {
                        CheckItem::fail(name, format!("feed {} returned a zero price", feed.feed))
                    }
                    Ok(price) => CheckItem::pass(name, price.to_string()),
                    Err(e) => CheckItem::fail(name, format!("{e:#}")),
                },
            );
        }

        items.push(well_formed(
            "RewardDistributor.calculateReward (from TokenVault)",
            system
                .distributor
                .read_from(
                    Some(addrs.token_vault),
                    IRewardDistributor::calculateRewardCall {
                        vault: addrs.token_vault,
                        amount,
                    },
                )
                .await,
        ));
        items.push(well_formed(
            "TokenVault.totalDeposits",
            system.vault.read(ITokenVault::totalDepositsCall {}).await,
        ));
        items.push(well_formed(
            "TokenVault.getDepositValue",
            system
                .vault
                .read(ITokenVault::getDepositValueCall { amount })
                .await,
        ));
        items.push(
            match system.manager.read(IVaultManager::vaultCountCall {}).await {
                Ok(count) if count >= U256::from(1u64) => {
                    CheckItem::pass("VaultManager.vaultCount", count.to_string())
                }
                Ok(count) => CheckItem::fail(
                    "VaultManager.vaultCount",
                    format!("{count} vaults registered, expected at least 1"),
                ),
                Err(e) => CheckItem::fail("VaultManager.vaultCount", format!("{e:#}")),
            },
        );

        CheckResult::new(CheckKind::Interaction, items)
    }

    /// Handles on all four contracts, or a failed item explaining what is missing.
    fn system<'r>(&self, record: &'r DeploymentRecord) -> Result<System<'r, C>, CheckItem>
    where
        'a: 'r,
    {
        let addresses = record
            .require_complete()
            .map_err(|e| CheckItem::fail("deployment record", format!("{e:#}")))?;

        let factory = ContractFactory::new(self.chain, record);
        let handles = (|| {
            Ok::<_, anyhow::Error>(System {
                addresses,
                oracle: factory.handle::<PriceOracle>()?,
                distributor: factory.handle::<RewardDistributor>()?,
                manager: factory.handle::<VaultManager>()?,
                vault: factory.handle::<TokenVault>()?,
            })
        })();
        handles.map_err(|e| CheckItem::fail("deployment record", format!("{e:#}")))
    }
}

/// Passes when `actual` is readable and equals `expected`.
fn expect_eq<T>(name: &str, actual: Result<T>, expected: T) -> CheckItem
where
    T: PartialEq + Display,
{
    match actual {
        Ok(value) if value == expected => CheckItem::pass(name, value.to_string()),
        Ok(value) => CheckItem::fail(name, format!("expected {expected}, found {value}")),
        Err(e) => CheckItem::fail(name, format!("{e:#}")),
    }
}

/// Like [`expect_eq`], but fails when the expected value itself cannot be derived from
/// the configuration.
fn expect_configured<T>(name: &str, actual: Result<T>, expected: Result<T>) -> CheckItem
where
    T: PartialEq + Display,
{
    match expected {
        Ok(expected) => expect_eq(name, actual, expected),
        Err(e) => CheckItem::fail(name, format!("invalid configured value: {e:#}")),
    }
}

/// Passes when the call returned a decodable value.
fn well_formed<T: Display>(name: &str, response: Result<T>) -> CheckItem {
    match response {
        Ok(value) => CheckItem::pass(name, value.to_string()),
        Err(e) => CheckItem::fail(name, format!("{e:#}")),
    }
}
