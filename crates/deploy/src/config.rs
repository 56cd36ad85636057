//! Layered pipeline configuration.
//!
//! Defaults are compiled in, then overridden by an optional `Vault.toml` and finally by
//! `VAULT_*` environment variables (`__` separates nested keys, e.g.
//! `VAULT_SYSTEM__FEE_SHARE_BPS=2500`).

use std::{collections::BTreeMap, path::Path};

use alloy_core::primitives::{Address, U256, address, utils::parse_ether};
use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::{PipelineError, fs::FsHandler, network::NetworkSettings};

/// The default name for the pipeline configuration file.
pub const CONFIG_FILENAME: &str = "Vault.toml";

/// Prefix of the environment variables overriding the configuration.
pub const ENV_PREFIX: &str = "VAULT_";

/// PUSD on Plume testnet, used as the reward token.
pub const PUSD_TOKEN: Address = address!("1e0e030abcb4f07de629dccea458a271e0e82624");

/// A price feed handed to the PriceOracle constructor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceFeed {
    /// Symbol of the priced asset.
    pub symbol: String,
    /// Address of the feed contract.
    pub feed: Address,
}

/// Parameters baked into the contracts at construction time.
///
/// Changing any of these invalidates an existing deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployParams {
    /// Price feeds, in the order they are passed to the PriceOracle.
    pub price_feeds: Vec<PriceFeed>,
    /// Vault fee rate in basis points.
    pub fee_rate_bps: u64,
    /// Minimum deposit, in native token units (e.g. "0.1").
    pub min_deposit: String,
    /// Token paid out by the RewardDistributor.
    pub reward_token: Address,
}

impl DeployParams {
    pub fn min_deposit_wei(&self) -> Result<U256> {
        parse_ether(&self.min_deposit)
            .map_err(|e| PipelineError::configuration(format!("invalid min_deposit: {e}")).into())
    }

    pub fn feed_addresses(&self) -> Vec<Address> {
        self.price_feeds.iter().map(|f| f.feed).collect()
    }
}

impl Default for DeployParams {
    fn default() -> Self {
        Self {
            price_feeds: vec![
                PriceFeed {
                    symbol: "PLUME".to_string(),
                    feed: address!("1000000000000000000000000000000000000001"),
                },
                PriceFeed {
                    symbol: "PUSD".to_string(),
                    feed: address!("1000000000000000000000000000000000000002"),
                },
            ],
            fee_rate_bps: 100,
            min_deposit: "0.1".to_string(),
            reward_token: PUSD_TOKEN,
        }
    }
}

/// Runtime parameters written by the configurator's parameter phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemParams {
    /// Seconds between price feed refreshes.
    pub price_update_interval_secs: u64,
    /// Age after which an oracle price is considered stale.
    pub price_staleness_threshold_secs: u64,
    /// Reward tokens emitted per distribution, in token units.
    pub reward_rate: String,
    /// Seconds between reward distributions.
    pub distribution_interval_secs: u64,
    /// Share of vault fees forwarded to the reward pool, in basis points.
    pub fee_share_bps: u64,
    /// Maximum total deposits accepted by a vault, in native token units.
    pub vault_cap: String,
}

impl SystemParams {
    pub fn reward_rate_wei(&self) -> Result<U256> {
        parse_ether(&self.reward_rate)
            .map_err(|e| PipelineError::configuration(format!("invalid reward_rate: {e}")).into())
    }

    pub fn vault_cap_wei(&self) -> Result<U256> {
        parse_ether(&self.vault_cap)
            .map_err(|e| PipelineError::configuration(format!("invalid vault_cap: {e}")).into())
    }

    /// Rejects values the contracts would revert on.
    pub fn validate(&self) -> Result<()> {
        if self.fee_share_bps > 10_000 {
            return Err(PipelineError::configuration(format!(
                "fee_share_bps must be at most 10000, got {}",
                self.fee_share_bps
            ))
            .into());
        }
        if self.price_update_interval_secs == 0 || self.distribution_interval_secs == 0 {
            return Err(PipelineError::configuration("intervals must be non-zero").into());
        }
        if self.price_staleness_threshold_secs < self.price_update_interval_secs {
            return Err(PipelineError::configuration(
                "price_staleness_threshold_secs must not be shorter than the update interval",
            )
            .into());
        }
        self.reward_rate_wei()?;
        self.vault_cap_wei()?;
        Ok(())
    }
}

impl Default for SystemParams {
    fn default() -> Self {
        Self {
            price_update_interval_secs: 3600,
            price_staleness_threshold_secs: 86_400,
            reward_rate: "10".to_string(),
            distribution_interval_secs: 86_400,
            fee_share_bps: 5000,
            vault_cap: "1000000".to_string(),
        }
    }
}

/// Complete configuration of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Known networks, keyed by name.
    pub networks: BTreeMap<String, NetworkSettings>,
    /// Construction-time parameters.
    pub deploy: DeployParams,
    /// Parameters applied by the configurator.
    pub system: SystemParams,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            networks: NetworkSettings::builtin(),
            deploy: DeployParams::default(),
            system: SystemParams::default(),
        }
    }
}

impl PipelineConfig {
    /// Load the configuration, layering defaults, the optional TOML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        match path {
            Some(path) if !path.exists() => {
                return Err(PipelineError::configuration(format!(
                    "configuration file not found: {}",
                    path.display()
                ))
                .into());
            }
            Some(path) => figment = figment.merge(Toml::file(path)),
            None if Path::new(CONFIG_FILENAME).exists() => {
                figment = figment.merge(Toml::file(CONFIG_FILENAME))
            }
            None => {}
        }

        let config: Self = figment
            .merge(
                Env::prefixed(ENV_PREFIX)
                    .split("__")
                    .ignore(&[
                        "network",
                        "verbosity",
                        "config",
                        "deployments_dir",
                        "artifacts_dir",
                        "redeploy",
                        "report",
                    ]),
            )
            .extract()
            .context("Failed to load pipeline configuration")?;

        config.system.validate()?;
        config.deploy.min_deposit_wei()?;

        tracing::debug!(networks = config.networks.len(), "Configuration loaded");
        Ok(config)
    }

    /// Serialize the configuration to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }

    /// Write the configuration to `path` as TOML.
    pub fn save(&self, path: &Path) -> Result<()> {
        FsHandler::write_atomic(path, self.to_toml()?.as_bytes())
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }
}
