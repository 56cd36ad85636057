//! Network selection and chain parameters shared by every stage.

use std::{collections::BTreeMap, fmt, str::FromStr, time::Duration};

use alloy_core::primitives::Address;
use alloy_signer_local::{MnemonicBuilder, PrivateKeySigner, coins_bip39::English};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{PipelineConfig, PipelineError, chain::ChainClient, rpc};

/// Name of the local development network.
pub const LOCAL_NETWORK: &str = "hardhat";

/// Name of the Plume testnet.
pub const PLUME_TESTNET: &str = "plume-testnet";

/// Chain id of the local development network.
pub const LOCAL_CHAIN_ID: u64 = 31337;

/// Chain id of the Plume testnet.
pub const PLUME_TESTNET_CHAIN_ID: u64 = 98867;

/// Well-known development mnemonic funded by hardhat and anvil nodes.
pub const DEV_MNEMONIC: &str = "test test test test test test test test test test test junk";

/// Solidity compiler settings the artifacts were built with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerSettings {
    pub version: String,
    pub optimizer_enabled: bool,
    pub optimizer_runs: u32,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        Self {
            version: "0.8.17".to_string(),
            optimizer_enabled: true,
            optimizer_runs: 200,
        }
    }
}

/// Where the signing key for a network comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum KeySource {
    /// Derive the key from a mnemonic. Only accepted on local networks.
    Mnemonic { phrase: String, index: u32 },
    /// Read a hex private key from an environment variable.
    PrivateKeyEnv { var: String },
    /// Let the node sign with one of its unlocked accounts.
    Unlocked { address: Address },
}

/// Raw, serializable settings for a single network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    pub chain_id: u64,
    /// Local networks relax the secret requirements.
    #[serde(default)]
    pub local: bool,
    /// Literal RPC URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_url: Option<String>,
    /// Environment variable holding the RPC URL, takes precedence over `rpc_url`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_url_env: Option<String>,
    pub signer: KeySource,
    /// Environment variable holding the block explorer API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explorer_api_key_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explorer_url: Option<String>,
    #[serde(default)]
    pub compiler: CompilerSettings,
    pub confirmation_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Percentage applied to gas estimates, e.g. 120 adds 20% headroom.
    pub gas_limit_multiplier_pct: u64,
}

impl NetworkSettings {
    /// The networks known without any configuration file.
    pub fn builtin() -> BTreeMap<String, NetworkSettings> {
        let mut networks = BTreeMap::new();

        networks.insert(
            LOCAL_NETWORK.to_string(),
            NetworkSettings {
                chain_id: LOCAL_CHAIN_ID,
                local: true,
                rpc_url: Some("http://127.0.0.1:8545".to_string()),
                rpc_url_env: None,
                signer: KeySource::Mnemonic {
                    phrase: DEV_MNEMONIC.to_string(),
                    index: 0,
                },
                explorer_api_key_env: None,
                explorer_url: None,
                compiler: CompilerSettings::default(),
                confirmation_timeout_secs: 30,
                poll_interval_ms: 250,
                gas_limit_multiplier_pct: 120,
            },
        );

        networks.insert(
            PLUME_TESTNET.to_string(),
            NetworkSettings {
                chain_id: PLUME_TESTNET_CHAIN_ID,
                local: false,
                rpc_url: None,
                rpc_url_env: Some("PLUME_RPC_URL".to_string()),
                signer: KeySource::PrivateKeyEnv {
                    var: "PRIVATE_KEY".to_string(),
                },
                explorer_api_key_env: Some("PLUME_EXPLORER_API_KEY".to_string()),
                explorer_url: Some("https://testnet-explorer.plume.org".to_string()),
                compiler: CompilerSettings::default(),
                confirmation_timeout_secs: 180,
                poll_interval_ms: 2000,
                gas_limit_multiplier_pct: 130,
            },
        );

        networks
    }
}

/// Account used to sign pipeline transactions.
#[derive(Debug, Clone)]
pub enum Wallet {
    /// Transactions are signed locally and sent raw.
    Local(PrivateKeySigner),
    /// Transactions are signed by the node (`eth_sendTransaction`).
    Unlocked(Address),
}

impl Wallet {
    pub fn address(&self) -> Address {
        match self {
            Wallet::Local(signer) => signer.address(),
            Wallet::Unlocked(address) => *address,
        }
    }
}

/// Fully resolved network configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub name: String,
    pub chain_id: u64,
    pub rpc_url: Url,
    pub local: bool,
    pub compiler: CompilerSettings,
    pub wallet: Wallet,
    pub explorer_url: Option<String>,
    pub explorer_api_key: Option<String>,
    pub confirmation_timeout: Duration,
    pub poll_interval: Duration,
    pub gas_limit_multiplier_pct: u64,
}

impl NetworkConfig {
    /// Resolve a network against the process environment.
    pub fn resolve(name: &str, config: &PipelineConfig) -> Result<Self> {
        Self::resolve_with(name, config, |var| std::env::var(var).ok())
    }

    /// Resolve a network using `env` to look up environment variables.
    pub fn resolve_with(
        name: &str,
        config: &PipelineConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let settings = config.networks.get(name).ok_or_else(|| {
            PipelineError::configuration(format!(
                "unknown network '{}', known networks: {}",
                name,
                config.networks.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })?;

        let non_empty = |var: &str| env(var).filter(|v| !v.trim().is_empty());

        let raw_url = match (&settings.rpc_url_env, &settings.rpc_url) {
            (Some(var), fallback) => non_empty(var).or_else(|| fallback.clone()).ok_or_else(|| {
                PipelineError::configuration(format!(
                    "{var} must be set to target network '{name}'"
                ))
            })?,
            (None, Some(url)) => url.clone(),
            (None, None) => {
                return Err(PipelineError::configuration(format!(
                    "network '{name}' has no RPC endpoint"
                ))
                .into());
            }
        };

        let rpc_url = Url::parse(&raw_url).map_err(|e| {
            PipelineError::configuration(format!("invalid RPC URL for '{name}': {e}"))
        })?;

        let wallet = match &settings.signer {
            KeySource::Mnemonic { .. } if !settings.local => {
                return Err(PipelineError::configuration(format!(
                    "mnemonic signers are only allowed on local networks, '{name}' is remote"
                ))
                .into());
            }
            KeySource::Mnemonic { phrase, index } => {
                let signer = MnemonicBuilder::<English>::default()
                    .phrase(phrase.as_str())
                    .index(*index)
                    .context("Invalid mnemonic derivation index")?
                    .build()
                    .map_err(|e| {
                        PipelineError::configuration(format!("invalid mnemonic: {e}"))
                    })?;
                Wallet::Local(signer)
            }
            KeySource::PrivateKeyEnv { var } => {
                let key = non_empty(var).ok_or_else(|| {
                    PipelineError::configuration(format!(
                        "{var} must be set to sign transactions on '{name}'"
                    ))
                })?;
                let signer = PrivateKeySigner::from_str(key.trim()).map_err(|_| {
                    PipelineError::configuration(format!("{var} is not a valid private key"))
                })?;
                Wallet::Local(signer)
            }
            KeySource::Unlocked { address } => Wallet::Unlocked(*address),
        };

        let explorer_api_key = settings.explorer_api_key_env.as_deref().and_then(|var| non_empty(var));
        if !settings.local && settings.explorer_api_key_env.is_some() && explorer_api_key.is_none()
        {
            tracing::warn!(
                network = %name,
                "No explorer API key found, sources cannot be published"
            );
        }

        Ok(Self {
            name: name.to_string(),
            chain_id: settings.chain_id,
            rpc_url,
            local: settings.local,
            compiler: settings.compiler.clone(),
            wallet,
            explorer_url: settings.explorer_url.clone(),
            explorer_api_key,
            confirmation_timeout: Duration::from_secs(settings.confirmation_timeout_secs),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            gas_limit_multiplier_pct: settings.gas_limit_multiplier_pct,
        })
    }

    /// Wait for the endpoint to answer and check it serves the configured chain.
    pub async fn probe<C: ChainClient>(&self, chain: &C, timeout_secs: u64) -> Result<()> {
        rpc::wait_until_ready(&self.name, timeout_secs, || async {
            chain.chain_id().await.map(|_| ())
        })
        .await?;

        self.ensure_chain_id(chain.chain_id().await?)
    }

    /// Fail with [`PipelineError::NetworkMismatch`] if `actual` is not this network's chain id.
    pub fn ensure_chain_id(&self, actual: u64) -> Result<()> {
        if actual != self.chain_id {
            return Err(PipelineError::NetworkMismatch {
                expected: format!("{} (chain id {})", self.name, self.chain_id),
                actual: format!("chain id {actual}"),
            }
            .into());
        }
        Ok(())
    }
}

impl fmt::Display for NetworkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Network:       {}", self.name)?;
        writeln!(f, "Chain ID:      {}", self.chain_id)?;
        writeln!(f, "RPC endpoint:  {}", self.rpc_url)?;
        writeln!(f, "Local:         {}", self.local)?;
        let mode = match self.wallet {
            Wallet::Local(_) => "local key",
            Wallet::Unlocked(_) => "unlocked node account",
        };
        writeln!(f, "Signer:        {} ({})", self.wallet.address(), mode)?;
        writeln!(
            f,
            "Compiler:      solc {} (optimizer: {}, runs: {})",
            self.compiler.version, self.compiler.optimizer_enabled, self.compiler.optimizer_runs
        )?;
        if let Some(url) = &self.explorer_url {
            let key = if self.explorer_api_key.is_some() { "set" } else { "missing" };
            writeln!(f, "Explorer:      {} (API key {})", url, key)?;
        }
        write!(
            f,
            "Confirmation:  timeout {}s, poll every {}ms",
            self.confirmation_timeout.as_secs(),
            self.poll_interval.as_millis()
        )
    }
}
