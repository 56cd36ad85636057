//! vault-deploy - Deployment pipeline for the vault contract system.
//!
//! The pipeline runs four stages against a selected network: resolving the network
//! configuration, deploying PriceOracle, RewardDistributor, VaultManager and TokenVault,
//! wiring them together, and verifying the result on chain. Sources can optionally be
//! published to the network's block explorer.

pub mod abi;
pub mod chain;
mod config;
pub mod configurator;
pub mod contracts;
pub mod deployer;
mod deployment_hash;
mod error;
pub mod explorer;
mod fs;
pub mod network;
pub mod record;
pub mod report;
pub mod rpc;
pub mod verifier;

pub use chain::{ChainClient, RpcChain, TxReceipt, TxRequest};
pub use config::{
    CONFIG_FILENAME, DeployParams, ENV_PREFIX, PUSD_TOKEN, PipelineConfig, PriceFeed, SystemParams,
};
pub use configurator::{AppliedOperation, ConfigureOutcome, Configurator, Phase, RoleGrant};
pub use contracts::{ArtifactStore, ContractName};
pub use deployer::{DeployOutcome, Deployer};
pub use deployment_hash::DeploymentConfigHash;
pub use error::PipelineError;
pub use explorer::{EtherscanClient, ExplorerApi, SourcePublisher};
pub use fs::FsHandler;
pub use network::{KeySource, NetworkConfig, NetworkSettings, Wallet};
pub use record::{ContractAddresses, DeploymentRecord};
pub use report::{CheckItem, CheckKind, CheckResult, REPORT_FILENAME, VerificationReport};
pub use verifier::Verifier;
