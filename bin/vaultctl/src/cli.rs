use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;
use vault_deploy::{REPORT_FILENAME, network::LOCAL_NETWORK};

#[derive(Parser)]
#[command(name = "vaultctl")]
#[command(
    author,
    version,
    about = "Deploy, wire up and verify the vault contract system"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, global = true, env = "VAULT_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// The network to run against (e.g. hardhat, plume-testnet).
    #[arg(short, long, global = true, env = "VAULT_NETWORK", default_value = LOCAL_NETWORK)]
    pub network: String,

    /// Path to a configuration file.
    ///
    /// If not provided, `Vault.toml` is used when present in the working directory.
    #[arg(short, long, global = true, env = "VAULT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding one deployment record per network.
    #[arg(long, global = true, env = "VAULT_DEPLOYMENTS_DIR", default_value = "deployments")]
    pub deployments_dir: PathBuf,

    /// Hardhat artifacts directory.
    #[arg(long, global = true, env = "VAULT_ARTIFACTS_DIR", default_value = "artifacts")]
    pub artifacts_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Resolve the network configuration and check the endpoint.
    Network {
        /// Write the effective configuration to this path as TOML.
        #[arg(long)]
        write: Option<PathBuf>,

        /// Seconds to wait for the endpoint to answer.
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },

    /// Deploy the contracts in dependency order.
    Deploy {
        /// Ignore any previous deployment on this network and start over.
        #[arg(long, env = "VAULT_REDEPLOY", default_value_t = false)]
        redeploy: bool,
    },

    /// Link the contracts, grant roles and apply system parameters.
    Configure,

    /// Check the deployment on chain and write a report.
    Verify {
        /// Where to write the Markdown report.
        #[arg(long, env = "VAULT_REPORT", default_value = REPORT_FILENAME)]
        report: PathBuf,

        /// Also publish the contract sources to the network's block explorer.
        #[arg(long, default_value_t = false)]
        publish_source: bool,
    },
}
