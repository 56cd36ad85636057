//! vaultctl runs the vault deployment pipeline one stage at a time.

mod cli;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use cli::{Cli, Command};
use vault_deploy::{
    ArtifactStore, Configurator, DeploymentRecord, Deployer, EtherscanClient, NetworkConfig,
    PipelineConfig, PipelineError, RpcChain, SourcePublisher, Verifier,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let kind = match err.downcast_ref::<PipelineError>() {
                Some(e) if e.is_precondition() => "precondition failed",
                Some(PipelineError::TransactionFailure { .. }) => "transaction failed",
                Some(PipelineError::VerificationMismatch { .. }) => "verification failed",
                _ => "error",
            };
            let message = format!("{err:#}");
            tracing::error!(error = %message, "Stage failed: {kind}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = PipelineConfig::load(cli.config.as_deref())?;
    let network = NetworkConfig::resolve(&cli.network, &config)?;
    let artifacts = ArtifactStore::new(&cli.artifacts_dir);
    let deployments_dir = cli.deployments_dir;

    tracing::info!(
        network = %network.name,
        chain_id = network.chain_id,
        rpc_url = %network.rpc_url,
        signer = %network.wallet.address(),
        "Network resolved"
    );

    let chain = RpcChain::new(&network)?;

    match cli.command {
        Command::Network { write, timeout } => {
            println!("{network}");

            network
                .probe(&chain, timeout)
                .await
                .with_context(|| format!("Endpoint for '{}' is not usable", network.name))?;
            tracing::info!(network = %network.name, "Endpoint reachable, chain id matches");

            if let Some(path) = write {
                config.save(&path)?;
            }
        }

        Command::Deploy { redeploy } => {
            let previous = DeploymentRecord::load_optional(&deployments_dir, &network.name)?;
            let deployer = Deployer::new(&chain, &network, &artifacts, &config.deploy);

            let outcome = deployer
                .deploy(previous, redeploy, |record| {
                    record.save(&deployments_dir).map(|_| ())
                })
                .await?;

            println!(
                "Deployed {} contract(s), reused {}, record at {}",
                outcome.deployed.len(),
                outcome.reused.len(),
                DeploymentRecord::path_for(&deployments_dir, &network.name).display()
            );
            for (name, contract) in &outcome.record.contracts {
                println!("  {name:<18} {} (gas {})", contract.address, contract.gas_used);
            }
        }

        Command::Configure => {
            let record = DeploymentRecord::load(&deployments_dir, &network.name)?;
            let configurator = Configurator::new(&chain, &network, &config);

            let outcome = configurator
                .configure(record, |record| record.save(&deployments_dir).map(|_| ()))
                .await?;

            for op in &outcome.applied {
                println!("  [{}] {}.{} ({})", op.phase, op.contract, op.operation, op.tx_hash);
            }
            for grant in &outcome.roles {
                println!(
                    "  granted {} to {} on {}",
                    grant.role, grant.grantee, grant.contract
                );
            }
            println!(
                "Integration complete: {} operations, {} gas",
                outcome.applied.len(),
                outcome.total_gas_used()
            );
        }

        Command::Verify {
            report: report_path,
            publish_source,
        } => {
            let record = DeploymentRecord::load(&deployments_dir, &network.name)?;
            let verifier = Verifier::new(&chain, &network, &config, &artifacts);

            let mut report = verifier.verify(&record).await?;
            if publish_source {
                let explorer = EtherscanClient::from_network(&network)?;
                let publisher = SourcePublisher::new(&explorer, &network, &artifacts);
                report.checks.push(publisher.publish(&record).await?);
            }
            report.write_to(&report_path)?;
            println!("{report}");

            if !report.passed() {
                return Err(PipelineError::VerificationMismatch {
                    check: report
                        .checks
                        .iter()
                        .filter(|c| !c.passed())
                        .map(|c| c.kind.to_string())
                        .collect::<Vec<_>>()
                        .join(", "),
                    detail: format!(
                        "{} item(s) failed, see {}",
                        report.failed_count(),
                        report_path.display()
                    ),
                }
                .into());
            }
        }
    }

    Ok(())
}
