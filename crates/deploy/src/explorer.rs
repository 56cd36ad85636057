//! Source publication on Etherscan-compatible block explorers.
//!
//! Each contract is submitted with the standard JSON input Hardhat recorded for it and
//! the constructor arguments stored in the deployment record, then the explorer is
//! polled until it accepts or rejects the submission.

use std::{future::Future, time::Duration};

use alloy_core::primitives::Address;
use anyhow::{Context, Result};
use backon::{ConstantBuilder, Retryable};
use serde::Deserialize;
use url::Url;

use crate::{
    PipelineError,
    contracts::{ArtifactStore, ContractName},
    network::NetworkConfig,
    record::DeploymentRecord,
    report::{CheckItem, CheckKind, CheckResult},
    rpc,
};

/// Time between two status queries.
pub const DEFAULT_STATUS_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Status queries issued before giving up on a submission.
pub const DEFAULT_STATUS_POLLS: usize = 24;

/// Envelope of every Etherscan API answer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExplorerResponse {
    pub status: String,
    pub message: String,
    pub result: String,
}

/// What the explorer did with a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Queued under this GUID.
    Queued(String),
    AlreadyVerified,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationStatus {
    Pending,
    Verified,
    Failed(String),
}

impl ExplorerResponse {
    pub fn into_submission(self) -> Result<Submission> {
        if self.status == "1" {
            return Ok(Submission::Queued(self.result));
        }
        if is_already_verified(&self.result) {
            return Ok(Submission::AlreadyVerified);
        }
        anyhow::bail!("explorer rejected the submission: {} ({})", self.result, self.message)
    }

    pub fn into_status(self) -> VerificationStatus {
        if self.status == "1" || is_already_verified(&self.result) {
            VerificationStatus::Verified
        } else if self.result.to_ascii_lowercase().contains("pending") {
            VerificationStatus::Pending
        } else {
            VerificationStatus::Failed(self.result)
        }
    }
}

fn is_already_verified(result: &str) -> bool {
    result.to_ascii_lowercase().contains("already verified")
}

/// One `verifysourcecode` submission.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRequest {
    pub contract: ContractName,
    pub address: Address,
    /// Fully qualified name, `<sourceName>:<contractName>`.
    pub qualified_name: String,
    /// Compiler version as the explorer expects it, e.g. `v0.8.17+commit.8df45f5f`.
    pub compiler_version: String,
    pub standard_json: String,
    /// Hex without `0x`, empty when the constructor takes no arguments.
    pub constructor_args: String,
    pub optimizer_enabled: bool,
    pub optimizer_runs: u32,
}

impl SourceRequest {
    /// Form fields of the submission, without the API key.
    pub fn form(&self) -> Vec<(&'static str, String)> {
        vec![
            ("module", "contract".to_string()),
            ("action", "verifysourcecode".to_string()),
            ("contractaddress", self.address.to_string()),
            ("sourceCode", self.standard_json.clone()),
            ("codeformat", "solidity-standard-json-input".to_string()),
            ("contractname", self.qualified_name.clone()),
            ("compilerversion", self.compiler_version.clone()),
            // Misspelling is part of the Etherscan API.
            ("constructorArguements", self.constructor_args.clone()),
            (
                "optimizationUsed",
                if self.optimizer_enabled { "1" } else { "0" }.to_string(),
            ),
            ("runs", self.optimizer_runs.to_string()),
        ]
    }
}

/// The two calls of the Etherscan contract verification API.
pub trait ExplorerApi: Send + Sync {
    fn submit(
        &self,
        request: &SourceRequest,
    ) -> impl Future<Output = Result<Submission>> + Send;

    fn status(&self, guid: &str) -> impl Future<Output = Result<VerificationStatus>> + Send;
}

/// [`ExplorerApi`] over HTTP.
pub struct EtherscanClient {
    client: reqwest::Client,
    api_url: Url,
    api_key: String,
}

impl EtherscanClient {
    pub fn new(api_url: Url, api_key: String) -> Result<Self> {
        Ok(Self {
            client: rpc::create_client()?,
            api_url,
            api_key,
        })
    }

    /// Client for the explorer configured on `network`.
    pub fn from_network(network: &NetworkConfig) -> Result<Self> {
        let base = network.explorer_url.as_deref().ok_or_else(|| {
            PipelineError::configuration(format!(
                "network '{}' has no explorer_url, cannot publish sources",
                network.name
            ))
        })?;
        let api_key = network.explorer_api_key.clone().ok_or_else(|| {
            PipelineError::configuration(format!(
                "no explorer API key for '{}', set the variable named by explorer_api_key_env",
                network.name
            ))
        })?;

        let api_url = Url::parse(&format!("{}/api", base.trim_end_matches('/'))).map_err(|e| {
            PipelineError::configuration(format!("invalid explorer URL '{base}': {e}"))
        })?;
        Self::new(api_url, api_key)
    }

    async fn parse(response: reqwest::Response) -> Result<ExplorerResponse> {
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("explorer API request failed: {status}");
        }
        let text = response.text().await.context("Failed to read explorer response")?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse explorer response: {text}"))
    }
}

impl ExplorerApi for EtherscanClient {
    async fn submit(&self, request: &SourceRequest) -> Result<Submission> {
        let mut form = request.form();
        form.push(("apikey", self.api_key.clone()));

        let response = self
            .client
            .post(self.api_url.clone())
            .form(&form)
            .send()
            .await
            .with_context(|| format!("Failed to submit {} to {}", request.contract, self.api_url))?;

        Self::parse(response).await?.into_submission()
    }

    async fn status(&self, guid: &str) -> Result<VerificationStatus> {
        let response = self
            .client
            .get(self.api_url.clone())
            .query(&[
                ("module", "contract"),
                ("action", "checkverifystatus"),
                ("guid", guid),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            .await
            .with_context(|| format!("Failed to query verification status {guid}"))?;

        Ok(Self::parse(response).await?.into_status())
    }
}

/// Publishes the sources of a recorded deployment.
pub struct SourcePublisher<'a, E> {
    explorer: &'a E,
    network: &'a NetworkConfig,
    artifacts: &'a ArtifactStore,
    poll_interval: Duration,
    polls: usize,
}

impl<'a, E: ExplorerApi> SourcePublisher<'a, E> {
    pub fn new(explorer: &'a E, network: &'a NetworkConfig, artifacts: &'a ArtifactStore) -> Self {
        Self {
            explorer,
            network,
            artifacts,
            poll_interval: DEFAULT_STATUS_POLL_INTERVAL,
            polls: DEFAULT_STATUS_POLLS,
        }
    }

    pub fn with_polling(mut self, interval: Duration, polls: usize) -> Self {
        self.poll_interval = interval;
        self.polls = polls.max(1);
        self
    }

    /// Submit every contract and collect one item per contract.
    ///
    /// A contract that cannot be published fails its item without affecting the others.
    pub async fn publish(&self, record: &DeploymentRecord) -> Result<CheckResult> {
        record.ensure_network(self.network)?;

        let mut items = Vec::new();
        for name in ContractName::DEPLOY_ORDER {
            let item_name = format!("{name} source");
            items.push(match self.publish_contract(name, record).await {
                Ok(detail) => {
                    tracing::info!(contract = %name, detail = %detail, "Source published");
                    CheckItem::pass(item_name, detail)
                }
                Err(e) => CheckItem::fail(item_name, format!("{e:#}")),
            });
        }

        Ok(CheckResult::new(CheckKind::Source, items))
    }

    /// The submission for `name`, built from its artifact, build info and record entry.
    pub fn request_for(&self, name: ContractName, record: &DeploymentRecord) -> Result<SourceRequest> {
        let address = record.address_of(name)?;
        let constructor_args = record
            .contracts
            .get(&name)
            .map(|entry| hex::encode(&entry.constructor_args))
            .unwrap_or_default();

        let artifact = self.artifacts.load(name)?;
        let build = self.artifacts.build_info(name)?;
        let compiler = &self.network.compiler;

        if !build.solc_long_version.starts_with(&compiler.version) {
            return Err(PipelineError::configuration(format!(
                "{name} was compiled with solc {}, the network expects {}",
                build.solc_long_version, compiler.version
            ))
            .into());
        }

        let source_name = if artifact.source_name.is_empty() {
            format!("contracts/{name}.sol")
        } else {
            artifact.source_name
        };

        Ok(SourceRequest {
            contract: name,
            address,
            qualified_name: format!("{source_name}:{}", artifact.contract_name),
            compiler_version: format!("v{}", build.solc_long_version),
            standard_json: serde_json::to_string(&build.input)
                .context("Failed to serialize compiler input")?,
            constructor_args,
            optimizer_enabled: compiler.optimizer_enabled,
            optimizer_runs: compiler.optimizer_runs,
        })
    }

    async fn publish_contract(&self, name: ContractName, record: &DeploymentRecord) -> Result<String> {
        let request = self.request_for(name, record)?;
        tracing::info!(contract = %name, address = %request.address, "Submitting source");

        let guid = match self.explorer.submit(&request).await? {
            Submission::AlreadyVerified => {
                return Ok(format!("already verified at {}", request.address));
            }
            Submission::Queued(guid) => guid,
        };

        let explorer = self.explorer;
        let pending = guid.as_str();
        let poll = move || async move {
            match explorer.status(pending).await? {
                VerificationStatus::Pending => {
                    anyhow::bail!("verification {pending} is still pending")
                }
                done => Ok(done),
            }
        };

        let status = poll
            .retry(
                ConstantBuilder::default()
                    .with_delay(self.poll_interval)
                    .with_max_times(self.polls),
            )
            .notify(|err: &anyhow::Error, after: Duration| {
                tracing::debug!(error = %err, retry_in = ?after, "Waiting for the explorer...");
            })
            .await
            .with_context(|| format!("{name} was not verified in time"))?;

        match status {
            VerificationStatus::Failed(reason) => anyhow::bail!("explorer rejected {name}: {reason}"),
            _ => Ok(format!("verified at {} ({guid})", request.address)),
        }
    }
}
