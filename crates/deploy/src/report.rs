//! Verification report and its renderings.

use std::{fmt, fmt::Write as _, path::Path};

use alloy_core::primitives::{Address, B256};
use anyhow::Result;
use chrono::{DateTime, Utc};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets::UTF8_FULL};
use serde::Serialize;

use crate::{
    contracts::ContractName,
    fs::FsHandler,
    network::CompilerSettings,
    record::{DeploymentRecord, FailedStage},
};

/// The default name of the generated report.
pub const REPORT_FILENAME: &str = "DEPLOYMENT_REPORT.md";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
pub enum CheckKind {
    Deployment,
    Configuration,
    Interaction,
    /// Source publication on the block explorer, only run on request.
    Source,
}

/// One verified property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckItem {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

impl CheckItem {
    pub fn pass(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            detail: detail.into(),
        }
    }

    pub fn fail(name: impl Into<String>, detail: impl Into<String>) -> Self {
        let item = Self {
            name: name.into(),
            passed: false,
            detail: detail.into(),
        };
        tracing::warn!(check = %item.name, detail = %item.detail, "Check failed");
        item
    }
}

/// The items of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub kind: CheckKind,
    pub items: Vec<CheckItem>,
}

impl CheckResult {
    pub fn new(kind: CheckKind, items: Vec<CheckItem>) -> Self {
        Self { kind, items }
    }

    /// A check with no items has not verified anything and does not pass.
    pub fn passed(&self) -> bool {
        !self.items.is_empty() && self.items.iter().all(|item| item.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckItem> {
        self.items.iter().filter(|item| !item.passed)
    }
}

/// Deployment facts about one contract, as recorded by the deployer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContractSummary {
    pub name: ContractName,
    pub address: Option<String>,
    pub tx_hash: Option<B256>,
    pub gas_used: Option<u64>,
    pub block_number: Option<u64>,
}

impl ContractSummary {
    pub fn from_record(name: ContractName, record: &DeploymentRecord) -> Self {
        let entry = record.contracts.get(&name);
        Self {
            name,
            address: entry.map(|e| e.address.clone()),
            tx_hash: entry.map(|e| e.tx_hash),
            gas_used: entry.map(|e| e.gas_used),
            block_number: entry.map(|e| e.block_number),
        }
    }
}

/// Everything the verifier found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub network: String,
    pub chain_id: u64,
    pub generated_at: DateTime<Utc>,
    pub compiler: CompilerSettings,
    pub deployer: Address,
    pub deployed_at: DateTime<Utc>,
    pub integration_complete: bool,
    pub failed_stage: Option<FailedStage>,
    pub contracts: Vec<ContractSummary>,
    /// Gas spent by the last configure run.
    pub configuration_gas_used: u64,
    pub checks: Vec<CheckResult>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(CheckResult::passed)
    }

    pub fn passed_count(&self) -> usize {
        self.checks
            .iter()
            .flat_map(|c| &c.items)
            .filter(|i| i.passed)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.checks.iter().flat_map(CheckResult::failures).count()
    }

    /// Gas spent on contract creation.
    pub fn deployment_gas_used(&self) -> u64 {
        self.contracts.iter().filter_map(|c| c.gas_used).sum()
    }

    pub fn total_gas_used(&self) -> u64 {
        self.deployment_gas_used() + self.configuration_gas_used
    }

    /// Render the report as a Markdown document.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = self.write_markdown(&mut out);
        out
    }

    fn write_markdown(&self, out: &mut String) -> fmt::Result {
        writeln!(out, "# Vault Deployment Report")?;
        writeln!(out)?;
        writeln!(out, "## Summary")?;
        writeln!(out)?;
        writeln!(out, "| | |")?;
        writeln!(out, "|---|---|")?;
        writeln!(out, "| Network | {} (chain id {}) |", self.network, self.chain_id)?;
        writeln!(out, "| Deployer | `{}` |", self.deployer)?;
        writeln!(out, "| Last deployment update | {} |", self.deployed_at.to_rfc3339())?;
        writeln!(out, "| Report generated | {} |", self.generated_at.to_rfc3339())?;
        writeln!(
            out,
            "| Compiler | solc {} (optimizer {}, {} runs) |",
            self.compiler.version,
            if self.compiler.optimizer_enabled { "on" } else { "off" },
            self.compiler.optimizer_runs
        )?;
        writeln!(out, "| Integration complete | {} |", self.integration_complete)?;
        writeln!(
            out,
            "| Result | {} ({} passed, {} failed) |",
            if self.passed() { "PASS" } else { "FAIL" },
            self.passed_count(),
            self.failed_count()
        )?;
        if let Some(failed) = &self.failed_stage {
            writeln!(
                out,
                "| Last failure | {} at {}: {} |",
                failed.stage,
                failed.operation,
                escape(&failed.error)
            )?;
        }
        writeln!(out)?;

        writeln!(out, "## Contract Addresses")?;
        writeln!(out)?;
        writeln!(out, "| Contract | Address | Block | Transaction |")?;
        writeln!(out, "|---|---|---|---|")?;
        for contract in &self.contracts {
            writeln!(
                out,
                "| {} | {} | {} | {} |",
                contract.name,
                contract
                    .address
                    .as_deref()
                    .map(|a| format!("`{a}`"))
                    .unwrap_or_else(|| "not deployed".to_string()),
                optional(contract.block_number),
                contract
                    .tx_hash
                    .map(|h| format!("`{h}`"))
                    .unwrap_or_else(|| "-".to_string()),
            )?;
        }
        writeln!(out)?;

        writeln!(out, "## Gas Usage")?;
        writeln!(out)?;
        writeln!(out, "| Step | Gas used |")?;
        writeln!(out, "|---|---|")?;
        for contract in &self.contracts {
            writeln!(out, "| Deploy {} | {} |", contract.name, optional(contract.gas_used))?;
        }
        writeln!(out, "| Deployment subtotal | {} |", self.deployment_gas_used())?;
        writeln!(out, "| Configuration | {} |", self.configuration_gas_used)?;
        writeln!(out, "| **Total** | **{}** |", self.total_gas_used())?;
        writeln!(out)?;

        for check in &self.checks {
            writeln!(
                out,
                "## {} Check: {}",
                check.kind,
                if check.passed() { "PASS" } else { "FAIL" }
            )?;
            writeln!(out)?;
            writeln!(out, "| Status | Item | Detail |")?;
            writeln!(out, "|---|---|---|")?;
            for item in &check.items {
                writeln!(
                    out,
                    "| {} | {} | {} |",
                    status_icon(item.passed),
                    escape(&item.name),
                    escape(&item.detail)
                )?;
            }
            writeln!(out)?;
        }

        writeln!(out, "## Health Summary")?;
        writeln!(out)?;
        for check in &self.checks {
            let failed = check.failures().count();
            writeln!(
                out,
                "- {} {}: {}/{} items passed",
                status_icon(check.passed()),
                check.kind,
                check.items.len() - failed,
                check.items.len()
            )?;
        }
        if !self.passed() {
            writeln!(out)?;
            writeln!(out, "Failed items:")?;
            writeln!(out)?;
            for check in &self.checks {
                for item in check.failures() {
                    writeln!(out, "- {} / {}: {}", check.kind, item.name, item.detail)?;
                }
            }
        }

        Ok(())
    }

    /// Write the Markdown rendering to `path`.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        FsHandler::write_atomic(path, self.to_markdown().as_bytes())?;
        tracing::info!(path = %path.display(), "Deployment report written");
        Ok(())
    }

    /// A console table with one row per check item.
    pub fn console_table(&self) -> Table {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec!["Check", "Item", "Status", "Detail"]);

        for check in &self.checks {
            for item in &check.items {
                let status = if item.passed {
                    Cell::new("PASS").fg(Color::Green)
                } else {
                    Cell::new("FAIL").fg(Color::Red)
                };
                table.add_row(vec![
                    Cell::new(check.kind),
                    Cell::new(&item.name),
                    status,
                    Cell::new(&item.detail),
                ]);
            }
        }

        table
    }
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.passed() { "PASS" } else { "FAIL" };
        writeln!(f, "Verification: {} on {}", status, self.network)?;
        writeln!(f)?;
        writeln!(f, "{}", self.console_table())?;
        write!(
            f,
            "{} passed, {} failed, gas {} (deployment {}, configuration {})",
            self.passed_count(),
            self.failed_count(),
            self.total_gas_used(),
            self.deployment_gas_used(),
            self.configuration_gas_used
        )
    }
}

fn status_icon(passed: bool) -> &'static str {
    if passed { "[ok]" } else { "[FAIL]" }
}

fn optional(value: Option<u64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

/// Keep free text from breaking Markdown table rows.
fn escape(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}
