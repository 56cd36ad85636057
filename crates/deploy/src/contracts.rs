//! Contract names, compiled artifacts and typed contract handles.

use std::{marker::PhantomData, path::PathBuf, str::FromStr};

use alloy_core::{
    primitives::{Address, Bytes},
    sol_types::SolCall,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    PipelineError,
    abi::{IAccessControl, IPriceOracle, IRewardDistributor, ITokenVault, IVaultManager, Role},
    chain::{ChainClient, TxReceipt, TxRequest},
    record::DeploymentRecord,
};

/// The four contracts of the vault system, declared in deployment order.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
pub enum ContractName {
    PriceOracle,
    RewardDistributor,
    VaultManager,
    TokenVault,
}

impl ContractName {
    /// Deployment order: every contract comes after its dependencies.
    pub const DEPLOY_ORDER: [ContractName; 4] = [
        ContractName::PriceOracle,
        ContractName::RewardDistributor,
        ContractName::VaultManager,
        ContractName::TokenVault,
    ];

    /// Contracts whose addresses are passed to this contract's constructor.
    pub fn dependencies(&self) -> &'static [ContractName] {
        match self {
            ContractName::PriceOracle | ContractName::VaultManager => &[],
            ContractName::RewardDistributor => &[ContractName::PriceOracle],
            ContractName::TokenVault => &[
                ContractName::VaultManager,
                ContractName::RewardDistributor,
                ContractName::PriceOracle,
            ],
        }
    }
}

/// Parse and validate an address (0x-prefixed, 40 hex chars).
pub fn parse_address(addr: &str) -> Result<Address> {
    if !addr.starts_with("0x") || addr.len() != 42 {
        anyhow::bail!(
            "Invalid address format: expected 0x-prefixed 40 hex chars, got '{}'",
            addr
        );
    }

    if !addr[2..].chars().all(|c| c.is_ascii_hexdigit()) {
        anyhow::bail!("Invalid address: contains non-hex characters: '{}'", addr);
    }

    Address::from_str(addr).with_context(|| format!("Invalid address: '{}'", addr))
}

/// A compiled contract as emitted by Hardhat.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub contract_name: String,
    /// Path of the defining source file relative to the project root.
    #[serde(default)]
    pub source_name: String,
    /// Creation code, without constructor arguments.
    pub bytecode: Bytes,
    /// Runtime code.
    pub deployed_bytecode: Bytes,
}

/// Compiler input and version recorded by Hardhat for one compilation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfo {
    /// Full compiler version, e.g. `0.8.17+commit.8df45f5f`.
    pub solc_long_version: String,
    /// Standard JSON input the contracts were compiled from.
    pub input: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DebugFile {
    build_info: PathBuf,
}

/// Reads artifacts from a Hardhat `artifacts/` directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Location of the artifact for `name`: `<root>/contracts/<Name>.sol/<Name>.json`.
    pub fn path_for(&self, name: ContractName) -> PathBuf {
        self.root
            .join("contracts")
            .join(format!("{name}.sol"))
            .join(format!("{name}.json"))
    }

    /// The build info `name` was compiled in, located through its `.dbg.json` file.
    pub fn build_info(&self, name: ContractName) -> Result<BuildInfo> {
        let dbg_path = self.path_for(name).with_extension("dbg.json");
        let content = std::fs::read_to_string(&dbg_path).map_err(|e| {
            PipelineError::configuration(format!(
                "cannot read {}: {e} (compile the contracts first)",
                dbg_path.display()
            ))
        })?;
        let dbg: DebugFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", dbg_path.display()))?;

        let dir = dbg_path.parent().unwrap_or(&self.root);
        let path = dir.join(&dbg.build_info);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read build info {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse build info {}", path.display()))
    }

    pub fn load(&self, name: ContractName) -> Result<Artifact> {
        let path = self.path_for(name);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            PipelineError::configuration(format!(
                "cannot read artifact for {name} at {}: {e} (compile the contracts first)",
                path.display()
            ))
        })?;

        let artifact: Artifact = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse artifact {}", path.display()))?;

        if artifact.bytecode.is_empty() {
            return Err(PipelineError::configuration(format!(
                "artifact for {name} has no creation bytecode (abstract contract or interface?)"
            ))
            .into());
        }

        Ok(artifact)
    }
}

/// Binds a Rust marker type to a contract of the system.
pub trait ContractInterface {
    const NAME: ContractName;
}

/// A call declared by the `sol!` interface of `I`.
///
/// Handles only accept calls implementing this for their own marker, so a
/// TokenVault setter cannot be sent to the VaultManager address.
pub trait CallOf<I: ContractInterface>: SolCall {}

/// Marker for the PriceOracle interface.
pub struct PriceOracle;
/// Marker for the RewardDistributor interface.
pub struct RewardDistributor;
/// Marker for the VaultManager interface.
pub struct VaultManager;
/// Marker for the TokenVault interface.
pub struct TokenVault;

macro_rules! interface {
    ($marker:ident => $module:ident { $($call:ident),* $(,)? }) => {
        impl ContractInterface for $marker {
            const NAME: ContractName = ContractName::$marker;
        }

        $(impl CallOf<$marker> for $module::$call {})*
    };
}

interface!(PriceOracle => IPriceOracle {
    setUpdateIntervalCall,
    setStalenessThresholdCall,
    updateIntervalCall,
    stalenessThresholdCall,
    getLatestPriceCall,
});

interface!(RewardDistributor => IRewardDistributor {
    addVaultCall,
    setRewardTokenCall,
    setRewardRateCall,
    setDistributionIntervalCall,
    setFeeShareCall,
    isVaultCall,
    priceOracleCall,
    rewardTokenCall,
    rewardRateCall,
    distributionIntervalCall,
    feeShareCall,
    calculateRewardCall,
});

interface!(VaultManager => IVaultManager {
    addVaultCall,
    registerDepositorCall,
    setVaultCapCall,
    isVaultCall,
    isRegisteredDepositorCall,
    vaultCapCall,
    vaultCountCall,
});

interface!(TokenVault => ITokenVault {
    setManagerCall,
    setRewardDistributorCall,
    setPriceOracleCall,
    setFeeRateCall,
    setMinDepositCall,
    managerCall,
    rewardDistributorCall,
    priceOracleCall,
    feeRateCall,
    minDepositCall,
    totalDepositsCall,
    getDepositValueCall,
});

/// A deployed contract bound to its address and interface.
///
/// Only calls belonging to the interface `I` (plus access control) can be issued.
pub struct ContractHandle<'c, C, I> {
    chain: &'c C,
    address: Address,
    _interface: PhantomData<I>,
}

impl<'c, C, I> ContractHandle<'c, C, I>
where
    C: ChainClient,
    I: ContractInterface,
{
    pub fn new(chain: &'c C, address: Address) -> Self {
        Self {
            chain,
            address,
            _interface: PhantomData,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn name(&self) -> ContractName {
        I::NAME
    }

    /// Issue a read-only call and decode its return value.
    pub async fn read<Call>(&self, call: Call) -> Result<Call::Return>
    where
        Call: CallOf<I>,
    {
        self.read_from(None, call).await
    }

    /// Issue a read-only call as if sent by `from`.
    pub async fn read_from<Call>(&self, from: Option<Address>, call: Call) -> Result<Call::Return>
    where
        Call: CallOf<I>,
    {
        let output = self
            .chain
            .call(from, self.address, call.abi_encode().into())
            .await
            .with_context(|| format!("{}.{} call failed", I::NAME, Call::SIGNATURE))?;

        Call::abi_decode_returns(&output).with_context(|| {
            format!("{}.{} returned malformed data", I::NAME, Call::SIGNATURE)
        })
    }

    /// Send a state-changing call, attributing failures to `stage`.
    pub async fn send<Call>(&self, stage: &'static str, call: Call) -> Result<TxReceipt>
    where
        Call: CallOf<I>,
    {
        self.transact(stage, Call::SIGNATURE.to_string(), call.abi_encode().into())
            .await
    }

    /// Grant `role` to `account` on this contract.
    pub async fn grant_role(
        &self,
        stage: &'static str,
        role: Role,
        account: Address,
    ) -> Result<TxReceipt> {
        let data = IAccessControl::grantRoleCall {
            role: role.id(),
            account,
        }
        .abi_encode();
        self.transact(stage, format!("grantRole({role})"), data.into())
            .await
    }

    /// Whether `account` holds `role` on this contract.
    pub async fn has_role(&self, role: Role, account: Address) -> Result<bool> {
        let data = IAccessControl::hasRoleCall {
            role: role.id(),
            account,
        }
        .abi_encode();
        let output = self
            .chain
            .call(None, self.address, data.into())
            .await
            .with_context(|| format!("{}.hasRole({role}) call failed", I::NAME))?;

        IAccessControl::hasRoleCall::abi_decode_returns(&output)
            .with_context(|| format!("{}.hasRole({role}) returned malformed data", I::NAME))
    }

    async fn transact(&self, stage: &'static str, operation: String, data: Bytes) -> Result<TxReceipt> {
        tracing::info!(
            contract = %I::NAME,
            address = %self.address,
            operation = %operation,
            "Sending transaction"
        );

        match self
            .chain
            .send_transaction(TxRequest::call(self.address, data))
            .await
        {
            Ok(receipt) => {
                tracing::info!(
                    contract = %I::NAME,
                    operation = %operation,
                    tx_hash = %receipt.tx_hash,
                    gas_used = receipt.gas_used,
                    "Transaction confirmed"
                );
                Ok(receipt)
            }
            Err(e) => Err(PipelineError::TransactionFailure {
                stage,
                operation,
                contract: I::NAME.to_string(),
                address: self.address.to_string(),
                reason: format!("{e:#}"),
            }
            .into()),
        }
    }
}

/// Creates contract handles from the addresses held in a [`DeploymentRecord`].
pub struct ContractFactory<'c, C> {
    chain: &'c C,
    record: &'c DeploymentRecord,
}

impl<'c, C: ChainClient> ContractFactory<'c, C> {
    pub fn new(chain: &'c C, record: &'c DeploymentRecord) -> Self {
        Self { chain, record }
    }

    /// A handle on the contract implementing `I`.
    pub fn handle<I: ContractInterface>(&self) -> Result<ContractHandle<'c, C, I>> {
        let address = self.record.address_of(I::NAME)?;
        Ok(ContractHandle::new(self.chain, address))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use alloy_core::primitives::{B256, U256};
    use strum::IntoEnumIterator;

    use super::*;

    /// Answers every read with a fixed word and remembers the calldata it saw.
    #[derive(Default)]
    struct EchoChain {
        seen: Mutex<Vec<(Option<Address>, Address, Bytes)>>,
    }

    impl ChainClient for EchoChain {
        fn sender(&self) -> Address {
            Address::repeat_byte(0xee)
        }

        async fn chain_id(&self) -> Result<u64> {
            Ok(31337)
        }

        async fn code_at(&self, _: Address) -> Result<Bytes> {
            Ok(Bytes::new())
        }

        async fn call(&self, from: Option<Address>, to: Address, data: Bytes) -> Result<Bytes> {
            self.seen.lock().unwrap().push((from, to, data));
            Ok(U256::from(7u64).to_be_bytes::<32>().to_vec().into())
        }

        async fn send_transaction(&self, tx: TxRequest) -> Result<TxReceipt> {
            if tx.data.len() < 4 {
                anyhow::bail!("execution reverted");
            }
            self.seen.lock().unwrap().push((None, tx.to.unwrap_or_default(), tx.data));
            Ok(TxReceipt {
                tx_hash: B256::repeat_byte(1),
                block_number: 1,
                gas_used: 21_000,
                contract_address: None,
            })
        }
    }

    #[tokio::test]
    async fn test_handle_encodes_interface_calls() {
        let chain = EchoChain::default();
        let manager = Address::repeat_byte(3);
        let handle = ContractHandle::<_, VaultManager>::new(&chain, manager);

        let count = handle
            .read(crate::abi::IVaultManager::vaultCountCall {})
            .await
            .unwrap();
        assert_eq!(count, U256::from(7u64));

        let vault = Address::repeat_byte(4);
        let receipt = handle
            .send("configure", crate::abi::IVaultManager::addVaultCall { vault })
            .await
            .unwrap();
        assert_eq!(receipt.gas_used, 21_000);

        let seen = chain.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1, manager);
        assert_eq!(
            seen[0].2.as_ref(),
            crate::abi::IVaultManager::vaultCountCall {}.abi_encode().as_slice()
        );
        assert_eq!(
            seen[1].2.as_ref(),
            crate::abi::IVaultManager::addVaultCall { vault }.abi_encode().as_slice()
        );
    }

    #[tokio::test]
    async fn test_read_from_forwards_sender() {
        let chain = EchoChain::default();
        let vault = Address::repeat_byte(5);
        let handle = ContractHandle::<_, RewardDistributor>::new(&chain, Address::repeat_byte(6));

        handle
            .read_from(
                Some(vault),
                crate::abi::IRewardDistributor::calculateRewardCall {
                    vault,
                    amount: U256::from(1u64),
                },
            )
            .await
            .unwrap();

        assert_eq!(chain.seen.lock().unwrap()[0].0, Some(vault));
    }

    #[test]
    fn test_dependencies_precede_dependents() {
        for (position, name) in ContractName::DEPLOY_ORDER.iter().enumerate() {
            for dependency in name.dependencies() {
                let dep_position = ContractName::DEPLOY_ORDER
                    .iter()
                    .position(|n| n == dependency)
                    .unwrap();
                assert!(dep_position < position, "{dependency} must precede {name}");
            }
        }
        assert_eq!(
            ContractName::iter().collect::<Vec<_>>(),
            ContractName::DEPLOY_ORDER.to_vec()
        );
    }

    #[test]
    fn test_parse_address_valid() {
        assert!(parse_address("0x70997970C51812dc3A010C7d01b50e0d17dc79C8").is_ok());
        assert!(parse_address("0x0000000000000000000000000000000000000000").is_ok());
        assert!(parse_address("0xdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef").is_ok());
    }

    #[test]
    fn test_parse_address_invalid() {
        assert!(parse_address("0x1234").is_err());
        assert!(parse_address("1234567890abcdef1234567890abcdef12345678").is_err());
        assert!(parse_address("0xGGGGGGGGGGGGGGGGGGGGGGGGGGGGGGGGGGGGGGGG").is_err());
        assert!(parse_address("").is_err());
    }

    #[test]
    fn test_artifact_path_layout() {
        let store = ArtifactStore::new("artifacts");
        assert_eq!(
            store.path_for(ContractName::TokenVault),
            PathBuf::from("artifacts/contracts/TokenVault.sol/TokenVault.json")
        );
    }

    #[test]
    fn test_load_artifact() {
        let dir = tempdir::TempDir::new("vault-artifacts").unwrap();
        let store = ArtifactStore::new(dir.path());
        let path = store.path_for(ContractName::VaultManager);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            r#"{
                "_format": "hh-sol-artifact-1",
                "contractName": "VaultManager",
                "sourceName": "contracts/VaultManager.sol",
                "abi": [],
                "bytecode": "0x6080604052",
                "deployedBytecode": "0x60806040",
                "linkReferences": {},
                "deployedLinkReferences": {}
            }"#,
        )
        .unwrap();

        let artifact = store.load(ContractName::VaultManager).unwrap();
        assert_eq!(artifact.contract_name, "VaultManager");
        assert_eq!(artifact.source_name, "contracts/VaultManager.sol");
        assert_eq!(artifact.bytecode.len(), 5);
        assert_eq!(artifact.deployed_bytecode.len(), 4);
    }

    #[test]
    fn test_build_info_follows_debug_file() {
        let dir = tempdir::TempDir::new("vault-build-info").unwrap();
        let store = ArtifactStore::new(dir.path());
        let path = store.path_for(ContractName::PriceOracle);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            path.with_extension("dbg.json"),
            r#"{"_format":"hh-sol-dbg-1","buildInfo":"../../build-info/abc123.json"}"#,
        )
        .unwrap();

        let build_info_dir = dir.path().join("build-info");
        std::fs::create_dir_all(&build_info_dir).unwrap();
        std::fs::write(
            build_info_dir.join("abc123.json"),
            r#"{
                "id": "abc123",
                "_format": "hh-sol-build-info-1",
                "solcVersion": "0.8.17",
                "solcLongVersion": "0.8.17+commit.8df45f5f",
                "input": {"language": "Solidity", "sources": {}, "settings": {}},
                "output": {}
            }"#,
        )
        .unwrap();

        let info = store.build_info(ContractName::PriceOracle).unwrap();
        assert_eq!(info.solc_long_version, "0.8.17+commit.8df45f5f");
        assert_eq!(info.input["language"], "Solidity");
    }

    #[test]
    fn test_missing_artifact_is_configuration_error() {
        let store = ArtifactStore::new("/nonexistent");
        let err = store.load(ContractName::PriceOracle).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Configuration(_))
        ));
    }
}
