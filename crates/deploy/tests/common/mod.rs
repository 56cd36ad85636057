//! An in-memory chain that understands the vault contract interfaces.
//!
//! Contracts are recognised by their creation code, constructor arguments are decoded
//! with the same ABI the deployer encodes them with, and calls are dispatched through
//! the `sol!` call enums.

#![allow(dead_code)]

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Mutex,
};

use alloy_core::{
    primitives::{Address, B256, Bytes, U256, keccak256},
    sol_types::{SolCall, SolInterface, SolValue},
};
use anyhow::{Result, bail};
use vault_deploy::{
    ChainClient, ContractName, TxReceipt, TxRequest,
    abi::{IAccessControl, IPriceOracle, IRewardDistributor, ITokenVault, IVaultManager, Role},
    contracts::Artifact,
    explorer::{ExplorerApi, SourceRequest, Submission, VerificationStatus},
};

/// Price returned for every known feed, 1.5 with 18 decimals.
pub const FEED_PRICE: u128 = 1_500_000_000_000_000_000;

const WAD: u128 = 1_000_000_000_000_000_000;

/// State of one simulated contract.
#[derive(Debug, Clone, Default)]
pub struct SimContract {
    pub name: Option<ContractName>,
    pub code: Bytes,
    /// Raw constructor arguments.
    pub constructor_args: Vec<u8>,
    pub addresses: BTreeMap<&'static str, Address>,
    pub values: BTreeMap<&'static str, U256>,
    pub feeds: Vec<Address>,
    pub roles: BTreeSet<(B256, Address)>,
    pub vaults: BTreeSet<Address>,
    pub depositors: BTreeSet<Address>,
}

impl SimContract {
    fn address(&self, key: &str) -> Address {
        self.addresses.get(key).copied().unwrap_or_default()
    }

    fn value(&self, key: &str) -> U256 {
        self.values.get(key).copied().unwrap_or_default()
    }
}

#[derive(Debug, Default)]
pub struct SimState {
    pub block: u64,
    pub nonce: u64,
    pub contracts: BTreeMap<Address, SimContract>,
    /// Contracts in creation order.
    pub created: Vec<(ContractName, Address)>,
    pub transactions: usize,
    /// Constructor arguments that referenced an address with no contract behind it.
    pub dangling_references: Vec<String>,
    fail_selector: Option<(ContractName, [u8; 4])>,
    fail_creation: Option<ContractName>,
}

pub struct SimChain {
    chain_id: u64,
    sender: Address,
    artifacts: Vec<(ContractName, Artifact)>,
    pub state: Mutex<SimState>,
}

impl SimChain {
    pub fn new(chain_id: u64, sender: Address, artifacts: Vec<(ContractName, Artifact)>) -> Self {
        Self {
            chain_id,
            sender,
            artifacts,
            state: Mutex::new(SimState::default()),
        }
    }

    /// Make every transaction to `contract` with the selector of `Call` revert.
    pub fn fail_on<Call: SolCall>(&self, contract: ContractName) {
        self.state.lock().unwrap().fail_selector = Some((contract, Call::SELECTOR));
    }

    /// Make the creation of `contract` revert.
    pub fn fail_creation_of(&self, contract: ContractName) {
        self.state.lock().unwrap().fail_creation = Some(contract);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.fail_selector = None;
        state.fail_creation = None;
    }

    pub fn transaction_count(&self) -> usize {
        self.state.lock().unwrap().transactions
    }

    /// Remove the code of the contract at `address`, as after a chain reset.
    pub fn wipe(&self, address: Address) {
        self.state.lock().unwrap().contracts.remove(&address);
    }

    pub fn contract(&self, address: Address) -> Option<SimContract> {
        self.state.lock().unwrap().contracts.get(&address).cloned()
    }

    fn create(&self, state: &mut SimState, data: &[u8]) -> Result<Address> {
        let Some((name, artifact)) = self
            .artifacts
            .iter()
            .find(|(_, artifact)| data.starts_with(&artifact.bytecode))
        else {
            bail!("unknown creation code");
        };
        if state.fail_creation == Some(*name) {
            bail!("execution reverted: {name} constructor");
        }

        let args = &data[artifact.bytecode.len()..];
        let address = Address::from_word(keccak256(state.nonce.to_be_bytes()));
        let mut contract = SimContract {
            name: Some(*name),
            code: artifact.deployed_bytecode.clone(),
            constructor_args: args.to_vec(),
            ..Default::default()
        };

        let mut reference = |key: &'static str, target: Address, expected: ContractName| {
            let known = state
                .contracts
                .get(&target)
                .and_then(|c| c.name)
                .is_some_and(|n| n == expected);
            if !known {
                state
                    .dangling_references
                    .push(format!("{name}.{key} -> {target}"));
            }
            contract.addresses.insert(key, target);
        };

        match name {
            ContractName::PriceOracle => {
                let (feeds,) = <(Vec<Address>,)>::abi_decode_params(args)?;
                contract.feeds = feeds;
            }
            ContractName::RewardDistributor => {
                let (oracle,) = <(Address,)>::abi_decode_params(args)?;
                reference("priceOracle", oracle, ContractName::PriceOracle);
            }
            ContractName::VaultManager => {
                if !args.is_empty() {
                    bail!("VaultManager takes no constructor arguments");
                }
            }
            ContractName::TokenVault => {
                let (manager, distributor, oracle, fee_rate, min_deposit) =
                    <(Address, Address, Address, U256, U256)>::abi_decode_params(args)?;
                reference("manager", manager, ContractName::VaultManager);
                reference("rewardDistributor", distributor, ContractName::RewardDistributor);
                reference("priceOracle", oracle, ContractName::PriceOracle);
                contract.values.insert("feeRate", fee_rate);
                contract.values.insert("minDeposit", min_deposit);
            }
        }

        state.created.push((*name, address));
        state.contracts.insert(address, contract);
        Ok(address)
    }

    /// Execute `data` against `to`. Setters are only allowed when `write` is set.
    fn execute(
        &self,
        state: &mut SimState,
        from: Address,
        to: Address,
        data: &[u8],
        write: bool,
    ) -> Result<Vec<u8>> {
        let Some(contract) = state.contracts.get_mut(&to) else {
            // Calls to an address without code succeed with empty output.
            return Ok(Vec::new());
        };
        let Some(name) = contract.name else {
            bail!("not a vault contract");
        };
        let setter = |write: bool| -> Result<Vec<u8>> {
            if write {
                Ok(Vec::new())
            } else {
                bail!("state change in static call")
            }
        };

        if let Ok(call) = IAccessControl::IAccessControlCalls::abi_decode(data) {
            return match call {
                IAccessControl::IAccessControlCalls::grantRole(c) => {
                    let out = setter(write)?;
                    contract.roles.insert((c.role, c.account));
                    Ok(out)
                }
                IAccessControl::IAccessControlCalls::hasRole(c) => {
                    Ok(contract.roles.contains(&(c.role, c.account)).abi_encode())
                }
            };
        }

        match name {
            ContractName::PriceOracle => {
                use IPriceOracle::IPriceOracleCalls as Calls;
                match Calls::abi_decode(data)? {
                    Calls::setUpdateInterval(c) => {
                        let out = setter(write)?;
                        contract.values.insert("updateInterval", c.interval);
                        Ok(out)
                    }
                    Calls::setStalenessThreshold(c) => {
                        let out = setter(write)?;
                        contract.values.insert("stalenessThreshold", c.threshold);
                        Ok(out)
                    }
                    Calls::updateInterval(_) => Ok(contract.value("updateInterval").abi_encode()),
                    Calls::stalenessThreshold(_) => {
                        Ok(contract.value("stalenessThreshold").abi_encode())
                    }
                    Calls::getLatestPrice(c) => {
                        if !contract.feeds.contains(&c.feed) {
                            bail!("execution reverted: unknown feed");
                        }
                        Ok(U256::from(FEED_PRICE).abi_encode())
                    }
                }
            }
            ContractName::RewardDistributor => {
                use IRewardDistributor::IRewardDistributorCalls as Calls;
                match Calls::abi_decode(data)? {
                    Calls::addVault(c) => {
                        let out = setter(write)?;
                        contract.vaults.insert(c.vault);
                        Ok(out)
                    }
                    Calls::setRewardToken(c) => {
                        let out = setter(write)?;
                        contract.addresses.insert("rewardToken", c.token);
                        Ok(out)
                    }
                    Calls::setRewardRate(c) => {
                        let out = setter(write)?;
                        contract.values.insert("rewardRate", c.rate);
                        Ok(out)
                    }
                    Calls::setDistributionInterval(c) => {
                        let out = setter(write)?;
                        contract.values.insert("distributionInterval", c.interval);
                        Ok(out)
                    }
                    Calls::setFeeShare(c) => {
                        let out = setter(write)?;
                        contract.values.insert("feeShare", c.bps);
                        Ok(out)
                    }
                    Calls::isVault(c) => Ok(contract.vaults.contains(&c.vault).abi_encode()),
                    Calls::priceOracle(_) => Ok(contract.address("priceOracle").abi_encode()),
                    Calls::rewardToken(_) => Ok(contract.address("rewardToken").abi_encode()),
                    Calls::rewardRate(_) => Ok(contract.value("rewardRate").abi_encode()),
                    Calls::distributionInterval(_) => {
                        Ok(contract.value("distributionInterval").abi_encode())
                    }
                    Calls::feeShare(_) => Ok(contract.value("feeShare").abi_encode()),
                    Calls::calculateReward(c) => {
                        let authorised = from == c.vault
                            && contract.vaults.contains(&c.vault)
                            && contract.roles.contains(&(Role::Vault.id(), from));
                        if !authorised {
                            bail!("execution reverted: caller is not a registered vault");
                        }
                        let reward = c.amount * contract.value("rewardRate") / U256::from(WAD);
                        Ok(reward.abi_encode())
                    }
                }
            }
            ContractName::VaultManager => {
                use IVaultManager::IVaultManagerCalls as Calls;
                match Calls::abi_decode(data)? {
                    Calls::addVault(c) => {
                        let out = setter(write)?;
                        contract.vaults.insert(c.vault);
                        Ok(out)
                    }
                    Calls::registerDepositor(c) => {
                        let out = setter(write)?;
                        contract.depositors.insert(c.source);
                        Ok(out)
                    }
                    Calls::setVaultCap(c) => {
                        let out = setter(write)?;
                        contract.values.insert("vaultCap", c.cap);
                        Ok(out)
                    }
                    Calls::isVault(c) => Ok(contract.vaults.contains(&c.vault).abi_encode()),
                    Calls::isRegisteredDepositor(c) => {
                        Ok(contract.depositors.contains(&c.source).abi_encode())
                    }
                    Calls::vaultCap(_) => Ok(contract.value("vaultCap").abi_encode()),
                    Calls::vaultCount(_) => Ok(U256::from(contract.vaults.len()).abi_encode()),
                }
            }
            ContractName::TokenVault => {
                use ITokenVault::ITokenVaultCalls as Calls;
                match Calls::abi_decode(data)? {
                    Calls::setManager(c) => {
                        let out = setter(write)?;
                        contract.addresses.insert("manager", c.manager);
                        Ok(out)
                    }
                    Calls::setRewardDistributor(c) => {
                        let out = setter(write)?;
                        contract.addresses.insert("rewardDistributor", c.distributor);
                        Ok(out)
                    }
                    Calls::setPriceOracle(c) => {
                        let out = setter(write)?;
                        contract.addresses.insert("priceOracle", c.oracle);
                        Ok(out)
                    }
                    Calls::setFeeRate(c) => {
                        let out = setter(write)?;
                        contract.values.insert("feeRate", c.bps);
                        Ok(out)
                    }
                    Calls::setMinDeposit(c) => {
                        let out = setter(write)?;
                        contract.values.insert("minDeposit", c.amount);
                        Ok(out)
                    }
                    Calls::manager(_) => Ok(contract.address("manager").abi_encode()),
                    Calls::rewardDistributor(_) => {
                        Ok(contract.address("rewardDistributor").abi_encode())
                    }
                    Calls::priceOracle(_) => Ok(contract.address("priceOracle").abi_encode()),
                    Calls::feeRate(_) => Ok(contract.value("feeRate").abi_encode()),
                    Calls::minDeposit(_) => Ok(contract.value("minDeposit").abi_encode()),
                    Calls::totalDeposits(_) => Ok(contract.value("totalDeposits").abi_encode()),
                    Calls::getDepositValue(c) => {
                        Ok((c.amount * U256::from(FEED_PRICE) / U256::from(WAD)).abi_encode())
                    }
                }
            }
        }
    }
}

impl ChainClient for SimChain {
    fn sender(&self) -> Address {
        self.sender
    }

    async fn chain_id(&self) -> Result<u64> {
        Ok(self.chain_id)
    }

    async fn code_at(&self, address: Address) -> Result<Bytes> {
        let state = self.state.lock().unwrap();
        Ok(state
            .contracts
            .get(&address)
            .map(|c| c.code.clone())
            .unwrap_or_default())
    }

    async fn call(&self, from: Option<Address>, to: Address, data: Bytes) -> Result<Bytes> {
        let mut state = self.state.lock().unwrap();
        let from = from.unwrap_or(self.sender);
        self.execute(&mut state, from, to, &data, false)
            .map(Bytes::from)
    }

    async fn send_transaction(&self, tx: TxRequest) -> Result<TxReceipt> {
        let mut state = self.state.lock().unwrap();
        state.transactions += 1;

        let contract_address = match tx.to {
            None => Some(self.create(&mut state, &tx.data)?),
            Some(to) => {
                if let (Some((name, selector)), Some(target)) =
                    (state.fail_selector, state.contracts.get(&to))
                {
                    if target.name == Some(name) && tx.data.starts_with(&selector) {
                        bail!("execution reverted: AccessControl: sender lacks permission");
                    }
                }
                self.execute(&mut state, self.sender, to, &tx.data, true)?;
                None
            }
        };

        state.nonce += 1;
        state.block += 1;
        let mut preimage = tx.data.to_vec();
        preimage.extend_from_slice(&state.nonce.to_be_bytes());

        Ok(TxReceipt {
            tx_hash: keccak256(preimage),
            block_number: state.block,
            gas_used: 21_000 + 16 * tx.data.len() as u64,
            contract_address,
        })
    }
}

/// An explorer that queues every submission and verifies it on the second status query.
#[derive(Default)]
pub struct StubExplorer {
    pub submitted: Mutex<Vec<SourceRequest>>,
    polls: Mutex<BTreeMap<String, usize>>,
    reject: Option<ContractName>,
}

impl StubExplorer {
    /// An explorer that rejects the source of `contract`.
    pub fn rejecting(contract: ContractName) -> Self {
        Self {
            reject: Some(contract),
            ..Default::default()
        }
    }

    pub fn status_queries(&self) -> usize {
        self.polls.lock().unwrap().values().sum()
    }
}

impl ExplorerApi for StubExplorer {
    async fn submit(&self, request: &SourceRequest) -> Result<Submission> {
        self.submitted.lock().unwrap().push(request.clone());
        Ok(Submission::Queued(format!("guid-{}", request.contract)))
    }

    async fn status(&self, guid: &str) -> Result<VerificationStatus> {
        let mut polls = self.polls.lock().unwrap();
        let count = polls.entry(guid.to_string()).or_default();
        *count += 1;
        if *count < 2 {
            return Ok(VerificationStatus::Pending);
        }

        match self.reject {
            Some(name) if guid == format!("guid-{name}") => Ok(VerificationStatus::Failed(
                "Fail - Unable to verify".to_string(),
            )),
            _ => Ok(VerificationStatus::Verified),
        }
    }
}
