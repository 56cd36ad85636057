//! External interfaces of the vault contracts.
//!
//! Only the operations the pipeline calls are declared here; the contracts themselves
//! are built elsewhere and loaded as Hardhat artifacts.

use alloy_core::{
    primitives::{B256, keccak256},
    sol,
};
use serde::{Deserialize, Serialize};

sol! {
    interface IAccessControl {
        function grantRole(bytes32 role, address account) external;
        function hasRole(bytes32 role, address account) external view returns (bool);
    }

    interface IPriceOracle {
        function setUpdateInterval(uint256 interval) external;
        function setStalenessThreshold(uint256 threshold) external;
        function updateInterval() external view returns (uint256);
        function stalenessThreshold() external view returns (uint256);
        function getLatestPrice(address feed) external view returns (uint256);
    }

    interface IRewardDistributor {
        function addVault(address vault) external;
        function setRewardToken(address token) external;
        function setRewardRate(uint256 rate) external;
        function setDistributionInterval(uint256 interval) external;
        function setFeeShare(uint256 bps) external;
        function isVault(address vault) external view returns (bool);
        function priceOracle() external view returns (address);
        function rewardToken() external view returns (address);
        function rewardRate() external view returns (uint256);
        function distributionInterval() external view returns (uint256);
        function feeShare() external view returns (uint256);
        function calculateReward(address vault, uint256 amount) external view returns (uint256);
    }

    interface IVaultManager {
        function addVault(address vault) external;
        function registerDepositor(address source) external;
        function setVaultCap(uint256 cap) external;
        function isVault(address vault) external view returns (bool);
        function isRegisteredDepositor(address source) external view returns (bool);
        function vaultCap() external view returns (uint256);
        function vaultCount() external view returns (uint256);
    }

    interface ITokenVault {
        function setManager(address manager) external;
        function setRewardDistributor(address distributor) external;
        function setPriceOracle(address oracle) external;
        function setFeeRate(uint256 bps) external;
        function setMinDeposit(uint256 amount) external;
        function manager() external view returns (address);
        function rewardDistributor() external view returns (address);
        function priceOracle() external view returns (address);
        function feeRate() external view returns (uint256);
        function minDeposit() external view returns (uint256);
        function totalDeposits() external view returns (uint256);
        function getDepositValue(uint256 amount) external view returns (uint256);
    }
}

/// Access-control roles granted by the configurator.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum Role {
    #[strum(serialize = "ADMIN_ROLE")]
    #[serde(rename = "ADMIN_ROLE")]
    Admin,
    #[strum(serialize = "VAULT_ROLE")]
    #[serde(rename = "VAULT_ROLE")]
    Vault,
}

impl Role {
    /// The role identifier: keccak256 of the role name.
    pub fn id(&self) -> B256 {
        keccak256(self.to_string().as_bytes())
    }
}
