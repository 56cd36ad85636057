//! Chain access used by the pipeline stages.
//!
//! Every stage talks to the chain through [`ChainClient`], which keeps the stages
//! independent of the transport and lets tests substitute an in-memory chain.

use std::{future::Future, time::Duration};

use alloy_core::{
    primitives::{Address, B256, Bytes, U256, keccak256},
    rlp::{Encodable, Header},
};
use alloy_signer_local::PrivateKeySigner;
use anyhow::{Context, Result};
use backon::{ConstantBuilder, Retryable};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    network::{NetworkConfig, Wallet},
    rpc,
};

/// A transaction to submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    /// Destination, `None` for contract creation.
    pub to: Option<Address>,
    /// Calldata or creation code.
    pub data: Bytes,
    /// Native value attached.
    pub value: U256,
}

impl TxRequest {
    pub fn create(code: Bytes) -> Self {
        Self {
            to: None,
            data: code,
            value: U256::ZERO,
        }
    }

    pub fn call(to: Address, data: Bytes) -> Self {
        Self {
            to: Some(to),
            data,
            value: U256::ZERO,
        }
    }
}

/// Outcome of a confirmed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: B256,
    pub block_number: u64,
    pub gas_used: u64,
    /// Address of the created contract, for creation transactions.
    pub contract_address: Option<Address>,
}

/// Minimal chain interface the pipeline needs.
pub trait ChainClient: Send + Sync {
    /// Address transactions are sent from.
    fn sender(&self) -> Address;

    /// Chain id reported by the endpoint.
    fn chain_id(&self) -> impl Future<Output = Result<u64>> + Send;

    /// Runtime bytecode at `address` (empty when no contract lives there).
    fn code_at(&self, address: Address) -> impl Future<Output = Result<Bytes>> + Send;

    /// Execute a read-only call against the latest block.
    fn call(
        &self,
        from: Option<Address>,
        to: Address,
        data: Bytes,
    ) -> impl Future<Output = Result<Bytes>> + Send;

    /// Submit a transaction and block until it is confirmed.
    ///
    /// Fails if the transaction reverts or is not mined before the confirmation timeout.
    fn send_transaction(&self, tx: TxRequest) -> impl Future<Output = Result<TxReceipt>> + Send;
}

/// Transaction receipt as returned by `eth_getTransactionReceipt`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: B256,
    block_number: String,
    gas_used: String,
    #[serde(default)]
    contract_address: Option<Address>,
    #[serde(default)]
    status: Option<String>,
}

/// [`ChainClient`] backed by a JSON-RPC endpoint.
pub struct RpcChain {
    client: reqwest::Client,
    url: String,
    chain_id: u64,
    wallet: Wallet,
    confirmation_timeout: Duration,
    poll_interval: Duration,
    gas_limit_multiplier_pct: u64,
}

impl RpcChain {
    pub fn new(network: &NetworkConfig) -> Result<Self> {
        Ok(Self {
            client: rpc::create_client()?,
            url: network.rpc_url.to_string(),
            chain_id: network.chain_id,
            wallet: network.wallet.clone(),
            confirmation_timeout: network.confirmation_timeout,
            poll_interval: network.poll_interval,
            gas_limit_multiplier_pct: network.gas_limit_multiplier_pct,
        })
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T> {
        rpc::json_rpc_call(&self.client, &self.url, method, params).await
    }

    fn tx_object(&self, tx: &TxRequest) -> Value {
        let mut object = json!({
            "from": self.wallet.address(),
            "data": tx.data,
            "value": tx.value,
        });
        if let Some(to) = tx.to {
            object["to"] = json!(to);
        }
        object
    }

    /// Sign the transaction locally and submit it with `eth_sendRawTransaction`.
    async fn send_signed(&self, signer: &PrivateKeySigner, tx: &TxRequest) -> Result<B256> {
        let nonce = rpc::parse_quantity(
            &self
                .request::<String>(
                    "eth_getTransactionCount",
                    vec![json!(signer.address()), json!("pending")],
                )
                .await
                .context("Failed to fetch sender nonce")?,
        )?;

        let gas_price: U256 = self
            .request("eth_gasPrice", vec![])
            .await
            .context("Failed to fetch gas price")?;

        let estimate = rpc::parse_quantity(
            &self
                .request::<String>("eth_estimateGas", vec![self.tx_object(tx)])
                .await
                .context("Gas estimation failed")?,
        )?;
        let gas_limit = estimate.saturating_mul(self.gas_limit_multiplier_pct) / 100;

        let legacy = LegacyTx {
            nonce,
            gas_price,
            gas_limit,
            to: tx.to,
            value: tx.value,
            data: tx.data.clone(),
            chain_id: self.chain_id,
        };
        let raw = legacy.sign(signer)?;

        tracing::trace!(nonce, gas_limit, %gas_price, "Submitting signed transaction");

        self.request("eth_sendRawTransaction", vec![json!(raw)])
            .await
            .context("Failed to submit signed transaction")
    }

    /// Poll for the receipt of `tx_hash` until it is mined or the timeout elapses.
    async fn wait_for_receipt(&self, tx_hash: B256) -> Result<TxReceipt> {
        let attempts = (self.confirmation_timeout.as_millis()
            / self.poll_interval.as_millis().max(1))
        .max(1) as usize;

        let fetch = move || async move {
            let receipt: Option<RpcReceipt> = self
                .request("eth_getTransactionReceipt", vec![json!(tx_hash)])
                .await?;
            receipt.ok_or_else(|| anyhow::anyhow!("transaction {tx_hash} is still pending"))
        };

        let receipt = fetch
            .retry(
                ConstantBuilder::default()
                    .with_delay(self.poll_interval)
                    .with_max_times(attempts),
            )
            .notify(|err: &anyhow::Error, after: Duration| {
                tracing::trace!(error = %err, retry_in = ?after, "Waiting for confirmation...");
            })
            .await
            .with_context(|| {
                format!(
                    "Transaction {tx_hash} was not confirmed within {}s",
                    self.confirmation_timeout.as_secs()
                )
            })?;

        let gas_used = rpc::parse_quantity(&receipt.gas_used)?;
        if receipt.status.as_deref() == Some("0x0") {
            anyhow::bail!("transaction {tx_hash} reverted (gas used {gas_used})");
        }

        Ok(TxReceipt {
            tx_hash: receipt.transaction_hash,
            block_number: rpc::parse_quantity(&receipt.block_number)?,
            gas_used,
            contract_address: receipt.contract_address,
        })
    }
}

impl ChainClient for RpcChain {
    fn sender(&self) -> Address {
        self.wallet.address()
    }

    async fn chain_id(&self) -> Result<u64> {
        let id: String = self.request("eth_chainId", vec![]).await?;
        rpc::parse_quantity(&id)
    }

    async fn code_at(&self, address: Address) -> Result<Bytes> {
        self.request("eth_getCode", vec![json!(address), json!("latest")])
            .await
            .with_context(|| format!("Failed to fetch code at {address}"))
    }

    async fn call(&self, from: Option<Address>, to: Address, data: Bytes) -> Result<Bytes> {
        let mut object = json!({ "to": to, "data": data });
        if let Some(from) = from {
            object["from"] = json!(from);
        }
        self.request("eth_call", vec![object, json!("latest")]).await
    }

    async fn send_transaction(&self, tx: TxRequest) -> Result<TxReceipt> {
        let tx_hash = match &self.wallet {
            Wallet::Local(signer) => self.send_signed(signer, &tx).await?,
            Wallet::Unlocked(_) => self
                .request("eth_sendTransaction", vec![self.tx_object(&tx)])
                .await
                .context("Failed to send transaction")?,
        };

        tracing::debug!(%tx_hash, "Transaction submitted, waiting for confirmation");

        self.wait_for_receipt(tx_hash).await
    }
}

/// Pre-EIP-2718 transaction with EIP-155 replay protection.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LegacyTx {
    nonce: u64,
    gas_price: U256,
    gas_limit: u64,
    to: Option<Address>,
    value: U256,
    data: Bytes,
    chain_id: u64,
}

impl LegacyTx {
    /// RLP payload hashed for signing: the fields followed by `chain_id, 0, 0`.
    fn signing_payload(&self) -> Vec<u8> {
        let to = self.to_field();
        rlp_list(&[
            &self.nonce,
            &self.gas_price,
            &self.gas_limit,
            &*to,
            &self.value,
            &self.data,
            &self.chain_id,
            &0u8,
            &0u8,
        ])
    }

    fn sign(&self, signer: &PrivateKeySigner) -> Result<Bytes> {
        let hash = keccak256(self.signing_payload());
        let (signature, recovery_id): (k256::ecdsa::Signature, k256::ecdsa::RecoveryId) = signer
            .credential()
            .sign_prehash_recoverable(hash.as_slice())
            .context("Failed to sign transaction")?;

        let v = self.chain_id * 2 + 35 + u64::from(recovery_id.to_byte());
        let (r, s) = signature.split_bytes();
        let r = U256::from_be_slice(&r);
        let s = U256::from_be_slice(&s);

        let to = self.to_field();
        Ok(Bytes::from(rlp_list(&[
            &self.nonce,
            &self.gas_price,
            &self.gas_limit,
            &*to,
            &self.value,
            &self.data,
            &v,
            &r,
            &s,
        ])))
    }

    /// Creation transactions carry an empty string in the `to` position.
    fn to_field(&self) -> Box<dyn Encodable> {
        match self.to {
            Some(to) => Box::new(to),
            None => Box::new(Bytes::new()),
        }
    }
}

fn rlp_list(fields: &[&dyn Encodable]) -> Vec<u8> {
    let payload_length = fields.iter().map(|field| field.length()).sum();
    let mut out = Vec::with_capacity(payload_length + 9);
    Header {
        list: true,
        payload_length,
    }
    .encode(&mut out);
    for field in fields {
        field.encode(&mut out);
    }
    out
}
