//! # Chain Seams
//!
//! The core never talks to a node directly. A [`ChainClient`] implementation
//! (ethers-backed in the CLI, scripted in tests) submits calls and reports
//! receipts; a [`SupplyRefresh`] hook is told about every confirmed mint.

use crate::config::SubmissionConfig;
use crate::error::ChainError;
use crate::fee::{FeeBid, FeeData};
use crate::queue::MintRequest;
use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, H256, U256};
use serde::Serialize;
use std::time::Duration;

/// A state-changing contract call.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractCall {
    pub contract: Address,
    /// Solidity signature, e.g. `mint(uint256)`.
    pub signature: String,
    pub args: Vec<Token>,
    pub value: U256,
}

impl ContractCall {
    pub fn new(contract: Address, signature: &str) -> Self {
        Self {
            contract,
            signature: signature.to_string(),
            args: Vec::new(),
            value: U256::zero(),
        }
    }

    pub fn arg(mut self, token: Token) -> Self {
        self.args.push(token);
        self
    }

    pub fn value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }

    pub fn selector(&self) -> [u8; 4] {
        ethers::utils::id(&self.signature)
    }

    /// Selector followed by the ABI-encoded arguments.
    pub fn calldata(&self) -> Bytes {
        let mut data = self.selector().to_vec();
        data.extend(abi::encode(&self.args));
        Bytes::from(data)
    }

    /// Mint call for a queued request: `gated(quantity, proof)` when the
    /// request carries a proof, even an empty one, `public(quantity)` otherwise.
    pub fn for_mint(contract: Address, request: &MintRequest, config: &SubmissionConfig) -> Self {
        let quantity = Token::Uint(U256::from(request.quantity));
        let call = match &request.proof {
            None => Self::new(contract, &config.public_mint_signature).arg(quantity),
            Some(proof) => {
                let proof = proof
                    .iter()
                    .map(|node| Token::FixedBytes(node.as_bytes().to_vec()))
                    .collect();
                Self::new(contract, &config.gated_mint_signature)
                    .arg(quantity)
                    .arg(Token::Array(proof))
            }
        };
        call.value(request.value)
    }
}

/// A read-only contract call and the types it returns.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractView {
    pub call: ContractCall,
    pub outputs: Vec<ParamType>,
}

impl ContractView {
    pub fn new(contract: Address, signature: &str, outputs: Vec<ParamType>) -> Self {
        Self {
            call: ContractCall::new(contract, signature),
            outputs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxReceipt {
    pub tx_hash: H256,
    pub block_number: Option<u64>,
    pub gas_used: Option<U256>,
    pub effective_gas_price: Option<U256>,
    /// `false` when the transaction was mined but reverted.
    pub success: bool,
    pub revert_reason: Option<String>,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn fee_estimate(&self) -> Result<FeeData, ChainError>;

    /// Sign and broadcast `call`. `replaces` is the hash of this request's
    /// previous attempt; implementations reuse its nonce so the new bid
    /// supersedes it instead of minting twice.
    async fn submit_transaction(
        &self,
        call: &ContractCall,
        bid: &FeeBid,
        replaces: Option<H256>,
    ) -> Result<H256, ChainError>;

    async fn wait_for_receipt(
        &self,
        tx_hash: H256,
        confirmations: u64,
        timeout: Duration,
    ) -> Result<TxReceipt, ChainError>;

    /// One direct lookup, `None` while the transaction is unmined.
    async fn receipt(&self, tx_hash: H256) -> Result<Option<TxReceipt>, ChainError>;

    async fn read_contract_state(&self, view: &ContractView) -> Result<Vec<Token>, ChainError>;
}

/// Downstream refresh after a confirmed mint (minted counters, supply
/// displays).
#[async_trait]
pub trait SupplyRefresh: Send + Sync {
    async fn on_mint_confirmed(&self, collection: &str, receipt: &TxReceipt);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSupplyRefresh;

#[async_trait]
impl SupplyRefresh for NoopSupplyRefresh {
    async fn on_mint_confirmed(&self, _collection: &str, _receipt: &TxReceipt) {}
}
