use crate::config::DropCliConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use drop_core::{
    with_retry, ChainClient, ChainError, ContractCall, ContractView, FeeBid, FeeData, RetryConfig,
    TxReceipt,
};
use ethers::abi::{self, ParamType, Token};
use ethers::prelude::*;
use ethers::providers::RpcError;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::parse_units;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

type SignerClient = SignerMiddleware<Arc<Provider<Http>>, LocalWallet>;

/// Selector of the standard `Error(string)` revert payload.
const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];

/// Custom errors the drop contract is known to raise, decoded by selector.
const KNOWN_ERRORS: [&str; 8] = [
    "InvalidProof()",
    "NotWhitelisted()",
    "InvalidMerkleProof()",
    "WalletLimitExceeded()",
    "ExceedsWalletLimit()",
    "SoldOut()",
    "MaxSupplyReached()",
    "PhaseNotActive()",
];

pub struct EthersChainClient {
    provider: Arc<Provider<Http>>,
    signer: Option<Arc<SignerClient>>,
    chain_id: u64,
    verified_chain: OnceCell<u64>,
    gas_limit: Option<U256>,
    fallback_priority_gwei: f64,
    poll_interval: Duration,
    /// Nonce used by each hash we sent, so a retry can replace it.
    nonces: Mutex<HashMap<H256, U256>>,
    reads: RetryConfig,
}

impl EthersChainClient {
    pub fn new(config: &DropCliConfig, wallet: Option<LocalWallet>) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));

        if let Some(proxy_config) = &config.proxy {
            let mut proxy = reqwest::Proxy::all(&proxy_config.url)
                .with_context(|| format!("Invalid proxy URL {}", proxy_config.url))?;
            if let (Some(username), Some(password)) =
                (&proxy_config.username, &proxy_config.password)
            {
                proxy = proxy.basic_auth(username, password);
            }
            builder = builder.proxy(proxy);
        }

        let client = builder.build().context("Failed to build HTTP client")?;
        let url = reqwest::Url::parse(&config.rpc_url)
            .with_context(|| format!("Invalid RPC URL {}", config.rpc_url))?;
        let poll_interval = Duration::from_millis(config.poll_interval_ms);
        let provider =
            Arc::new(Provider::new(Http::new_with_client(url, client)).interval(poll_interval));

        let signer = wallet.map(|wallet| {
            let wallet = wallet.with_chain_id(config.chain_id);
            Arc::new(SignerMiddleware::new(provider.clone(), wallet))
        });

        Ok(Self {
            provider,
            signer,
            chain_id: config.chain_id,
            verified_chain: OnceCell::new(),
            gas_limit: config.gas_limit.map(U256::from),
            fallback_priority_gwei: config.fallback_priority_gwei,
            poll_interval,
            nonces: Mutex::new(HashMap::new()),
            reads: RetryConfig::default(),
        })
    }

    pub fn provider(&self) -> &Arc<Provider<Http>> {
        &self.provider
    }

    pub fn address(&self) -> Option<Address> {
        self.signer.as_ref().map(|signer| signer.address())
    }

    /// Confirm the node serves the configured chain. Checked once per client.
    pub async fn ensure_chain(&self) -> Result<(), ChainError> {
        let actual = self
            .verified_chain
            .get_or_try_init(|| async {
                self.provider
                    .get_chainid()
                    .await
                    .map(|id| id.as_u64())
                    .map_err(provider_error)
            })
            .await?;

        if *actual != self.chain_id {
            return Err(ChainError::WrongChain {
                expected: self.chain_id,
                actual: *actual,
            });
        }
        Ok(())
    }

    async fn next_nonce(&self, from: Address, replaces: Option<H256>) -> Result<U256, ChainError> {
        if let Some(previous) = replaces {
            let known = self
                .nonces
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&previous)
                .copied();
            if let Some(nonce) = known {
                debug!("Replacing {:?} at nonce {}", previous, nonce);
                return Ok(nonce);
            }
            warn!("No nonce recorded for {:?}, using pending nonce", previous);
        }

        self.provider
            .get_transaction_count(from, Some(BlockNumber::Pending.into()))
            .await
            .map_err(provider_error)
    }

    fn to_receipt(&self, receipt: TransactionReceipt, revert_reason: Option<String>) -> TxReceipt {
        TxReceipt {
            tx_hash: receipt.transaction_hash,
            block_number: receipt.block_number.map(|n| n.as_u64()),
            gas_used: receipt.gas_used,
            effective_gas_price: receipt.effective_gas_price,
            success: receipt.status == Some(U64::one()),
            revert_reason,
        }
    }

    /// Replay a reverted transaction as a call to recover its reason.
    async fn replay_revert(&self, receipt: &TransactionReceipt) -> Option<String> {
        let tx = self
            .provider
            .get_transaction(receipt.transaction_hash)
            .await
            .ok()
            .flatten()?;

        let mut request = Eip1559TransactionRequest::new()
            .from(tx.from)
            .data(tx.input)
            .value(tx.value)
            .gas(tx.gas);
        if let Some(to) = tx.to {
            request = request.to(to);
        }
        let typed: TypedTransaction = request.into();
        let block = receipt
            .block_number
            .map(|n| BlockId::Number(BlockNumber::Number(n)));

        match self.provider.call(&typed, block).await {
            Ok(_) => None,
            Err(e) => match provider_error(e) {
                ChainError::Reverted { reason } => Some(reason),
                _ => None,
            },
        }
    }

    async fn lookup(&self, tx_hash: H256) -> Result<Option<TransactionReceipt>, ChainError> {
        self.provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(provider_error)
    }

    async fn finish_receipt(&self, receipt: TransactionReceipt) -> TxReceipt {
        let reason = if receipt.status == Some(U64::one()) {
            None
        } else {
            self.replay_revert(&receipt).await
        };
        self.to_receipt(receipt, reason)
    }
}

#[async_trait]
impl ChainClient for EthersChainClient {
    async fn fee_estimate(&self) -> Result<FeeData, ChainError> {
        let provider = self.provider.clone();
        let block = with_retry(self.reads, "get_block", || {
            let provider = provider.clone();
            async move {
                provider
                    .get_block(BlockNumber::Latest)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("Failed to get latest block"))
            }
        })
        .await
        .map_err(transport_error)?;

        let base_fee = match block.base_fee_per_gas {
            Some(base_fee) => base_fee,
            None => self
                .provider
                .get_gas_price()
                .await
                .map_err(provider_error)?,
        };

        let priority = match self.provider.estimate_eip1559_fees(None).await {
            Ok((_, priority)) => priority,
            Err(e) => {
                debug!("Fee oracle failed, using fallback priority: {}", e);
                parse_units(self.fallback_priority_gwei, "gwei")
                    .map_err(|e| ChainError::Transport {
                        message: e.to_string(),
                    })?
                    .into()
            }
        };

        Ok(FeeData {
            base_fee_per_gas: base_fee,
            max_priority_fee_per_gas: priority,
        })
    }

    async fn submit_transaction(
        &self,
        call: &ContractCall,
        bid: &FeeBid,
        replaces: Option<H256>,
    ) -> Result<H256, ChainError> {
        let signer = self.signer.as_ref().ok_or(ChainError::WalletUnavailable)?;
        self.ensure_chain().await?;

        let from = signer.address();
        let nonce = self.next_nonce(from, replaces).await?;

        let request = Eip1559TransactionRequest::new()
            .from(from)
            .to(call.contract)
            .data(call.calldata())
            .value(call.value)
            .nonce(nonce)
            .chain_id(self.chain_id)
            .max_fee_per_gas(bid.max_fee_per_gas)
            .max_priority_fee_per_gas(bid.max_priority_fee_per_gas);
        let mut typed: TypedTransaction = request.into();

        // Estimation doubles as a pre-flight check: a mint that would revert
        // fails here without spending gas.
        let gas = match self.gas_limit {
            Some(limit) => limit,
            None => self
                .provider
                .estimate_gas(&typed, None)
                .await
                .map_err(provider_error)?,
        };
        typed.set_gas(gas);

        let pending = signer
            .send_transaction(typed, None)
            .await
            .map_err(|e| classify_message(&e.to_string()))?;
        let tx_hash = pending.tx_hash();

        self.nonces
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tx_hash, nonce);
        Ok(tx_hash)
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: H256,
        confirmations: u64,
        timeout: Duration,
    ) -> Result<TxReceipt, ChainError> {
        let poll = async {
            loop {
                if let Some(receipt) = self.lookup(tx_hash).await? {
                    let mined_at = receipt.block_number.map(|n| n.as_u64());
                    let confirmed = match mined_at {
                        Some(block) if confirmations > 1 => {
                            let head = self
                                .provider
                                .get_block_number()
                                .await
                                .map_err(provider_error)?
                                .as_u64();
                            head.saturating_sub(block) + 1 >= confirmations
                        }
                        Some(_) => true,
                        None => false,
                    };
                    if confirmed {
                        return Ok::<_, ChainError>(self.finish_receipt(receipt).await);
                    }
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| ChainError::Timeout {
                operation: format!("receipt of {:?}", tx_hash),
                timeout_ms: timeout.as_millis() as u64,
            })?
    }

    async fn receipt(&self, tx_hash: H256) -> Result<Option<TxReceipt>, ChainError> {
        match self.lookup(tx_hash).await? {
            Some(receipt) if receipt.block_number.is_some() => {
                Ok(Some(self.finish_receipt(receipt).await))
            }
            _ => Ok(None),
        }
    }

    async fn read_contract_state(&self, view: &ContractView) -> Result<Vec<Token>, ChainError> {
        let typed: TypedTransaction = Eip1559TransactionRequest::new()
            .to(view.call.contract)
            .data(view.call.calldata())
            .into();

        let provider = self.provider.clone();
        let raw = with_retry(self.reads, &view.call.signature, || {
            let provider = provider.clone();
            let typed = typed.clone();
            async move { Ok(provider.call(&typed, None).await?) }
        })
        .await
        .map_err(|e| classify_message(&format!("{:#}", e)))?;

        abi::decode(&view.outputs, &raw).map_err(|e| ChainError::Transport {
            message: format!("Failed to decode {}: {}", view.call.signature, e),
        })
    }
}

fn transport_error(e: anyhow::Error) -> ChainError {
    ChainError::Transport {
        message: format!("{:#}", e),
    }
}

/// Map a provider failure, preferring revert data from the JSON-RPC error.
pub(crate) fn provider_error(e: ProviderError) -> ChainError {
    if let Some(response) = RpcError::as_error_response(&e) {
        if let Some(reason) = response
            .data
            .as_ref()
            .and_then(|data| data.as_str())
            .and_then(decode_revert_data)
        {
            return ChainError::Reverted { reason };
        }
        return classify_message(&response.message);
    }
    classify_message(&e.to_string())
}

/// Decode `Error(string)` payloads and known custom errors.
pub(crate) fn decode_revert_data(data: &str) -> Option<String> {
    let bytes = hex::decode(data.trim_start_matches("0x")).ok()?;
    if bytes.len() < 4 {
        return None;
    }
    let (selector, body) = bytes.split_at(4);

    if selector == ERROR_STRING_SELECTOR {
        return match abi::decode(&[ParamType::String], body).ok()?.pop()? {
            Token::String(reason) => Some(reason),
            _ => None,
        };
    }

    KNOWN_ERRORS
        .iter()
        .find(|signature| ethers::utils::id(signature) == selector)
        .map(|signature| signature.to_string())
        .or_else(|| Some(format!("custom error 0x{}", hex::encode(selector))))
}

/// Sort a node or signer error message into the failure kinds the engine
/// distinguishes.
pub(crate) fn classify_message(message: &str) -> ChainError {
    let lower = message.to_lowercase();

    if lower.contains("insufficient funds") {
        ChainError::InsufficientFunds {
            message: message.to_string(),
        }
    } else if lower.contains("user denied") || lower.contains("user rejected") {
        ChainError::Rejected {
            message: message.to_string(),
        }
    } else if lower.contains("nonce too low") || lower.contains("already known") {
        ChainError::NonceConsumed {
            message: message.to_string(),
        }
    } else if lower.contains("execution reverted") || lower.contains("revert") {
        let reason = message
            .split_once("execution reverted:")
            .map(|(_, reason)| reason.trim().to_string())
            .filter(|reason| !reason.is_empty())
            .unwrap_or_else(|| message.to_string());
        ChainError::Reverted { reason }
    } else if lower.contains("timed out") || lower.contains("timeout") {
        ChainError::Timeout {
            operation: "rpc request".to_string(),
            timeout_ms: 0,
        }
    } else {
        ChainError::Transport {
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drop_core::{MintError, RevertKind};

    #[test]
    fn test_classify_used_nonce() {
        assert!(matches!(
            classify_message("nonce too low: next nonce 8, tx nonce 7"),
            ChainError::NonceConsumed { .. }
        ));
        assert!(matches!(
            classify_message("already known"),
            ChainError::NonceConsumed { .. }
        ));
    }

    #[test]
    fn test_classify_insufficient_funds() {
        let err = classify_message("insufficient funds for gas * price + value");
        assert!(matches!(err, ChainError::InsufficientFunds { .. }));
        assert_eq!(MintError::from(err), MintError::InsufficientFunds);
    }

    #[test]
    fn test_classify_revert_reason() {
        let err = classify_message("execution reverted: Exceeds wallet limit");
        assert_eq!(
            err,
            ChainError::Reverted {
                reason: "Exceeds wallet limit".to_string()
            }
        );
        match MintError::from(err) {
            MintError::OnChainRevert { kind, .. } => {
                assert_eq!(kind, RevertKind::WalletLimitExceeded)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_classify_underpriced_is_retryable() {
        let err = classify_message("replacement transaction underpriced");
        assert!(MintError::from(err).is_retryable());
    }

    #[test]
    fn test_decode_error_string() {
        let mut payload = ERROR_STRING_SELECTOR.to_vec();
        payload.extend(abi::encode(&[Token::String("Sold out".to_string())]));
        let data = format!("0x{}", hex::encode(payload));

        assert_eq!(decode_revert_data(&data).as_deref(), Some("Sold out"));
    }

    #[test]
    fn test_decode_known_custom_error() {
        let selector = ethers::utils::id("InvalidProof()");
        let data = format!("0x{}", hex::encode(selector));

        let reason = decode_revert_data(&data).unwrap();
        assert_eq!(reason, "InvalidProof()");
        assert_eq!(RevertKind::classify(&reason), RevertKind::WhitelistProofInvalid);
    }

    #[test]
    fn test_decode_unknown_custom_error() {
        assert_eq!(
            decode_revert_data("0xdeadbeef").as_deref(),
            Some("custom error 0xdeadbeef")
        );
        assert!(decode_revert_data("0x01").is_none());
    }
}
