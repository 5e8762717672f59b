use async_trait::async_trait;
use drop_core::{ChainClient, ContractView, SupplyRefresh, TxReceipt};
use ethers::abi::{ParamType, Token};
use ethers::types::Address;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Re-reads `totalSupply()` from the drop contract after each confirmed mint.
pub struct TotalSupplyRefresh {
    client: Arc<dyn ChainClient>,
    view: ContractView,
    minted: AtomicU64,
}

impl TotalSupplyRefresh {
    pub fn new(client: Arc<dyn ChainClient>, contract: Address) -> Self {
        Self {
            client,
            view: ContractView::new(contract, "totalSupply()", vec![ParamType::Uint(256)]),
            minted: AtomicU64::new(0),
        }
    }

    /// Last on-chain supply seen, 0 before the first refresh.
    pub fn minted(&self) -> u64 {
        self.minted.load(Ordering::Relaxed)
    }

    pub async fn refresh(&self) -> Option<u64> {
        match self.client.read_contract_state(&self.view).await {
            Ok(tokens) => match tokens.first() {
                Some(Token::Uint(supply)) => {
                    let supply = supply.low_u64();
                    self.minted.store(supply, Ordering::Relaxed);
                    Some(supply)
                }
                other => {
                    warn!("Unexpected totalSupply() output: {:?}", other);
                    None
                }
            },
            Err(e) => {
                warn!("Failed to refresh minted supply: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl SupplyRefresh for TotalSupplyRefresh {
    async fn on_mint_confirmed(&self, collection: &str, receipt: &TxReceipt) {
        if let Some(supply) = self.refresh().await {
            info!(
                "'{}' minted supply now {} (after {:?})",
                collection, supply, receipt.tx_hash
            );
        }
    }
}
