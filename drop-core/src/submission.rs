//! # Submission Engine
//!
//! Drives one mint request to a terminal state:
//!
//! ```text
//! fee estimate -> bid -> submit -> wait for receipt --ok--> Confirmed
//!                                        |
//!                                     timeout -> direct receipt lookup
//!                                        |
//!                        retryable and attempts left? -> backoff -> next attempt
//!                                        |
//!                                      Failed
//! ```
//!
//! Each retry replaces the previous transaction instead of sending a second
//! one, bids at least 10% above it, and a request never sees more than
//! `max_attempts` attempts. Before an attempt or the request is declared
//! failed, every hash sent for it is looked up.

use crate::chain::{ChainClient, ContractCall, NoopSupplyRefresh, SupplyRefresh, TxReceipt};
use crate::config::{BackoffConfig, SubmissionConfig};
use crate::error::{ChainError, MintError, RevertKind};
use crate::fee::{FeeBid, FeePolicy};
use crate::metrics::MintMetrics;
use crate::phases::{ConsistencyGuard, PhaseKey};
use crate::queue::{MintQueue, MintRequest, RequestId};
use crate::storage::{NoopRecordSink, RecordSink};
use crate::utils::retry::pressure_delay;
use crate::utils::MINT_RESULT_TARGET;
use ethers::types::{Address, H256};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, info, warn, Instrument};

/// Every transition of a request, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionEvent {
    BidComputed {
        id: RequestId,
        attempt: u32,
        bid: FeeBid,
    },
    Submitted {
        id: RequestId,
        attempt: u32,
        tx_hash: H256,
    },
    AttemptFailed {
        id: RequestId,
        attempt: u32,
        error: MintError,
        retry_in: Duration,
    },
    Confirmed {
        id: RequestId,
        attempts: u32,
        receipt: TxReceipt,
    },
    Failed {
        id: RequestId,
        attempts: u32,
        error: MintError,
    },
    PhaseHalted {
        collection: String,
        phase: PhaseKey,
    },
}

/// Every transaction sent for one request, oldest first. They all share a
/// nonce, so at most one of them can be mined.
#[derive(Default)]
struct SentTransactions {
    hashes: Vec<H256>,
    last_bid: Option<FeeBid>,
}

impl SentTransactions {
    fn push(&mut self, tx_hash: H256, bid: FeeBid) {
        self.hashes.push(tx_hash);
        self.last_bid = Some(bid);
    }

    fn latest(&self) -> Option<H256> {
        self.hashes.last().copied()
    }

    fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

pub struct SubmissionEngine {
    client: Arc<dyn ChainClient>,
    queue: Arc<MintQueue>,
    fees: Arc<FeePolicy>,
    metrics: Arc<MintMetrics>,
    guard: Arc<ConsistencyGuard>,
    records: Arc<dyn RecordSink>,
    refresh: Arc<dyn SupplyRefresh>,
    contract: Address,
    actor: String,
    config: SubmissionConfig,
    backoff: BackoffConfig,
    events: broadcast::Sender<SubmissionEvent>,
}

impl SubmissionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn ChainClient>,
        queue: Arc<MintQueue>,
        fees: Arc<FeePolicy>,
        metrics: Arc<MintMetrics>,
        guard: Arc<ConsistencyGuard>,
        contract: Address,
        config: SubmissionConfig,
        backoff: BackoffConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            client,
            queue,
            fees,
            metrics,
            guard,
            records: Arc::new(NoopRecordSink),
            refresh: Arc::new(NoopSupplyRefresh),
            contract,
            actor: "anonymous".to_string(),
            config,
            backoff,
            events,
        }
    }

    pub fn with_records(mut self, records: Arc<dyn RecordSink>) -> Self {
        self.records = records;
        self
    }

    pub fn with_refresh(mut self, refresh: Arc<dyn SupplyRefresh>) -> Self {
        self.refresh = refresh;
        self
    }

    /// Name under which action records are written, usually the minter.
    pub fn with_actor(mut self, actor: &str) -> Self {
        self.actor = actor.to_string();
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SubmissionEvent> {
        self.events.subscribe()
    }

    pub fn queue(&self) -> &Arc<MintQueue> {
        &self.queue
    }

    pub fn fees(&self) -> &Arc<FeePolicy> {
        &self.fees
    }

    pub fn metrics(&self) -> &Arc<MintMetrics> {
        &self.metrics
    }

    pub fn records(&self) -> &Arc<dyn RecordSink> {
        &self.records
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn config(&self) -> &SubmissionConfig {
        &self.config
    }

    /// Run `request` to Confirmed or Failed.
    pub async fn process(&self, request: MintRequest) -> Result<TxReceipt, MintError> {
        let span = tracing::info_span!("mint", id = request.id);
        self.process_inner(request).instrument(span).await
    }

    async fn process_inner(&self, request: MintRequest) -> Result<TxReceipt, MintError> {
        let started = Instant::now();

        if self.guard.is_halted(&request.collection, request.phase) {
            let error = MintError::PhaseHalted {
                phase: request.phase,
            };
            return self.finish(&request, Err(error), 0, started.elapsed()).await;
        }

        let call = ContractCall::for_mint(self.contract, &request, &self.config);
        let max_attempts = self.config.max_attempts.max(1);
        let mut sent = SentTransactions::default();
        let mut attempt = 0;

        let outcome = loop {
            attempt += 1;
            match self.attempt(&request, &call, attempt, &mut sent).await {
                Ok(receipt) => break Ok(receipt),
                Err(error) => {
                    if !error.is_retryable() || attempt >= max_attempts {
                        break Err(error);
                    }

                    let delay = pressure_delay(&self.backoff, self.queue.len());
                    warn!(
                        "Mint #{} attempt {}/{} failed: {}. Retrying in {:?}",
                        request.id, attempt, max_attempts, error, delay
                    );
                    self.publish(SubmissionEvent::AttemptFailed {
                        id: request.id,
                        attempt,
                        error,
                        retry_in: delay,
                    });
                    tokio::time::sleep(delay).await;
                }
            }
        };

        // Any earlier transaction may have been mined while we waited on a
        // later one; only a receipt decides that nothing landed.
        let outcome = match outcome {
            Err(error) if error.is_retryable() && !sent.is_empty() => {
                match self.landed(&request, &sent).await {
                    Some(receipt) => Self::settle(receipt),
                    None => Err(error),
                }
            }
            other => other,
        };

        self.finish(&request, outcome, attempt, started.elapsed()).await
    }

    async fn attempt(
        &self,
        request: &MintRequest,
        call: &ContractCall,
        attempt: u32,
        sent: &mut SentTransactions,
    ) -> Result<TxReceipt, MintError> {
        let fee_data = match timeout(self.config.fee_timeout(), self.client.fee_estimate()).await {
            Ok(Ok(fee_data)) => fee_data,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(MintError::Timeout),
        };

        let bid = self.fees.compute_replacement(
            &fee_data,
            self.queue.len(),
            attempt,
            sent.last_bid.as_ref(),
        );
        debug!(
            "Mint #{} attempt {}: multiplier {:.3}, max fee {}, priority {}",
            request.id, attempt, bid.multiplier, bid.max_fee_per_gas, bid.max_priority_fee_per_gas
        );
        self.publish(SubmissionEvent::BidComputed {
            id: request.id,
            attempt,
            bid,
        });

        let tx_hash = match self.client.submit_transaction(call, &bid, sent.latest()).await {
            Ok(tx_hash) => tx_hash,
            Err(ChainError::NonceConsumed { message }) if !sent.is_empty() => {
                // Something already used this nonce, most likely one of ours.
                debug!("Mint #{} replacement refused: {}", request.id, message);
                return match self.landed(request, sent).await {
                    Some(receipt) => Self::settle(receipt),
                    None => Err(MintError::Unknown { message }),
                };
            }
            Err(e) => return Err(e.into()),
        };
        sent.push(tx_hash, bid);

        debug!("Mint #{} attempt {} sent: {:?}", request.id, attempt, tx_hash);
        self.publish(SubmissionEvent::Submitted {
            id: request.id,
            attempt,
            tx_hash,
        });

        let wait = self.config.confirmation_timeout();
        let waited = timeout(
            wait,
            self.client
                .wait_for_receipt(tx_hash, self.config.confirmations, wait),
        )
        .await;

        match waited {
            Ok(Ok(receipt)) => Self::settle(receipt),
            Ok(Err(ChainError::Timeout { .. })) | Err(_) => match self.landed(request, sent).await {
                Some(receipt) => Self::settle(receipt),
                None => Err(MintError::Timeout),
            },
            Ok(Err(e)) => Err(e.into()),
        }
    }

    /// Look up every hash sent for this request, newest first.
    async fn landed(&self, request: &MintRequest, sent: &SentTransactions) -> Option<TxReceipt> {
        for tx_hash in sent.hashes.iter().rev() {
            match self.client.receipt(*tx_hash).await {
                Ok(Some(receipt)) => {
                    if Some(*tx_hash) != sent.latest() {
                        info!(
                            "Mint #{} landed through earlier transaction {:?}",
                            request.id, tx_hash
                        );
                    }
                    return Some(receipt);
                }
                Ok(None) => {}
                Err(e) => debug!("Receipt lookup for {:?} failed: {}", tx_hash, e),
            }
        }
        None
    }

    fn settle(receipt: TxReceipt) -> Result<TxReceipt, MintError> {
        if receipt.success {
            return Ok(receipt);
        }
        let reason = receipt
            .revert_reason
            .unwrap_or_else(|| "transaction reverted".to_string());
        Err(MintError::OnChainRevert {
            kind: RevertKind::classify(&reason),
            reason,
        })
    }

    async fn finish(
        &self,
        request: &MintRequest,
        outcome: Result<TxReceipt, MintError>,
        attempts: u32,
        latency: Duration,
    ) -> Result<TxReceipt, MintError> {
        self.metrics
            .record_outcome(outcome.is_ok(), attempts, latency);
        self.queue.complete(request.id);

        match &outcome {
            Ok(receipt) => {
                info!(
                    target: MINT_RESULT_TARGET,
                    outcome = "SUCCESS",
                    collection = %request.collection,
                    phase = %request.phase,
                    quantity = request.quantity,
                    tx = ?receipt.tx_hash,
                    attempts,
                    latency_ms = latency.as_millis() as u64,
                    "Mint #{}",
                    request.id
                );
                self.records.record_action(
                    &self.actor,
                    "mint_confirmed",
                    json!({
                        "request_id": request.id,
                        "collection": request.collection,
                        "phase": request.phase.as_str(),
                        "quantity": request.quantity,
                        "tx_hash": format!("{:?}", receipt.tx_hash),
                        "block_number": receipt.block_number,
                        "attempts": attempts,
                        "latency_ms": latency.as_millis() as u64,
                    }),
                );
                self.refresh
                    .on_mint_confirmed(&request.collection, receipt)
                    .await;
                self.publish(SubmissionEvent::Confirmed {
                    id: request.id,
                    attempts,
                    receipt: receipt.clone(),
                });
            }
            Err(error) => {
                // The session checked this proof against the stored root, so a
                // proof rejection on chain means the two roots disagree.
                if matches!(
                    error,
                    MintError::OnChainRevert {
                        kind: RevertKind::WhitelistProofInvalid,
                        ..
                    }
                ) && request.proof.is_some()
                    && self.guard.halt(
                        &request.collection,
                        request.phase,
                        "contract rejected a proof that verifies against the stored root",
                    )
                {
                    self.publish(SubmissionEvent::PhaseHalted {
                        collection: request.collection.clone(),
                        phase: request.phase,
                    });
                }

                info!(
                    target: MINT_RESULT_TARGET,
                    outcome = "FAILED",
                    collection = %request.collection,
                    phase = %request.phase,
                    quantity = request.quantity,
                    error = %error,
                    attempts,
                    latency_ms = latency.as_millis() as u64,
                    "Mint #{}",
                    request.id
                );
                self.records.record_action(
                    &self.actor,
                    "mint_failed",
                    json!({
                        "request_id": request.id,
                        "collection": request.collection,
                        "phase": request.phase.as_str(),
                        "quantity": request.quantity,
                        "error": error.kind(),
                        "message": error.to_string(),
                        "attempts": attempts,
                    }),
                );
                self.publish(SubmissionEvent::Failed {
                    id: request.id,
                    attempts,
                    error: error.clone(),
                });
            }
        }

        outcome
    }

    fn publish(&self, event: SubmissionEvent) {
        let _ = self.events.send(event);
    }
}
