//! # Mint Session
//!
//! Client-side entry point during a drop: resolves the active phase, attaches
//! the wallet's proof, queues the request and runs the single drain worker.

use crate::error::{QueueError, SessionError};
use crate::merkle;
use crate::metrics::MetricsSnapshot;
use crate::phases::PhaseStore;
use crate::queue::{MintQueue, MintRequest, Priority, RequestId};
use crate::submission::SubmissionEngine;
use ethers::types::{Address, U256};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct MintSession {
    store: Arc<PhaseStore>,
    engine: Arc<SubmissionEngine>,
    wallet: Option<Address>,
    wake: Notify,
}

impl MintSession {
    pub fn new(store: Arc<PhaseStore>, engine: Arc<SubmissionEngine>, wallet: Option<Address>) -> Self {
        Self {
            store,
            engine,
            wallet,
            wake: Notify::new(),
        }
    }

    pub fn store(&self) -> &Arc<PhaseStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<SubmissionEngine> {
        &self.engine
    }

    fn queue(&self) -> &Arc<MintQueue> {
        self.engine.queue()
    }

    /// Queue a mint of `quantity` units in whichever phase is active now.
    pub async fn enqueue_mint(&self, quantity: u32, priority: Priority) -> Result<RequestId, SessionError> {
        if quantity == 0 {
            return Err(SessionError::ZeroQuantity);
        }

        let collection = self.store.collection().to_string();
        let now = self.store.clock().now();
        let phase = self
            .store
            .active_phase(now)
            .await
            .ok_or(SessionError::NoActivePhase)?;

        if self.store.guard().is_halted(&collection, phase.key) {
            return Err(SessionError::PhaseHalted { phase: phase.key });
        }

        let proof = if phase.is_gated() {
            let wallet = self.wallet.ok_or(SessionError::WalletNotConnected)?;
            let commitment = self.store.commitment(phase.key).await?;
            let proof = commitment
                .proof(&wallet)
                .ok_or_else(|| SessionError::NotEligible {
                    phase: phase.key,
                    address: crate::address::display(&wallet),
                })?
                .to_vec();

            if !merkle::verify(&wallet, commitment.root, &proof) {
                self.store.halt(
                    phase.key,
                    Some(wallet),
                    "stored proof does not verify against the stored root",
                );
                return Err(SessionError::CommitmentMismatch {
                    phase: phase.key,
                    address: crate::address::display(&wallet),
                });
            }
            Some(proof)
        } else {
            None
        };

        let value = phase.price.saturating_mul(U256::from(quantity));
        let request = MintRequest::new(&collection, phase.key, quantity, proof, value, priority)
            .enqueued_at(now);
        let id = self.queue().enqueue(request);

        info!(
            "Queued mint #{} in {} of '{}': {} units, value {} wei, {:?} priority",
            id, phase.key, collection, quantity, value, priority
        );
        self.engine.records().record_action(
            self.engine.actor(),
            "mint_enqueued",
            json!({
                "request_id": id,
                "collection": collection,
                "phase": phase.key.as_str(),
                "quantity": quantity,
                "value": value.to_string(),
            }),
        );

        self.wake.notify_one();
        Ok(id)
    }

    /// Withdraw a request that has not been picked up by the worker.
    pub fn cancel(&self, id: RequestId) -> Result<MintRequest, QueueError> {
        let request = self.queue().cancel(id)?;
        info!("Cancelled mint #{} before submission", id);
        Ok(request)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let queue = self.queue();
        self.engine
            .metrics()
            .snapshot(queue.len(), queue.in_flight(), self.engine.fees().baseline())
    }

    /// Drain the queue until `cancel` fires. An in-flight request is always
    /// carried to a terminal state before the loop exits.
    pub async fn run(&self, cancel: CancellationToken) -> MetricsSnapshot {
        let window = self.engine.config().tuning_window.max(1) as u64;
        let (mut tuned_successes, mut tuned_total) = self.engine.metrics().outcome_counts();

        info!("Mint worker started for '{}'", self.store.collection());

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.queue().dequeue_next() {
                Some(request) => {
                    debug!("Processing mint #{}", request.id);
                    // Outcome is reported through metrics, events and logs.
                    let _ = self.engine.process(request).await;

                    let (successes, total) = self.engine.metrics().outcome_counts();
                    if total - tuned_total >= window {
                        self.engine
                            .fees()
                            .record_cycle(successes - tuned_successes, total - tuned_total);
                        (tuned_successes, tuned_total) = (successes, total);
                    }
                }
                None => {
                    let (successes, total) = self.engine.metrics().outcome_counts();
                    if total > tuned_total {
                        self.engine
                            .fees()
                            .record_cycle(successes - tuned_successes, total - tuned_total);
                        (tuned_successes, tuned_total) = (successes, total);
                    }

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.wake.notified() => {}
                    }
                }
            }
        }

        let pending = self.queue().len();
        if pending > 0 {
            warn!("Mint worker stopped with {} requests still queued", pending);
        }
        let snapshot = self.metrics();
        info!(
            "Mint worker stopped. Confirmed: {} | Failed: {} | Success Rate: {:.2}%",
            snapshot.requests.successful,
            snapshot.requests.failed,
            snapshot.requests.success_rate * 100.0
        );
        snapshot
    }
}
