//! # Mint Request Queue
//!
//! Priority-ordered buffer between the enqueue path and the drain worker.
//! High runs before Medium before Low; within a priority requests run in
//! `enqueued_at` order, ties broken by insertion sequence.

use crate::error::QueueError;
use crate::phases::PhaseKey;
use chrono::{DateTime, Utc};
use ethers::types::{H256, U256};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use tracing::debug;

pub type RequestId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MintRequest {
    /// Assigned by [`MintQueue::enqueue`].
    pub id: RequestId,
    pub collection: String,
    pub phase: PhaseKey,
    pub quantity: u32,
    /// `None` for public phases. A gated phase with a one-member
    /// allow-list carries `Some` of an empty proof.
    pub proof: Option<Vec<H256>>,
    /// Payment attached to the call, in wei.
    pub value: U256,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
}

impl MintRequest {
    pub fn new(
        collection: &str,
        phase: PhaseKey,
        quantity: u32,
        proof: Option<Vec<H256>>,
        value: U256,
        priority: Priority,
    ) -> Self {
        Self {
            id: 0,
            collection: collection.to_string(),
            phase,
            quantity,
            proof,
            value,
            priority,
            enqueued_at: Utc::now(),
        }
    }

    pub fn enqueued_at(mut self, at: DateTime<Utc>) -> Self {
        self.enqueued_at = at;
        self
    }
}

type SlotKey = (u8, DateTime<Utc>, u64);

#[derive(Debug, Default)]
struct QueueState {
    next_id: RequestId,
    next_seq: u64,
    pending: BTreeMap<SlotKey, MintRequest>,
    slots: HashMap<RequestId, SlotKey>,
    in_flight: HashSet<RequestId>,
}

/// Shared queue; every operation takes the one lock.
#[derive(Debug, Default)]
pub struct MintQueue {
    state: Mutex<QueueState>,
}

impl MintQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn enqueue(&self, mut request: MintRequest) -> RequestId {
        let mut state = self.state();
        state.next_id += 1;
        state.next_seq += 1;

        let id = state.next_id;
        let slot = (request.priority.rank(), request.enqueued_at, state.next_seq);
        request.id = id;

        debug!(
            "Queued mint #{} ({:?}, {} x {} in {})",
            id, request.priority, request.quantity, request.collection, request.phase
        );

        state.slots.insert(id, slot);
        state.pending.insert(slot, request);
        id
    }

    /// Take the next request and mark it in flight.
    pub fn dequeue_next(&self) -> Option<MintRequest> {
        let mut state = self.state();
        let (_, request) = state.pending.pop_first()?;
        state.slots.remove(&request.id);
        state.in_flight.insert(request.id);
        Some(request)
    }

    /// Withdraw a request that has not been handed to the engine yet.
    pub fn cancel(&self, id: RequestId) -> Result<MintRequest, QueueError> {
        let mut state = self.state();
        if state.in_flight.contains(&id) {
            return Err(QueueError::AlreadySubmitted { id });
        }
        let slot = state.slots.remove(&id).ok_or(QueueError::NotFound { id })?;
        state
            .pending
            .remove(&slot)
            .ok_or(QueueError::NotFound { id })
    }

    /// Drop a terminal request from the in-flight set.
    pub fn complete(&self, id: RequestId) -> bool {
        self.state().in_flight.remove(&id)
    }

    /// Number of requests waiting to be dequeued.
    pub fn len(&self) -> usize {
        self.state().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().pending.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.state().in_flight.len()
    }

    /// Pending requests in dequeue order.
    pub fn pending(&self) -> Vec<MintRequest> {
        self.state().pending.values().cloned().collect()
    }
}
