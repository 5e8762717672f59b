use super::reconcile::reconcile;
use super::schedule::clamp_windows;
use super::{
    Adjustment, AllowListUpdate, Clock, ConsistencyGuard, Phase, PhaseChange, PhaseEvent,
    PhaseKey, PhaseStatus, PhaseUpdate,
};
use crate::address;
use crate::config::PhaseDefaults;
use crate::error::{CoreError, PhaseError, StoreError};
use crate::merkle::{self, MerkleCommitment};
use crate::storage::{
    allow_list_key, commitment_key, load_json, phases_key, save_json, KeyValueStore,
};
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

/// Persisted record under `phases/{collection}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PhaseBook {
    total_supply: u64,
    phases: BTreeMap<PhaseKey, Phase>,
}

/// Result of disabling a phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseRemoval {
    pub removed: Phase,
    pub adjustments: Vec<Adjustment>,
}

/// Phases, allow-lists and commitments of one collection.
///
/// Every mutation runs under one lock, is applied to a copy, persisted, and
/// only then made visible, so a failed write leaves the previous state intact.
pub struct PhaseStore {
    collection: String,
    kv: Arc<dyn KeyValueStore>,
    guard: Arc<ConsistencyGuard>,
    clock: Arc<dyn Clock>,
    defaults: PhaseDefaults,
    book: Mutex<PhaseBook>,
    events: broadcast::Sender<PhaseEvent>,
}

impl PhaseStore {
    /// Load the collection's phases, creating the catch-all phase on first use.
    pub async fn open(
        collection: &str,
        kv: Arc<dyn KeyValueStore>,
        guard: Arc<ConsistencyGuard>,
        clock: Arc<dyn Clock>,
        defaults: PhaseDefaults,
    ) -> Result<Self, StoreError> {
        let key = phases_key(collection);
        let loaded: Option<PhaseBook> = load_json(kv.as_ref(), &key).await?;
        let fresh = loaded.is_none();

        let mut book = loaded.unwrap_or_else(|| PhaseBook {
            total_supply: defaults.total_supply,
            phases: BTreeMap::new(),
        });

        if !book.phases.contains_key(&PhaseKey::CATCH_ALL) {
            let now = clock.now();
            book.phases.insert(
                PhaseKey::CATCH_ALL,
                Phase {
                    key: PhaseKey::CATCH_ALL,
                    price: U256::zero(),
                    allocation: 0,
                    start: now,
                    end: now + defaults.default_duration(),
                    active: true,
                    is_public: true,
                },
            );
        }

        let mut adjustments = clamp_windows(&mut book.phases, None, defaults.min_duration());
        let reconciled = reconcile(&book.phases, book.total_supply);
        book.phases = reconciled.phases;
        adjustments.extend(reconciled.adjustments);

        if fresh || !adjustments.is_empty() {
            save_json(kv.as_ref(), &key, &book).await?;
        }

        info!(
            "Phase store opened for '{}' ({} phases, supply {})",
            collection,
            book.phases.len(),
            book.total_supply
        );

        let (events, _) = broadcast::channel(defaults.event_capacity.max(1));

        Ok(Self {
            collection: collection.to_string(),
            kv,
            guard,
            clock,
            defaults,
            book: Mutex::new(book),
            events,
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn guard(&self) -> &Arc<ConsistencyGuard> {
        &self.guard
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Change notifications for every successful mutation.
    pub fn subscribe(&self) -> broadcast::Receiver<PhaseEvent> {
        self.events.subscribe()
    }

    /// All enabled phases in priority order.
    pub async fn phases(&self) -> Vec<Phase> {
        self.book.lock().await.phases.values().cloned().collect()
    }

    pub async fn phase(&self, key: PhaseKey) -> Option<Phase> {
        self.book.lock().await.phases.get(&key).cloned()
    }

    pub async fn total_supply(&self) -> u64 {
        self.book.lock().await.total_supply
    }

    pub async fn status(&self, key: PhaseKey, now: DateTime<Utc>) -> PhaseStatus {
        let book = self.book.lock().await;
        PhaseStatus::of(book.phases.get(&key), now)
    }

    /// First phase in priority order that is switched on and whose window
    /// contains `now`.
    pub async fn active_phase(&self, now: DateTime<Utc>) -> Option<Phase> {
        let book = self.book.lock().await;
        book.phases
            .values()
            .find(|p| p.active && p.contains(now))
            .cloned()
    }

    /// Create or edit a phase, then repair windows and allocations.
    pub async fn upsert_phase(
        &self,
        key: PhaseKey,
        update: PhaseUpdate,
    ) -> Result<PhaseChange, CoreError> {
        let mut book = self.book.lock().await;
        let mut next = book.clone();

        let created = !next.phases.contains_key(&key);
        if created {
            let phase = self.default_phase(&next, key);
            debug!(
                "Enabling phase {} for '{}' with window {} -> {}",
                key, self.collection, phase.start, phase.end
            );
            next.phases.insert(key, phase);
        }

        let mut adjustments = Vec::new();
        if let Some(phase) = next.phases.get_mut(&key) {
            apply_update(phase, &update);
        }

        let edited_end = update.end.map(|_| key);
        adjustments.extend(clamp_windows(
            &mut next.phases,
            edited_end,
            self.defaults.min_duration(),
        ));
        let reconciled = reconcile(&next.phases, next.total_supply);
        next.phases = reconciled.phases;
        adjustments.extend(reconciled.adjustments);

        let phase = next
            .phases
            .get(&key)
            .cloned()
            .ok_or(PhaseError::NotFound { key })?;

        self.persist(&next).await?;
        *book = next;
        drop(book);

        self.log_adjustments(&adjustments);
        info!(
            "Phase {} of '{}' saved: allocation {}, window {} -> {}, active {}",
            key, self.collection, phase.allocation, phase.start, phase.end, phase.active
        );

        let _ = self.events.send(PhaseEvent::Upserted {
            collection: self.collection.clone(),
            phase: phase.clone(),
            adjustments: adjustments.clone(),
        });

        Ok(PhaseChange {
            phase,
            created,
            adjustments,
        })
    }

    /// Disable a phase. Its allocation returns to the catch-all phase and its
    /// allow-list and commitment are deleted.
    pub async fn remove_phase(&self, key: PhaseKey) -> Result<PhaseRemoval, CoreError> {
        if key.is_catch_all() {
            return Err(PhaseError::ProtectedPhase { key }.into());
        }

        let mut book = self.book.lock().await;
        let mut next = book.clone();
        let removed = next
            .phases
            .remove(&key)
            .ok_or(PhaseError::NotFound { key })?;

        let reconciled = reconcile(&next.phases, next.total_supply);
        next.phases = reconciled.phases;
        let adjustments = reconciled.adjustments;

        // Dependent records go first so a failed delete leaves the phase in
        // place and the removal can simply be retried. The commitment goes
        // before the list so no proofs outlive the list they came from.
        self.kv
            .remove(&commitment_key(&self.collection, key))
            .await?;
        self.kv
            .remove(&allow_list_key(&self.collection, key))
            .await?;
        self.persist(&next).await?;
        *book = next;
        drop(book);

        self.guard.clear(&self.collection, key);
        self.log_adjustments(&adjustments);
        info!(
            "Phase {} of '{}' disabled, {} units returned to {}",
            key,
            self.collection,
            removed.allocation,
            PhaseKey::CATCH_ALL
        );

        let _ = self.events.send(PhaseEvent::Removed {
            collection: self.collection.clone(),
            key,
            adjustments: adjustments.clone(),
        });

        Ok(PhaseRemoval {
            removed,
            adjustments,
        })
    }

    pub async fn set_total_supply(&self, total_supply: u64) -> Result<Vec<Adjustment>, CoreError> {
        let mut book = self.book.lock().await;
        let mut next = book.clone();
        next.total_supply = total_supply;

        let reconciled = reconcile(&next.phases, total_supply);
        next.phases = reconciled.phases;
        let adjustments = reconciled.adjustments;

        self.persist(&next).await?;
        *book = next;
        drop(book);

        self.log_adjustments(&adjustments);
        info!("Total supply of '{}' set to {}", self.collection, total_supply);

        let _ = self.events.send(PhaseEvent::SupplyChanged {
            collection: self.collection.clone(),
            total_supply,
            adjustments: adjustments.clone(),
        });

        Ok(adjustments)
    }

    /// Replace a gated phase's allow-list and rebuild its commitment.
    pub async fn set_allow_list<I, S>(&self, key: PhaseKey, raw: I) -> Result<AllowListUpdate, CoreError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let normalized = address::normalize_all(raw);
        let book = self.book.lock().await;
        self.ensure_gated(&book, key)?;
        self.rebuild(key, normalized.valid, normalized.invalid).await
    }

    /// Add addresses to a gated phase's allow-list and rebuild its commitment.
    pub async fn add_addresses<I, S>(&self, key: PhaseKey, raw: I) -> Result<AllowListUpdate, CoreError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let normalized = address::normalize_all(raw);
        let book = self.book.lock().await;
        self.ensure_gated(&book, key)?;

        let mut members = self.load_allow_list(key).await?;
        members.extend(normalized.valid);
        self.rebuild(key, members, normalized.invalid).await
    }

    /// Remove addresses from a gated phase's allow-list and rebuild its
    /// commitment.
    pub async fn remove_addresses<I, S>(&self, key: PhaseKey, raw: I) -> Result<AllowListUpdate, CoreError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let normalized = address::normalize_all(raw);
        let book = self.book.lock().await;
        self.ensure_gated(&book, key)?;

        let mut members = self.load_allow_list(key).await?;
        members.retain(|a| !normalized.valid.contains(a));
        self.rebuild(key, members, normalized.invalid).await
    }

    pub async fn allow_list(&self, key: PhaseKey) -> Result<BTreeSet<Address>, StoreError> {
        self.load_allow_list(key).await
    }

    /// Stored commitment, or the empty commitment if none was built.
    pub async fn commitment(&self, key: PhaseKey) -> Result<MerkleCommitment, StoreError> {
        let stored: Option<MerkleCommitment> =
            load_json(self.kv.as_ref(), &commitment_key(&self.collection, key)).await?;
        Ok(stored.unwrap_or_else(MerkleCommitment::empty))
    }

    pub async fn proof_for(
        &self,
        key: PhaseKey,
        address: &Address,
    ) -> Result<Option<Vec<H256>>, StoreError> {
        let commitment = self.commitment(key).await?;
        Ok(commitment.proof(address).map(<[H256]>::to_vec))
    }

    /// Halt a phase after a verification mismatch and notify subscribers.
    pub fn halt(&self, key: PhaseKey, address: Option<Address>, reason: &str) {
        if self.guard.halt(&self.collection, key, reason) {
            let _ = self.events.send(PhaseEvent::Halted {
                collection: self.collection.clone(),
                key,
                address,
            });
        }
    }

    fn ensure_gated(&self, book: &PhaseBook, key: PhaseKey) -> Result<(), PhaseError> {
        match book.phases.get(&key) {
            None => Err(PhaseError::NotFound { key }),
            Some(phase) if !phase.is_gated() => Err(PhaseError::NotGated { key }),
            Some(_) => Ok(()),
        }
    }

    async fn load_allow_list(&self, key: PhaseKey) -> Result<BTreeSet<Address>, StoreError> {
        let stored: Option<Vec<Address>> =
            load_json(self.kv.as_ref(), &allow_list_key(&self.collection, key)).await?;
        Ok(stored.unwrap_or_default().into_iter().collect())
    }

    async fn rebuild(
        &self,
        key: PhaseKey,
        members: BTreeSet<Address>,
        invalid: Vec<String>,
    ) -> Result<AllowListUpdate, CoreError> {
        let commitment = merkle::build(&members);
        let list: Vec<Address> = members.iter().copied().collect();

        save_json(
            self.kv.as_ref(),
            &allow_list_key(&self.collection, key),
            &list,
        )
        .await?;
        save_json(
            self.kv.as_ref(),
            &commitment_key(&self.collection, key),
            &commitment,
        )
        .await?;

        self.guard.clear(&self.collection, key);

        if !invalid.is_empty() {
            info!(
                "Skipped {} malformed addresses for {} of '{}'",
                invalid.len(),
                key,
                self.collection
            );
        }
        info!(
            "Commitment for {} of '{}' rebuilt: {} members, root {:?}",
            key,
            self.collection,
            members.len(),
            commitment.root
        );

        let _ = self.events.send(PhaseEvent::AllowListChanged {
            collection: self.collection.clone(),
            key,
            root: commitment.root,
            members: members.len(),
        });

        Ok(AllowListUpdate {
            key,
            root: commitment.root,
            members: members.len(),
            invalid,
        })
    }

    /// New phase window: right after the nearest earlier phase, or now.
    /// Window for a newly enabled phase: from its predecessor's end (or now)
    /// for the default duration, shortened to fit before the next phase when
    /// that gap holds at least the minimum duration.
    fn default_phase(&self, book: &PhaseBook, key: PhaseKey) -> Phase {
        let start = book
            .phases
            .range(..key)
            .next_back()
            .map(|(_, earlier)| earlier.end)
            .unwrap_or_else(|| self.clock.now());

        let mut end = start + self.defaults.default_duration();
        let next_start = book
            .phases
            .range(key..)
            .next()
            .map(|(_, later)| later.start);
        if let Some(next_start) = next_start {
            if next_start - start >= self.defaults.min_duration() {
                end = end.min(next_start);
            }
        }

        Phase {
            key,
            price: U256::zero(),
            allocation: 0,
            start,
            end,
            active: false,
            is_public: key.is_catch_all(),
        }
    }

    async fn persist(&self, book: &PhaseBook) -> Result<(), StoreError> {
        save_json(self.kv.as_ref(), &phases_key(&self.collection), book).await
    }

    fn log_adjustments(&self, adjustments: &[Adjustment]) {
        for adjustment in adjustments {
            info!("[{}] {}", self.collection, adjustment);
        }
    }
}

fn apply_update(phase: &mut Phase, update: &PhaseUpdate) {
    if let Some(price) = update.price {
        phase.price = price;
    }
    // The catch-all allocation is always derived.
    if let Some(allocation) = update.allocation {
        if !phase.key.is_catch_all() {
            phase.allocation = allocation;
        }
    }
    if let Some(start) = update.start {
        phase.start = start;
    }
    if let Some(end) = update.end {
        phase.end = end;
    }
    if let Some(active) = update.active {
        phase.active = active;
    }
    if let Some(is_public) = update.is_public {
        phase.is_public = is_public || phase.key.is_catch_all();
    }
}
