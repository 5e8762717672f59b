use super::PhaseKey;
use crate::utils::MINT_RESULT_TARGET;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{info, warn};

/// Halt flags for phases whose off-chain and on-chain verification disagree.
///
/// A halted phase accepts no new mint requests and the submission engine
/// fails its queued requests without sending them. Only a commitment rebuild
/// for the phase clears the flag.
#[derive(Debug, Default)]
pub struct ConsistencyGuard {
    halted: Mutex<HashMap<(String, PhaseKey), String>>,
}

impl ConsistencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the halt flag. Returns `true` if the phase was not halted yet.
    pub fn halt(&self, collection: &str, key: PhaseKey, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let mut halted = self.halted.lock().unwrap_or_else(|e| e.into_inner());
        let fresh = !halted.contains_key(&(collection.to_string(), key));
        if fresh {
            warn!(
                target: MINT_RESULT_TARGET,
                outcome = "HALTED",
                collection,
                phase = %key,
                reason = %reason,
                "Phase halted until its commitment is rebuilt"
            );
            halted.insert((collection.to_string(), key), reason);
        }
        fresh
    }

    pub fn is_halted(&self, collection: &str, key: PhaseKey) -> bool {
        self.halted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&(collection.to_string(), key))
    }

    pub fn reason(&self, collection: &str, key: PhaseKey) -> Option<String> {
        self.halted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(collection.to_string(), key))
            .cloned()
    }

    /// Clear the flag. Returns `true` if the phase was halted.
    pub fn clear(&self, collection: &str, key: PhaseKey) -> bool {
        let removed = self
            .halted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(collection.to_string(), key))
            .is_some();
        if removed {
            info!("Phase {} of '{}' resumed after commitment rebuild", key, collection);
        }
        removed
    }

    pub fn halted_count(&self) -> usize {
        self.halted.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
