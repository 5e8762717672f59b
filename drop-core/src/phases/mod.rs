//! # Sale Phases
//!
//! A collection sells through up to three phases in a fixed priority order:
//! `Whitelist`, then `FCFS`, then `Public`. `Public` is the catch-all phase:
//! it always exists, cannot be removed, and its allocation is derived from
//! whatever supply the other phases leave unclaimed.
//!
//! Edits never fail on overlapping windows or over-allocation. They are
//! repaired and the repairs are reported as [`Adjustment`] values.

use crate::error::PhaseError;
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod guard;
pub mod reconcile;
pub mod schedule;
pub mod store;

pub use guard::ConsistencyGuard;
pub use reconcile::{reconcile, Reconciliation};
pub use schedule::clamp_windows;
pub use store::{PhaseRemoval, PhaseStore};

/// Phase names in priority order. The derived `Ord` is the priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PhaseKey {
    Whitelist,
    #[serde(rename = "FCFS")]
    Fcfs,
    Public,
}

impl PhaseKey {
    pub const ALL: [PhaseKey; 3] = [PhaseKey::Whitelist, PhaseKey::Fcfs, PhaseKey::Public];

    /// The phase that absorbs unallocated supply.
    pub const CATCH_ALL: PhaseKey = PhaseKey::Public;

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseKey::Whitelist => "Whitelist",
            PhaseKey::Fcfs => "FCFS",
            PhaseKey::Public => "Public",
        }
    }

    pub fn is_catch_all(&self) -> bool {
        *self == Self::CATCH_ALL
    }
}

impl fmt::Display for PhaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PhaseKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "whitelist" | "wl" => Ok(PhaseKey::Whitelist),
            "fcfs" => Ok(PhaseKey::Fcfs),
            "public" => Ok(PhaseKey::Public),
            other => Err(format!(
                "unknown phase '{}', expected one of Whitelist, FCFS, Public",
                other
            )),
        }
    }
}

/// One sale phase. Prices are in wei.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub key: PhaseKey,
    pub price: U256,
    pub allocation: u64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub active: bool,
    pub is_public: bool,
}

impl Phase {
    /// Half-open window containment: `start <= now < end`.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.start <= now && now < self.end
    }

    /// Whether minting in this phase requires an allow-list proof.
    pub fn is_gated(&self) -> bool {
        !self.is_public
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }
}

/// Field edits for [`PhaseStore::upsert_phase`]. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseUpdate {
    pub price: Option<U256>,
    pub allocation: Option<u64>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub active: Option<bool>,
    pub is_public: Option<bool>,
}

impl PhaseUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn price(mut self, wei: U256) -> Self {
        self.price = Some(wei);
        self
    }

    /// Set the price from a decimal ether string such as `"0.05"`.
    pub fn price_ether(mut self, ether: &str) -> Result<Self, PhaseError> {
        self.price = Some(parse_price(ether)?);
        Ok(self)
    }

    pub fn allocation(mut self, allocation: u64) -> Self {
        self.allocation = Some(allocation);
        self
    }

    pub fn window(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }

    pub fn start(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }

    pub fn end(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end);
        self
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    pub fn public(mut self, is_public: bool) -> Self {
        self.is_public = Some(is_public);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Parse a non-negative decimal ether amount into wei.
pub fn parse_price(input: &str) -> Result<U256, PhaseError> {
    let trimmed = input.trim();
    let invalid = |reason: &str| PhaseError::InvalidPrice {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    if trimmed.is_empty() {
        return Err(invalid("empty"));
    }
    if trimmed.starts_with('-') {
        return Err(invalid("must not be negative"));
    }
    ethers::utils::parse_ether(trimmed).map_err(|e| invalid(&e.to_string()))
}

/// Lifecycle of a phase at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PhaseStatus {
    /// Not enabled for this collection.
    Disabled,
    /// Enabled but not yet switched on by the creator.
    Configuring,
    /// Switched on and not past its end.
    ActiveEligible,
    Expired,
}

impl PhaseStatus {
    pub fn of(phase: Option<&Phase>, now: DateTime<Utc>) -> Self {
        match phase {
            None => PhaseStatus::Disabled,
            Some(p) if now >= p.end => PhaseStatus::Expired,
            Some(p) if p.active => PhaseStatus::ActiveEligible,
            Some(_) => PhaseStatus::Configuring,
        }
    }
}

/// A repair applied to keep the phase set consistent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Adjustment {
    /// End pushed out to honour the minimum phase duration.
    EndExtended {
        key: PhaseKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
    /// Edited end pulled back to the next phase's start.
    EndSnapped {
        key: PhaseKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
    /// Start moved to the previous phase's end.
    StartSnapped {
        key: PhaseKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
    /// Catch-all allocation recomputed.
    AllocationDerived { key: PhaseKey, from: u64, to: u64 },
    /// Authored allocations exceed total supply; catch-all floored at 0.
    AllocationFloored {
        key: PhaseKey,
        authored: u64,
        total_supply: u64,
    },
}

impl fmt::Display for Adjustment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Adjustment::EndExtended { key, from, to } => {
                write!(f, "{} end extended {} -> {} (minimum duration)", key, from, to)
            }
            Adjustment::EndSnapped { key, from, to } => {
                write!(f, "{} end snapped {} -> {} (next phase start)", key, from, to)
            }
            Adjustment::StartSnapped { key, from, to } => {
                write!(f, "{} start snapped {} -> {} (previous phase end)", key, from, to)
            }
            Adjustment::AllocationDerived { key, from, to } => {
                write!(f, "{} allocation recomputed {} -> {}", key, from, to)
            }
            Adjustment::AllocationFloored {
                key,
                authored,
                total_supply,
            } => write!(
                f,
                "{} allocation floored at 0: {} authored over a supply of {}",
                key, authored, total_supply
            ),
        }
    }
}

/// Result of an upsert: the phase as stored plus the repairs applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseChange {
    pub phase: Phase,
    pub created: bool,
    pub adjustments: Vec<Adjustment>,
}

/// Result of replacing or editing a phase's allow-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowListUpdate {
    pub key: PhaseKey,
    pub root: H256,
    pub members: usize,
    pub invalid: Vec<String>,
}

/// Change notifications published by [`PhaseStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseEvent {
    Upserted {
        collection: String,
        phase: Phase,
        adjustments: Vec<Adjustment>,
    },
    Removed {
        collection: String,
        key: PhaseKey,
        adjustments: Vec<Adjustment>,
    },
    SupplyChanged {
        collection: String,
        total_supply: u64,
        adjustments: Vec<Adjustment>,
    },
    AllowListChanged {
        collection: String,
        key: PhaseKey,
        root: H256,
        members: usize,
    },
    Halted {
        collection: String,
        key: PhaseKey,
        address: Option<Address>,
    },
}

/// Time source, swappable in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to an instant until moved.
#[derive(Debug)]
pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}
