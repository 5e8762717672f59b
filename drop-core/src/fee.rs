//! # Fee Escalation
//!
//! Bids scale with queue pressure and attempt number on top of a baseline
//! multiplier that tunes itself from each cycle's success ratio.

use crate::config::FeePolicyConfig;
use ethers::types::U256;
use serde::Serialize;
use std::sync::Mutex;
use tracing::info;

pub const MIN_MULTIPLIER: f64 = 0.5;
pub const MAX_MULTIPLIER: f64 = 3.0;

/// Per-attempt escalation step.
pub const ATTEMPT_STEP: f64 = 0.2;

/// `(queue length above, factor)`, checked top-down.
pub const QUEUE_TIERS: [(usize, f64); 3] = [(100, 1.5), (50, 1.3), (20, 1.15)];

/// Smallest raise a node accepts for a same-nonce replacement.
pub const REPLACEMENT_BUMP: f64 = 1.10;

const RAISE_BELOW: f64 = 0.95;
const LOWER_ABOVE: f64 = 0.98;
const RAISE_FACTOR: f64 = 1.10;
const LOWER_FACTOR: f64 = 0.95;

/// Network fee snapshot, in wei.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeeData {
    pub base_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

/// EIP-1559 fee fields for one submission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FeeBid {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub multiplier: f64,
}

pub fn gwei_to_wei(gwei: u64) -> U256 {
    U256::from(gwei) * U256::exp10(9)
}

pub fn queue_factor(queue_len: usize) -> f64 {
    QUEUE_TIERS
        .iter()
        .find(|(above, _)| queue_len > *above)
        .map(|(_, factor)| *factor)
        .unwrap_or(1.0)
}

/// Multiply in basis points to keep the arithmetic in integers.
fn scale(value: U256, multiplier: f64) -> U256 {
    let bps = (multiplier * 10_000.0).round().max(0.0) as u64;
    value.saturating_mul(U256::from(bps)) / U256::from(10_000u64)
}

#[derive(Debug)]
pub struct FeePolicy {
    config: FeePolicyConfig,
    baseline: Mutex<f64>,
}

impl FeePolicy {
    pub fn new(config: FeePolicyConfig) -> Self {
        let baseline = config.initial_multiplier.clamp(MIN_MULTIPLIER, MAX_MULTIPLIER);
        Self {
            config,
            baseline: Mutex::new(baseline),
        }
    }

    pub fn baseline(&self) -> f64 {
        *self.baseline.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn cap(&self) -> U256 {
        gwei_to_wei(self.config.max_gwei)
    }

    /// `baseline x queue tier x (1 + 0.2 (attempt - 1))`; attempts count from 1.
    pub fn multiplier(&self, queue_len: usize, attempt: u32) -> f64 {
        let attempt_factor = 1.0 + ATTEMPT_STEP * attempt.saturating_sub(1) as f64;
        self.baseline() * queue_factor(queue_len) * attempt_factor
    }

    pub fn compute_bid(&self, fee_data: &FeeData, queue_len: usize, attempt: u32) -> FeeBid {
        let multiplier = self.multiplier(queue_len, attempt);
        let cap = self.cap();

        let priority = scale(fee_data.max_priority_fee_per_gas, multiplier).min(cap);
        let max_fee = fee_data
            .base_fee_per_gas
            .saturating_mul(U256::from(2u64))
            .saturating_add(priority)
            .min(cap);

        FeeBid {
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: priority,
            multiplier,
        }
    }

    /// Bid for an attempt that replaces `previous`. Every field stays at or
    /// above the previous bid and the fees rise by [`REPLACEMENT_BUMP`] where
    /// the cap leaves room, whatever the queue or the network did meanwhile.
    pub fn compute_replacement(
        &self,
        fee_data: &FeeData,
        queue_len: usize,
        attempt: u32,
        previous: Option<&FeeBid>,
    ) -> FeeBid {
        let bid = self.compute_bid(fee_data, queue_len, attempt);
        let Some(previous) = previous else {
            return bid;
        };

        let cap = self.cap();
        let floor = |fresh: U256, prior: U256| {
            fresh
                .max(scale(prior, REPLACEMENT_BUMP).min(cap))
                .max(prior)
        };

        FeeBid {
            max_fee_per_gas: floor(bid.max_fee_per_gas, previous.max_fee_per_gas),
            max_priority_fee_per_gas: floor(
                bid.max_priority_fee_per_gas,
                previous.max_priority_fee_per_gas,
            ),
            multiplier: bid.multiplier.max(previous.multiplier),
        }
    }

    /// Feed one cycle's outcome back into the baseline and return the new
    /// value.
    pub fn record_cycle(&self, successes: u64, total: u64) -> f64 {
        let mut baseline = self.baseline.lock().unwrap_or_else(|e| e.into_inner());
        if total == 0 {
            return *baseline;
        }

        let ratio = successes as f64 / total as f64;
        let previous = *baseline;

        if ratio < RAISE_BELOW {
            *baseline *= RAISE_FACTOR;
        } else if ratio > LOWER_ABOVE && total >= self.config.min_samples {
            *baseline *= LOWER_FACTOR;
        }
        *baseline = baseline.clamp(MIN_MULTIPLIER, MAX_MULTIPLIER);

        if (*baseline - previous).abs() > f64::EPSILON {
            info!(
                "Fee baseline {:.3} -> {:.3} ({}/{} confirmed)",
                previous, *baseline, successes, total
            );
        }
        *baseline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fees(base_gwei: u64, tip_gwei: u64) -> FeeData {
        FeeData {
            base_fee_per_gas: gwei_to_wei(base_gwei),
            max_priority_fee_per_gas: gwei_to_wei(tip_gwei),
        }
    }

    fn policy(max_gwei: u64) -> FeePolicy {
        FeePolicy::new(FeePolicyConfig {
            max_gwei,
            initial_multiplier: 1.0,
            min_samples: 10,
        })
    }

    #[test]
    fn test_queue_tiers() {
        assert_eq!(queue_factor(0), 1.0);
        assert_eq!(queue_factor(20), 1.0);
        assert_eq!(queue_factor(21), 1.15);
        assert_eq!(queue_factor(51), 1.3);
        assert_eq!(queue_factor(101), 1.5);
    }

    #[test]
    fn test_bid_arithmetic() {
        let bid = policy(1_000).compute_bid(&fees(10, 2), 0, 2);

        assert!((bid.multiplier - 1.2).abs() < 1e-9);
        assert_eq!(bid.max_priority_fee_per_gas, U256::from(2_400_000_000u64));
        assert_eq!(bid.max_fee_per_gas, U256::from(22_400_000_000u64));
    }

    #[test]
    fn test_bid_is_capped() {
        let bid = policy(15).compute_bid(&fees(10, 20), 200, 3);
        assert_eq!(bid.max_fee_per_gas, gwei_to_wei(15));
        assert_eq!(bid.max_priority_fee_per_gas, gwei_to_wei(15));
    }

    #[test]
    fn test_escalation_monotonic_across_attempts() {
        let policy = policy(300);
        for queue_len in [0, 25, 75, 150] {
            let bids: Vec<FeeBid> = (1..=6)
                .map(|attempt| policy.compute_bid(&fees(30, 3), queue_len, attempt))
                .collect();
            for pair in bids.windows(2) {
                assert!(pair[1].multiplier > pair[0].multiplier);
                assert!(pair[1].max_fee_per_gas >= pair[0].max_fee_per_gas);
                assert!(pair[1].max_priority_fee_per_gas >= pair[0].max_priority_fee_per_gas);
            }
        }
    }

    #[test]
    fn test_replacement_never_bids_lower_when_queue_drains() {
        let policy = policy(1_000);
        let first = policy.compute_bid(&fees(30, 3), 150, 1);
        assert!((first.multiplier - 1.5).abs() < 1e-9);

        // Queue emptied and the base fee fell before the retry.
        let second = policy.compute_replacement(&fees(10, 3), 0, 2, Some(&first));

        assert!(second.multiplier >= first.multiplier);
        assert!(second.max_fee_per_gas >= scale(first.max_fee_per_gas, REPLACEMENT_BUMP));
        assert!(
            second.max_priority_fee_per_gas
                >= scale(first.max_priority_fee_per_gas, REPLACEMENT_BUMP)
        );
        assert!(second.max_priority_fee_per_gas <= second.max_fee_per_gas);
    }

    #[test]
    fn test_replacement_at_cap_holds_previous_bid() {
        let policy = policy(15);
        let first = policy.compute_bid(&fees(10, 20), 0, 1);
        let second = policy.compute_replacement(&fees(1, 1), 0, 2, Some(&first));

        assert_eq!(second.max_fee_per_gas, gwei_to_wei(15));
        assert_eq!(second.max_priority_fee_per_gas, first.max_priority_fee_per_gas);
    }

    #[test]
    fn test_first_attempt_has_no_floor() {
        let policy = policy(1_000);
        assert_eq!(
            policy.compute_replacement(&fees(10, 2), 0, 1, None),
            policy.compute_bid(&fees(10, 2), 0, 1)
        );
    }

    #[test]
    fn test_tuning_stays_bounded() {
        let policy = policy(100);
        for _ in 0..200 {
            let b = policy.record_cycle(1, 10);
            assert!(b <= MAX_MULTIPLIER);
        }
        assert!((policy.baseline() - MAX_MULTIPLIER).abs() < 1e-9);

        for _ in 0..500 {
            let b = policy.record_cycle(100, 100);
            assert!(b >= MIN_MULTIPLIER);
        }
        assert!((policy.baseline() - MIN_MULTIPLIER).abs() < 1e-9);
    }

    #[test]
    fn test_small_samples_do_not_lower_baseline() {
        let policy = policy(100);
        assert_eq!(policy.record_cycle(3, 3), 1.0);
        assert_eq!(policy.record_cycle(0, 0), 1.0);
        assert!(policy.record_cycle(10, 10) < 1.0);
    }

    #[test]
    fn test_middle_band_keeps_baseline() {
        let policy = policy(100);
        assert_eq!(policy.record_cycle(96, 100), 1.0);
    }
}
