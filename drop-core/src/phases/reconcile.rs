use super::{Adjustment, Phase, PhaseKey};
use std::collections::BTreeMap;

/// Phase set after recomputing the catch-all allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub phases: BTreeMap<PhaseKey, Phase>,
    pub adjustments: Vec<Adjustment>,
}

impl Reconciliation {
    pub fn catch_all_allocation(&self) -> Option<u64> {
        self.phases.get(&PhaseKey::CATCH_ALL).map(|p| p.allocation)
    }
}

/// Sum of the creator-authored allocations (every phase but the catch-all).
pub fn authored_allocation(phases: &BTreeMap<PhaseKey, Phase>) -> u64 {
    phases
        .values()
        .filter(|p| !p.key.is_catch_all())
        .fold(0u64, |sum, p| sum.saturating_add(p.allocation))
}

/// Derive the catch-all allocation as `max(0, total_supply - authored)`.
///
/// Over-allocation is not an error: the catch-all floors at zero and an
/// [`Adjustment::AllocationFloored`] is reported.
pub fn reconcile(phases: &BTreeMap<PhaseKey, Phase>, total_supply: u64) -> Reconciliation {
    let mut phases = phases.clone();
    let mut adjustments = Vec::new();

    let authored = authored_allocation(&phases);
    let derived = total_supply.saturating_sub(authored);

    if let Some(catch_all) = phases.get_mut(&PhaseKey::CATCH_ALL) {
        if authored > total_supply {
            adjustments.push(Adjustment::AllocationFloored {
                key: catch_all.key,
                authored,
                total_supply,
            });
        }
        if catch_all.allocation != derived {
            adjustments.push(Adjustment::AllocationDerived {
                key: catch_all.key,
                from: catch_all.allocation,
                to: derived,
            });
            catch_all.allocation = derived;
        }
    }

    Reconciliation {
        phases,
        adjustments,
    }
}
