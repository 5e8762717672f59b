use super::{Adjustment, Phase, PhaseKey};
use chrono::Duration;
use std::collections::BTreeMap;

/// Repair phase windows in place and report what moved.
///
/// Every phase is first given at least `min_duration`. Then, walking
/// neighbours in priority order, a later phase that starts before the
/// earlier one ends is resolved by snapping a boundary:
///
/// - if `edited_end` names the earlier phase, its end is pulled back to the
///   later phase's start (but never below its own minimum duration);
/// - whatever overlap remains moves the later phase's start up to the
///   earlier phase's end, extending its end if needed.
///
/// A set that already satisfies both rules comes back untouched.
pub fn clamp_windows(
    phases: &mut BTreeMap<PhaseKey, Phase>,
    edited_end: Option<PhaseKey>,
    min_duration: Duration,
) -> Vec<Adjustment> {
    let mut adjustments = Vec::new();

    for phase in phases.values_mut() {
        ensure_min_duration(phase, min_duration, &mut adjustments);
    }

    let keys: Vec<PhaseKey> = phases.keys().copied().collect();
    for pair in keys.windows(2) {
        let (earlier_key, later_key) = (pair[0], pair[1]);
        let Some(later_start) = phases.get(&later_key).map(|p| p.start) else {
            continue;
        };

        if edited_end == Some(earlier_key) {
            if let Some(earlier) = phases.get_mut(&earlier_key) {
                if later_start < earlier.end {
                    let snapped = later_start.max(earlier.start + min_duration);
                    if snapped < earlier.end {
                        adjustments.push(Adjustment::EndSnapped {
                            key: earlier_key,
                            from: earlier.end,
                            to: snapped,
                        });
                        earlier.end = snapped;
                    }
                }
            }
        }

        let Some(earlier_end) = phases.get(&earlier_key).map(|p| p.end) else {
            continue;
        };
        if let Some(later) = phases.get_mut(&later_key) {
            if later.start < earlier_end {
                adjustments.push(Adjustment::StartSnapped {
                    key: later_key,
                    from: later.start,
                    to: earlier_end,
                });
                later.start = earlier_end;
                ensure_min_duration(later, min_duration, &mut adjustments);
            }
        }
    }

    adjustments
}

fn ensure_min_duration(phase: &mut Phase, min_duration: Duration, adjustments: &mut Vec<Adjustment>) {
    let min_end = phase.start + min_duration;
    if phase.end < min_end {
        adjustments.push(Adjustment::EndExtended {
            key: phase.key,
            from: phase.end,
            to: min_end,
        });
        phase.end = min_end;
    }
}

/// True when every window meets the minimum and no two windows overlap.
pub fn is_well_formed(phases: &BTreeMap<PhaseKey, Phase>, min_duration: Duration) -> bool {
    let durations_ok = phases
        .values()
        .all(|p| p.start < p.end && p.end - p.start >= min_duration);
    let ordered: Vec<&Phase> = phases.values().collect();
    let no_overlap = ordered.windows(2).all(|w| w[1].start >= w[0].end);
    durations_ok && no_overlap
}
