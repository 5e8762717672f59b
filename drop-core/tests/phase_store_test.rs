mod common;

use async_trait::async_trait;
use chrono::Duration;
use common::{at, defaults, memory_store};
use drop_core::phases::schedule::is_well_formed;
use drop_core::phases::{clamp_windows, reconcile};
use drop_core::{
    Adjustment, Clock, ConsistencyGuard, CoreError, KeyValueStore, ManualClock, MemoryStore,
    PhaseError, PhaseEvent, PhaseKey, PhaseStatus, PhaseStore, PhaseUpdate, SqliteStore,
    StoreError,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Memory store whose deletes can be made to fail.
#[derive(Default)]
struct FailingRemoves {
    inner: MemoryStore,
    failing: AtomicBool,
}

#[async_trait]
impl KeyValueStore for FailingRemoves {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Backend {
                key: key.to_string(),
                msg: "disk unavailable".to_string(),
            });
        }
        self.inner.remove(key).await
    }
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(at(9, 0)))
}

fn guard() -> Arc<ConsistencyGuard> {
    Arc::new(ConsistencyGuard::new())
}

async fn allocation_sum(store: &PhaseStore) -> u64 {
    store.phases().await.iter().map(|p| p.allocation).sum()
}

async fn assert_consistent(store: &PhaseStore, total_supply: u64) {
    let phases = store.phases().await;
    let map = phases.iter().map(|p| (p.key, p.clone())).collect();
    assert!(is_well_formed(&map, Duration::seconds(60)), "{:#?}", phases);

    let authored: u64 = phases
        .iter()
        .filter(|p| !p.key.is_catch_all())
        .map(|p| p.allocation)
        .sum();
    if authored <= total_supply {
        assert_eq!(allocation_sum(store).await, total_supply);
    } else {
        let public = store.phase(PhaseKey::Public).await.unwrap();
        assert_eq!(public.allocation, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_catch_all_absorbs_new_allocation() {
        let (_, store) = memory_store(1_000, clock(), guard()).await;
        assert_eq!(
            store.phase(PhaseKey::Public).await.unwrap().allocation,
            1_000
        );

        let change = store
            .upsert_phase(PhaseKey::Whitelist, PhaseUpdate::new().allocation(200))
            .await
            .unwrap();

        assert!(change.created);
        assert_eq!(store.phase(PhaseKey::Public).await.unwrap().allocation, 800);
        assert!(change.adjustments.contains(&Adjustment::AllocationDerived {
            key: PhaseKey::Public,
            from: 1_000,
            to: 800,
        }));
    }

    #[tokio::test]
    async fn test_overlapping_start_snaps_to_previous_end() {
        let (_, store) = memory_store(1_000, clock(), guard()).await;
        store
            .upsert_phase(
                PhaseKey::Whitelist,
                PhaseUpdate::new().window(at(10, 0), at(12, 0)),
            )
            .await
            .unwrap();

        let change = store
            .upsert_phase(
                PhaseKey::Fcfs,
                PhaseUpdate::new().window(at(11, 0), at(14, 0)),
            )
            .await
            .unwrap();

        assert_eq!(change.phase.start, at(12, 0));
        assert_eq!(change.phase.end, at(14, 0));
        assert!(change.adjustments.contains(&Adjustment::StartSnapped {
            key: PhaseKey::Fcfs,
            from: at(11, 0),
            to: at(12, 0),
        }));
    }

    #[tokio::test]
    async fn test_edited_end_snaps_back_to_next_start() {
        let (_, store) = memory_store(1_000, clock(), guard()).await;
        store
            .upsert_phase(
                PhaseKey::Whitelist,
                PhaseUpdate::new().window(at(10, 0), at(12, 0)),
            )
            .await
            .unwrap();
        store
            .upsert_phase(PhaseKey::Fcfs, PhaseUpdate::new().window(at(12, 0), at(14, 0)))
            .await
            .unwrap();

        let change = store
            .upsert_phase(PhaseKey::Whitelist, PhaseUpdate::new().end(at(13, 0)))
            .await
            .unwrap();

        assert_eq!(change.phase.end, at(12, 0));
        let fcfs = store.phase(PhaseKey::Fcfs).await.unwrap();
        assert_eq!(fcfs.start, at(12, 0));
    }

    #[tokio::test]
    async fn test_short_window_extended_to_minimum() {
        let (_, store) = memory_store(1_000, clock(), guard()).await;
        let change = store
            .upsert_phase(
                PhaseKey::Whitelist,
                PhaseUpdate::new().window(at(10, 0), at(10, 0)),
            )
            .await
            .unwrap();

        assert_eq!(change.phase.end, at(10, 1));
    }

    #[tokio::test]
    async fn test_invariants_hold_after_every_edit() {
        let (_, store) = memory_store(1_000, clock(), guard()).await;

        let edits: Vec<(PhaseKey, PhaseUpdate)> = vec![
            (PhaseKey::Fcfs, PhaseUpdate::new().allocation(300)),
            (
                PhaseKey::Whitelist,
                PhaseUpdate::new().allocation(250).window(at(8, 0), at(20, 0)),
            ),
            (PhaseKey::Fcfs, PhaseUpdate::new().start(at(9, 30))),
            (PhaseKey::Public, PhaseUpdate::new().window(at(7, 0), at(7, 30))),
            (PhaseKey::Whitelist, PhaseUpdate::new().end(at(23, 0))),
            (PhaseKey::Fcfs, PhaseUpdate::new().allocation(900)),
            (PhaseKey::Whitelist, PhaseUpdate::new().allocation(0)),
            (PhaseKey::Public, PhaseUpdate::new().allocation(5)),
        ];

        for (key, update) in edits {
            store.upsert_phase(key, update).await.unwrap();
            assert_consistent(&store, 1_000).await;
        }

        store.remove_phase(PhaseKey::Fcfs).await.unwrap();
        assert_consistent(&store, 1_000).await;

        store.set_total_supply(200).await.unwrap();
        assert_consistent(&store, 200).await;
    }

    #[tokio::test]
    async fn test_invariants_hold_for_random_edit_sequences() {
        const KEYS: [PhaseKey; 3] = [PhaseKey::Whitelist, PhaseKey::Fcfs, PhaseKey::Public];

        for seed in 0..20u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let (_, store) = memory_store(1_000, clock(), guard()).await;
            let mut total_supply = 1_000;

            for _ in 0..60 {
                let key = KEYS[rng.gen_range(0..KEYS.len())];
                let start = at(rng.gen_range(0..24), rng.gen_range(0..60));
                let length = Duration::minutes(rng.gen_range(0..600));

                match rng.gen_range(0..8) {
                    0 => {
                        let _ = store.remove_phase(key).await;
                    }
                    1 => {
                        total_supply = rng.gen_range(0..2_000);
                        store.set_total_supply(total_supply).await.unwrap();
                    }
                    2 => {
                        store
                            .upsert_phase(key, PhaseUpdate::new().end(start + length))
                            .await
                            .unwrap();
                    }
                    3 => {
                        store
                            .upsert_phase(key, PhaseUpdate::new().start(start))
                            .await
                            .unwrap();
                    }
                    4 => {
                        store
                            .upsert_phase(key, PhaseUpdate::new().active(rng.gen()))
                            .await
                            .unwrap();
                    }
                    5 => {
                        store
                            .upsert_phase(key, PhaseUpdate::new().window(start, start + length))
                            .await
                            .unwrap();
                    }
                    _ => {
                        store
                            .upsert_phase(
                                key,
                                PhaseUpdate::new().allocation(rng.gen_range(0..800)),
                            )
                            .await
                            .unwrap();
                    }
                }

                assert_consistent(&store, total_supply).await;
            }
        }
    }

    #[tokio::test]
    async fn test_over_allocation_floors_catch_all() {
        let (_, store) = memory_store(100, clock(), guard()).await;
        let change = store
            .upsert_phase(PhaseKey::Whitelist, PhaseUpdate::new().allocation(150))
            .await
            .unwrap();

        assert_eq!(store.phase(PhaseKey::Public).await.unwrap().allocation, 0);
        assert!(change.adjustments.contains(&Adjustment::AllocationFloored {
            key: PhaseKey::Public,
            authored: 150,
            total_supply: 100,
        }));
    }

    #[tokio::test]
    async fn test_clamp_and_reconcile_are_idempotent() {
        let (_, store) = memory_store(1_000, clock(), guard()).await;
        store
            .upsert_phase(
                PhaseKey::Whitelist,
                PhaseUpdate::new().allocation(100).window(at(10, 0), at(11, 0)),
            )
            .await
            .unwrap();
        store
            .upsert_phase(PhaseKey::Fcfs, PhaseUpdate::new().start(at(10, 30)))
            .await
            .unwrap();

        let mut map = store
            .phases()
            .await
            .into_iter()
            .map(|p| (p.key, p))
            .collect();
        assert!(clamp_windows(&mut map, None, Duration::seconds(60)).is_empty());

        let again = reconcile(&map, 1_000);
        assert!(again.adjustments.is_empty());
        assert_eq!(again.phases, map);
    }

    #[tokio::test]
    async fn test_catch_all_cannot_be_removed() {
        let (_, store) = memory_store(1_000, clock(), guard()).await;
        let err = store.remove_phase(PhaseKey::Public).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::Phase(PhaseError::ProtectedPhase {
                key: PhaseKey::Public
            })
        ));
    }

    #[tokio::test]
    async fn test_removing_phase_returns_allocation_and_drops_list() {
        let (kv, store) = memory_store(1_000, clock(), guard()).await;
        store
            .upsert_phase(PhaseKey::Whitelist, PhaseUpdate::new().allocation(400))
            .await
            .unwrap();
        store
            .set_allow_list(PhaseKey::Whitelist, ["0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"])
            .await
            .unwrap();
        assert!(kv.contains("allowlist/apes/Whitelist").await);

        let removal = store.remove_phase(PhaseKey::Whitelist).await.unwrap();
        assert_eq!(removal.removed.allocation, 400);
        assert_eq!(store.phase(PhaseKey::Public).await.unwrap().allocation, 1_000);
        assert!(!kv.contains("allowlist/apes/Whitelist").await);
        assert!(!kv.contains("commitment/apes/Whitelist").await);
    }

    #[tokio::test]
    async fn test_new_phase_fits_before_scheduled_public() {
        let (_, store) = memory_store(1_000, clock(), guard()).await;
        store
            .upsert_phase(
                PhaseKey::Public,
                PhaseUpdate::new().window(at(12, 0), at(18, 0)),
            )
            .await
            .unwrap();

        let change = store
            .upsert_phase(PhaseKey::Whitelist, PhaseUpdate::new().active(true))
            .await
            .unwrap();

        assert!(change.created);
        assert_eq!(change.phase.start, at(9, 0));
        assert_eq!(change.phase.end, at(12, 0));
        assert!(!change
            .adjustments
            .iter()
            .any(|a| matches!(a, Adjustment::StartSnapped { .. })));

        let public = store.phase(PhaseKey::Public).await.unwrap();
        assert_eq!(public.start, at(12, 0));
        assert_eq!(public.end, at(18, 0));
    }

    #[tokio::test]
    async fn test_failed_removal_leaves_phase_intact() {
        let kv = Arc::new(FailingRemoves::default());
        let open = || {
            PhaseStore::open("apes", kv.clone(), guard(), clock(), defaults(1_000))
        };
        let store = open().await.unwrap();
        store
            .upsert_phase(PhaseKey::Whitelist, PhaseUpdate::new().allocation(400))
            .await
            .unwrap();
        store
            .set_allow_list(PhaseKey::Whitelist, ["0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"])
            .await
            .unwrap();

        kv.failing.store(true, Ordering::SeqCst);
        let err = store.remove_phase(PhaseKey::Whitelist).await.unwrap_err();
        assert!(matches!(err, CoreError::Store(StoreError::Backend { .. })));

        // Memory and storage still agree the phase exists, with its records.
        assert!(store.phase(PhaseKey::Whitelist).await.is_some());
        let reopened = open().await.unwrap();
        assert_eq!(
            reopened.phase(PhaseKey::Whitelist).await.unwrap().allocation,
            400
        );
        assert!(kv.inner.contains("allowlist/apes/Whitelist").await);
        assert!(kv.inner.contains("commitment/apes/Whitelist").await);

        kv.failing.store(false, Ordering::SeqCst);
        store.remove_phase(PhaseKey::Whitelist).await.unwrap();
        assert!(!kv.inner.contains("allowlist/apes/Whitelist").await);
        assert!(!kv.inner.contains("commitment/apes/Whitelist").await);
        assert!(open().await.unwrap().phase(PhaseKey::Whitelist).await.is_none());
    }

    #[tokio::test]
    async fn test_status_follows_clock() {
        let clock = clock();
        let (_, store) = memory_store(1_000, clock.clone(), guard()).await;
        assert_eq!(
            store.status(PhaseKey::Fcfs, clock.now()).await,
            PhaseStatus::Disabled
        );

        store
            .upsert_phase(
                PhaseKey::Whitelist,
                PhaseUpdate::new().window(at(10, 0), at(11, 0)),
            )
            .await
            .unwrap();
        assert_eq!(
            store.status(PhaseKey::Whitelist, clock.now()).await,
            PhaseStatus::Configuring
        );

        store
            .upsert_phase(PhaseKey::Whitelist, PhaseUpdate::new().active(true))
            .await
            .unwrap();
        assert_eq!(
            store.status(PhaseKey::Whitelist, at(10, 30)).await,
            PhaseStatus::ActiveEligible
        );
        assert_eq!(
            store.status(PhaseKey::Whitelist, at(11, 0)).await,
            PhaseStatus::Expired
        );
    }

    #[tokio::test]
    async fn test_active_phase_prefers_priority_order() {
        let (_, store) = memory_store(1_000, clock(), guard()).await;
        store
            .upsert_phase(
                PhaseKey::Whitelist,
                PhaseUpdate::new().window(at(10, 0), at(11, 0)).active(true),
            )
            .await
            .unwrap();

        let active = store.active_phase(at(10, 15)).await.unwrap();
        assert_eq!(active.key, PhaseKey::Whitelist);
        assert!(store.active_phase(at(9, 0)).await.is_none());
    }

    #[tokio::test]
    async fn test_allow_list_edits_rebuild_commitment() {
        let (_, store) = memory_store(1_000, clock(), guard()).await;
        store
            .upsert_phase(PhaseKey::Whitelist, PhaseUpdate::new())
            .await
            .unwrap();

        let first = store
            .set_allow_list(
                PhaseKey::Whitelist,
                ["0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed", "garbage"],
            )
            .await
            .unwrap();
        assert_eq!(first.members, 1);
        assert_eq!(first.invalid, vec!["garbage".to_string()]);

        let added = store
            .add_addresses(
                PhaseKey::Whitelist,
                ["0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359"],
            )
            .await
            .unwrap();
        assert_eq!(added.members, 2);
        assert_ne!(added.root, first.root);

        let commitment = store.commitment(PhaseKey::Whitelist).await.unwrap();
        assert_eq!(commitment.root, added.root);
        assert!(commitment.is_consistent());

        let removed = store
            .remove_addresses(
                PhaseKey::Whitelist,
                ["0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359"],
            )
            .await
            .unwrap();
        assert_eq!(removed.root, first.root);
    }

    #[tokio::test]
    async fn test_public_phase_rejects_allow_list() {
        let (_, store) = memory_store(1_000, clock(), guard()).await;
        let err = store
            .set_allow_list(PhaseKey::Public, ["0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Phase(PhaseError::NotGated { .. })));
    }

    #[tokio::test]
    async fn test_mutations_publish_events() {
        let (_, store) = memory_store(1_000, clock(), guard()).await;
        let mut events = store.subscribe();

        store
            .upsert_phase(PhaseKey::Fcfs, PhaseUpdate::new().allocation(10))
            .await
            .unwrap();
        store.set_total_supply(500).await.unwrap();

        match events.recv().await.unwrap() {
            PhaseEvent::Upserted { phase, .. } => assert_eq!(phase.key, PhaseKey::Fcfs),
            other => panic!("unexpected {:?}", other),
        }
        match events.recv().await.unwrap() {
            PhaseEvent::SupplyChanged { total_supply, .. } => assert_eq!(total_supply, 500),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let kv = Arc::new(MemoryStore::new());
        let defaults = common::defaults(1_000);
        {
            let store = PhaseStore::open("apes", kv.clone(), guard(), clock(), defaults.clone())
                .await
                .unwrap();
            store
                .upsert_phase(PhaseKey::Whitelist, PhaseUpdate::new().allocation(250))
                .await
                .unwrap();
        }

        let reopened = PhaseStore::open("apes", kv, guard(), clock(), defaults)
            .await
            .unwrap();
        assert_eq!(
            reopened.phase(PhaseKey::Whitelist).await.unwrap().allocation,
            250
        );
        assert_eq!(
            reopened.phase(PhaseKey::Public).await.unwrap().allocation,
            750
        );
    }

    #[tokio::test]
    async fn test_sqlite_backed_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drop.db");
        let sqlite = Arc::new(SqliteStore::new(path.to_str().unwrap()).await.unwrap());

        let store = PhaseStore::open(
            "apes",
            sqlite.clone(),
            guard(),
            clock(),
            common::defaults(1_000),
        )
        .await
        .unwrap();
        store
            .upsert_phase(PhaseKey::Fcfs, PhaseUpdate::new().allocation(100))
            .await
            .unwrap();
        store
            .upsert_phase(PhaseKey::Whitelist, PhaseUpdate::new())
            .await
            .unwrap();
        store
            .set_allow_list(
                PhaseKey::Whitelist,
                ["0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"],
            )
            .await
            .unwrap();
        drop(store);

        let reopened = PhaseStore::open(
            "apes",
            sqlite.clone(),
            guard(),
            clock(),
            common::defaults(1_000),
        )
        .await
        .unwrap();
        assert_eq!(reopened.phase(PhaseKey::Public).await.unwrap().allocation, 900);
        assert_eq!(
            reopened.allow_list(PhaseKey::Whitelist).await.unwrap().len(),
            1
        );
        sqlite.close().await;
    }
}
