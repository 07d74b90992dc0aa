// tests/property/certification_test.rs

//! Certification invariants checked against a brute-force reference
//! model: a write set fails exactly when some write set committed inside
//! its certification window touches one of its keys.

use proptest::prelude::*;
use std::collections::BTreeSet;
use syncra::core::seqno::Seqno;
use syncra::core::writeset::{RowAction, RowKey, WriteSet};
use syncra::core::wsdb::memory::MemoryWriteSetStore;
use syncra::core::wsdb::{Certification, WriteSetStore};

fn ws_from_keys(keys: &BTreeSet<u8>, last_seen: Seqno) -> WriteSet {
    let mut ws = WriteSet::new_trx(last_seen);
    for &k in keys {
        ws.row_keys.push(RowKey {
            dbtable: "db.t".to_string(),
            key: vec![k],
            action: RowAction::Update,
        });
    }
    ws
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        max_shrink_iters: 1000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_certification_matches_reference_model(
        txns in prop::collection::vec(
            (prop::collection::btree_set(0u8..6, 1..4), 0usize..8),
            1..48
        )
    ) {
        let store = MemoryWriteSetStore::new();
        let mut committed: Vec<(Seqno, BTreeSet<u8>)> = Vec::new();

        for (i, (keys, anchor_raw)) in txns.iter().enumerate() {
            let seqno = (i + 1) as Seqno;
            // An anchor somewhere between "start of history" and "just
            // before this write set".
            let anchor = (*anchor_raw as Seqno).min(seqno - 1);
            let ws = ws_from_keys(keys, anchor);

            let expect_conflict = committed.iter().any(|(s, ks)| {
                *s > anchor && *s < seqno && !ks.is_disjoint(keys)
            });

            // The plain test must agree with the recording append.
            let probe = store.certification_test(&ws, seqno);
            let verdict = store.append_write_set(seqno, &ws);
            prop_assert_eq!(probe, verdict);
            prop_assert_eq!(
                verdict == Certification::Failed,
                expect_conflict,
                "seqno {} anchor {} keys {:?}",
                seqno,
                anchor,
                keys
            );

            if verdict == Certification::Certified {
                committed.push((seqno, keys.clone()));
            }
        }
    }

    #[test]
    fn test_conflict_probe_matches_recorded_history(
        first in prop::collection::btree_set(0u8..6, 1..4),
        second in prop::collection::btree_set(0u8..6, 1..4),
    ) {
        let store = MemoryWriteSetStore::new();
        let ws_first = ws_from_keys(&first, 0);
        let ws_second = ws_from_keys(&second, 1);

        prop_assert_eq!(store.append_write_set(1, &ws_first), Certification::Certified);

        prop_assert_eq!(
            store.conflicts(&ws_second, 1),
            !first.is_disjoint(&second)
        );
        // Probing a seqno with no recorded history never conflicts.
        prop_assert!(!store.conflicts(&ws_second, 2));
    }
}
