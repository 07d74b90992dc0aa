// tests/property/ordering_test.rs

//! Ordering-monitor invariants: every position is entered exactly once, in
//! ascending order, regardless of the order tasks arrive in or which
//! positions are cancelled.

use proptest::prelude::*;
use std::sync::{Arc, Mutex as StdMutex};
use syncra::core::ordering::TotalOrder;
use syncra::core::seqno::{SEQNO_FIRST, Seqno};

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 48,
        max_shrink_iters: 500,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_admission_is_sequential_and_exactly_once(
        count in 2usize..24,
        cancel_mask in prop::collection::vec(any::<bool>(), 24),
        spawn_order in Just((0usize..24).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let monitor = Arc::new(TotalOrder::new("prop", 32, SEQNO_FIRST));
            let admissions = Arc::new(StdMutex::new(Vec::<Seqno>::new()));

            let mut handles = Vec::new();
            for &slot in spawn_order.iter().filter(|&&s| s < count) {
                let seqno = (slot + 1) as Seqno;
                let cancel = cancel_mask[slot];
                let monitor = monitor.clone();
                let admissions = admissions.clone();
                handles.push(tokio::spawn(async move {
                    if cancel {
                        monitor.self_cancel(seqno).await.unwrap();
                    } else {
                        monitor.grab(seqno).await.unwrap();
                        admissions.lock().unwrap().push(seqno);
                        monitor.release(seqno).unwrap();
                    }
                }));
            }
            for handle in handles {
                handle.await.unwrap();
            }

            // Grabbed positions were admitted in strictly ascending order,
            // each exactly once; cancelled positions never appear.
            let admitted = admissions.lock().unwrap().clone();
            let expected: Vec<Seqno> = (1..=count as Seqno)
                .filter(|&s| !cancel_mask[(s - 1) as usize])
                .collect();
            assert_eq!(admitted, expected);

            // The monitor traversed every position.
            assert_eq!(monitor.current(), count as Seqno + 1);
        });
    }

    #[test]
    fn test_interrupted_positions_can_be_recovered_by_cancel(
        count in 2usize..16,
        interrupt_mask in prop::collection::vec(any::<bool>(), 16),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let monitor = Arc::new(TotalOrder::new("prop", 32, SEQNO_FIRST));

            // Arm interrupts first; each interrupted grab must fail once
            // and then be recoverable with a self-cancel, exactly like the
            // brute-force-abort recovery path.
            for slot in 0..count {
                if interrupt_mask[slot] {
                    monitor.interrupt((slot + 1) as Seqno).unwrap();
                }
            }

            for slot in 0..count {
                let seqno = (slot + 1) as Seqno;
                if interrupt_mask[slot] {
                    assert!(monitor.grab(seqno).await.is_err());
                    monitor.self_cancel(seqno).await.unwrap();
                } else {
                    monitor.grab(seqno).await.unwrap();
                    monitor.release(seqno).unwrap();
                }
            }
            assert_eq!(monitor.current(), count as Seqno + 1);
        });
    }
}
