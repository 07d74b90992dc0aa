// tests/integration/bf_abort_test.rs

use super::test_helpers::*;
use std::time::Duration;
use syncra::SyncraError;
use syncra::core::gcs::loopback::LoopbackHub;
use syncra::core::writeset::RowAction;
use syncra::core::wsdb::{TrxState, WriteSetStore};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bf_abort_in_total_order_queue_and_replay() {
    let hub = LoopbackHub::new();
    let a = spawn_node(&hub, test_config()).await;
    let b = spawn_node(&hub, test_config()).await;

    // Stage both transactions first so the anchors match.
    b.engine
        .append_query(7, "INSERT INTO t VALUES ('b')", 0, 0)
        .unwrap();
    b.engine
        .append_row_key(7, "db.t", b"kb", RowAction::Insert)
        .unwrap();
    a.engine
        .append_query(9, "INSERT INTO t VALUES ('a')", 0, 0)
        .unwrap();
    a.engine
        .append_row_key(9, "db.t", b"ka", RowAction::Insert)
        .unwrap();

    // Hold node A's certification of the incoming remote write set, so
    // A's local transaction has to wait behind it in total order.
    a.store.gate_append_at(1);

    b.engine.commit(7, 1, b"").await.unwrap();
    b.engine.committed(7).await.unwrap();
    assert!(wait_until(|| a.store.gate_reached(), Duration::from_secs(2)).await);

    let commit_task = {
        let engine = a.engine.clone();
        tokio::spawn(async move { engine.commit(9, 1, b"").await })
    };

    // Wait until the local transaction has its seqnos, then abort it.
    // Interrupting works whether it is already parked in the queue or
    // still on its way there.
    assert!(
        wait_until(
            || a.store.local_trx(9).state == TrxState::Replicated,
            Duration::from_secs(2)
        )
        .await
    );
    a.engine.cancel_commit(9).await.unwrap();

    // Disjoint keys: the recheck certifies, so the verdict is a replay.
    assert_eq!(commit_task.await.unwrap(), Err(SyncraError::BfAborted));

    // Let the remote write set finish.
    a.store.open_gate();
    assert!(
        wait_until(
            || {
                a.handler
                    .applied_queries()
                    .contains(&"INSERT INTO t VALUES ('b')".to_string())
            },
            Duration::from_secs(2)
        )
        .await
    );

    // Replay runs the full pipeline from the pinned write set and applies
    // through the host handlers.
    a.engine.replay_trx(9).await.unwrap();
    assert!(
        a.handler
            .applied_queries()
            .contains(&"INSERT INTO t VALUES ('a')".to_string())
    );
    assert_eq!(a.engine.global_seqno(), 2);
    assert_eq!(a.store.local_trx(9).state, TrxState::Replicated);

    // Replay fidelity: node B applied the aborted transaction the normal
    // remote way, so both nodes converge.
    assert!(
        wait_until(
            || {
                b.handler
                    .applied_queries()
                    .contains(&"INSERT INTO t VALUES ('a')".to_string())
            },
            Duration::from_secs(2)
        )
        .await
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bf_abort_with_true_conflict_rolls_back() {
    let hub = LoopbackHub::new();
    let a = spawn_node(&hub, test_config()).await;
    let b = spawn_node(&hub, test_config()).await;

    // Same key on both nodes: the recheck must fail and the transaction
    // must roll back instead of replaying.
    b.engine
        .append_query(7, "UPDATE t SET v = 'b' WHERE id = 1", 0, 0)
        .unwrap();
    b.engine
        .append_row_key(7, "db.t", b"1", RowAction::Update)
        .unwrap();
    a.engine
        .append_query(9, "UPDATE t SET v = 'a' WHERE id = 1", 0, 0)
        .unwrap();
    a.engine
        .append_row_key(9, "db.t", b"1", RowAction::Update)
        .unwrap();

    a.store.gate_append_at(1);
    b.engine.commit(7, 1, b"").await.unwrap();
    b.engine.committed(7).await.unwrap();
    assert!(wait_until(|| a.store.gate_reached(), Duration::from_secs(2)).await);

    let commit_task = {
        let engine = a.engine.clone();
        tokio::spawn(async move { engine.commit(9, 1, b"").await })
    };
    assert!(
        wait_until(
            || a.store.local_trx(9).state == TrxState::Replicated,
            Duration::from_secs(2)
        )
        .await
    );

    // Open the gate first so the remote write set certifies; the recheck
    // then sees the conflict.
    a.store.open_gate();
    assert!(
        wait_until(
            || {
                a.handler
                    .applied_queries()
                    .contains(&"UPDATE t SET v = 'b' WHERE id = 1".to_string())
            },
            Duration::from_secs(2)
        )
        .await
    );
    a.engine.cancel_commit(9).await.unwrap();

    assert_eq!(
        commit_task.await.unwrap(),
        Err(SyncraError::TransactionFailed)
    );
    assert_eq!(a.store.local_trx(9).state, TrxState::Aborted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bf_abort_in_commit_queue_and_replay() {
    let hub = LoopbackHub::new();
    let a = spawn_node(&hub, test_config()).await;

    a.engine
        .append_query(11, "INSERT INTO t VALUES (11)", 0, 0)
        .unwrap();
    a.engine
        .append_row_key(11, "db.t", b"k11", RowAction::Insert)
        .unwrap();
    a.engine
        .append_query(12, "INSERT INTO t VALUES (12)", 0, 0)
        .unwrap();
    a.engine
        .append_row_key(12, "db.t", b"k12", RowAction::Insert)
        .unwrap();

    // The first transaction holds the commit queue until committed().
    a.engine.commit(11, 1, b"").await.unwrap();

    let commit_task = {
        let engine = a.engine.clone();
        tokio::spawn(async move { engine.commit(12, 1, b"").await })
    };

    // Wait until the second transaction is past total order; it is now
    // parked at (or headed for) the commit queue.
    assert!(
        wait_until(
            || a.engine.pipeline_positions().0 == 3,
            Duration::from_secs(2)
        )
        .await
    );
    a.engine.cancel_commit(12).await.unwrap();

    assert_eq!(commit_task.await.unwrap(), Err(SyncraError::BfAborted));

    a.engine.committed(11).await.unwrap();

    // Certification already passed: the replay runs only the apply-commit
    // tail.
    a.engine.replay_trx(12).await.unwrap();
    assert!(
        a.handler
            .applied_queries()
            .contains(&"INSERT INTO t VALUES (12)".to_string())
    );
    assert_eq!(a.store.inner().last_committed_seqno(), 2);
}
