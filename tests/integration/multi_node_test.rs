// tests/integration/multi_node_test.rs

use super::test_helpers::*;
use std::time::Duration;
use syncra::SyncraError;
use syncra::core::gcs::loopback::LoopbackHub;
use syncra::core::writeset::RowAction;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_nodes_disjoint_commits() {
    let hub = LoopbackHub::new();
    let a = spawn_node(&hub, test_config()).await;
    let b = spawn_node(&hub, test_config()).await;

    // Stage both transactions before either commits, so they share the
    // same certification anchor and are genuinely concurrent.
    a.engine
        .append_query(1, "INSERT INTO t VALUES ('a')", 0, 0)
        .unwrap();
    a.engine
        .append_row_key(1, "db.t", b"ka", RowAction::Insert)
        .unwrap();
    b.engine
        .append_query(2, "INSERT INTO t VALUES ('b')", 0, 0)
        .unwrap();
    b.engine
        .append_row_key(2, "db.t", b"kb", RowAction::Insert)
        .unwrap();

    a.engine.commit(1, 1, b"").await.unwrap();
    a.engine.committed(1).await.unwrap();
    b.engine.commit(2, 1, b"").await.unwrap();
    b.engine.committed(2).await.unwrap();

    // Each node applies the other's write set.
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

    assert!(
        wait_until(
            || a.engine.global_seqno() == 2 && b.engine.global_seqno() == 2,
            Duration::from_secs(2)
        )
        .await
    );
    // The durable step trails the apply: wait for both nodes to record
    // the full history as committed.
    assert!(
        wait_until(
            || {
                a.store.inner().last_committed_seqno() == 2
                    && b.store.inner().last_committed_seqno() == 2
            },
            Duration::from_secs(2)
        )
        .await
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_nodes_conflicting_commits() {
    let hub = LoopbackHub::new();
    let a = spawn_node(&hub, test_config()).await;
    let b = spawn_node(&hub, test_config()).await;

    // Both write the same row with the same anchor.
    a.engine
        .append_query(1, "UPDATE t SET v = 'a' WHERE id = 1", 0, 0)
        .unwrap();
    a.engine
        .append_row_key(1, "db.t", b"1", RowAction::Update)
        .unwrap();
    b.engine
        .append_query(2, "UPDATE t SET v = 'b' WHERE id = 1", 0, 0)
        .unwrap();
    b.engine
        .append_row_key(2, "db.t", b"1", RowAction::Update)
        .unwrap();

    // The first to broadcast wins the lower global seqno and commits.
    a.engine.commit(1, 1, b"").await.unwrap();
    a.engine.committed(1).await.unwrap();

    // The loser fails its own certification.
    assert_eq!(
        b.engine.commit(2, 1, b"").await,
        Err(SyncraError::TransactionFailed)
    );

    // The winner's write set applies on the loser's node.
    assert!(
        wait_until(
            || {
                b.handler
                    .applied_queries()
                    .contains(&"UPDATE t SET v = 'a' WHERE id = 1".to_string())
            },
            Duration::from_secs(2)
        )
        .await
    );

    // The loser's write set is skipped on the winner's node: the node has
    // seen its seqno, but nothing was applied.
    assert!(
        wait_until(|| a.engine.global_seqno() == 2, Duration::from_secs(2)).await
    );
    assert!(a.handler.applied_queries().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remote_rbr_write_set_applies() {
    let hub = LoopbackHub::new();
    let a = spawn_node(&hub, test_config()).await;
    let b = spawn_node(&hub, test_config()).await;

    a.engine
        .append_query(1, "INSERT INTO t VALUES (1)", 0, 0)
        .unwrap();
    a.engine
        .append_row_key(1, "db.t", b"1", RowAction::Insert)
        .unwrap();
    a.engine.commit(1, 1, &[0xca, 0xfe]).await.unwrap();
    a.engine.committed(1).await.unwrap();

    // RBR-level write sets apply through the RBR handler, not statements.
    assert!(
        wait_until(
            || b.handler.applied().contains(&Applied::Rbr(vec![0xca, 0xfe])),
            Duration::from_secs(2)
        )
        .await
    );
    assert!(
        !b.handler
            .applied_queries()
            .contains(&"INSERT INTO t VALUES (1)".to_string())
    );
}
