// tests/integration/to_isolation_test.rs

use super::test_helpers::*;
use std::time::Duration;
use syncra::core::gcs::loopback::LoopbackHub;
use syncra::core::writeset::RowAction;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_total_order_execution_replicates_with_connection_setup() {
    let hub = LoopbackHub::new();
    let a = spawn_node(&hub, test_config()).await;
    let b = spawn_node(&hub, test_config()).await;

    a.engine.set_database(5, "USE shop").unwrap();
    a.engine
        .set_variable(5, "sql_mode", "SET sql_mode = 'STRICT'")
        .unwrap();

    a.engine
        .to_execute_start(5, "ALTER TABLE t ADD COLUMN c INT")
        .await
        .unwrap();
    // The host executes the statement locally here, isolated from every
    // commit in the cluster.
    a.engine.to_execute_end(5).await.unwrap();

    assert!(
        wait_until(
            || {
                b.handler
                    .applied_queries()
                    .contains(&"ALTER TABLE t ADD COLUMN c INT".to_string())
            },
            Duration::from_secs(2)
        )
        .await
    );

    // Connection setup replays before the statement itself.
    let queries = b.handler.applied_queries();
    let use_at = queries.iter().position(|q| q == "USE shop").unwrap();
    let alter_at = queries
        .iter()
        .position(|q| q == "ALTER TABLE t ADD COLUMN c INT")
        .unwrap();
    assert!(use_at < alter_at);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_total_order_execution_blocks_remote_commits() {
    let hub = LoopbackHub::new();
    let a = spawn_node(&hub, test_config()).await;
    let b = spawn_node(&hub, test_config()).await;

    a.engine
        .to_execute_start(5, "ALTER TABLE t ADD COLUMN c INT")
        .await
        .unwrap();

    // A remote commit arrives while the DDL holds the commit queue: it
    // may apply, but it cannot commit.
    b.engine
        .append_query(21, "INSERT INTO t VALUES (21)", 0, 0)
        .unwrap();
    b.engine
        .append_row_key(21, "db.t", b"21", RowAction::Insert)
        .unwrap();
    b.engine.commit(21, 1, b"").await.unwrap();
    b.engine.committed(21).await.unwrap();

    assert!(
        wait_until(
            || {
                a.handler
                    .applied_queries()
                    .contains(&"INSERT INTO t VALUES (21)".to_string())
            },
            Duration::from_secs(2)
        )
        .await
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(a.store.inner().last_committed_seqno(), 0);

    a.engine.to_execute_end(5).await.unwrap();
    assert!(
        wait_until(
            || a.store.inner().last_committed_seqno() == 2,
            Duration::from_secs(2)
        )
        .await
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_to_execute_end_without_start_fails() {
    let hub = LoopbackHub::new();
    let node = spawn_node(&hub, test_config()).await;
    assert!(node.engine.to_execute_end(5).await.is_err());
}
