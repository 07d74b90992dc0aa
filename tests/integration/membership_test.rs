// tests/integration/membership_test.rs

use super::test_helpers::*;
use std::time::Duration;
use syncra::core::gcs::ClusterView;
use syncra::core::gcs::loopback::LoopbackHub;
use syncra::core::writeset::RowAction;
use uuid::Uuid;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_primary_view_without_state_transfer() {
    let hub = LoopbackHub::new();
    let node = spawn_node(&hub, test_config()).await;
    assert_eq!(node.engine.group_uuid(), Uuid::nil());

    // The node is already consistent: view seqno equals its own.
    let view = hub.current_view_for(node.member_id(), false);
    hub.deliver_view_to(node.member_id(), view);

    assert!(
        wait_until(
            || node.engine.group_uuid() == hub.group_uuid(),
            Duration::from_secs(2)
        )
        .await
    );
    assert_eq!(node.engine.node_index(), node.member_id() as i64);

    // The pipeline keeps working after the view change.
    node.engine
        .append_query(1, "INSERT INTO t VALUES (1)", 0, 0)
        .unwrap();
    node.engine.commit(1, 1, b"").await.unwrap();
    node.engine.committed(1).await.unwrap();
    assert_eq!(node.engine.global_seqno(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_non_primary_view_stalls_nothing_else() {
    let hub = LoopbackHub::new();
    let node = spawn_node(&hub, test_config()).await;

    let view = ClusterView {
        conf_id: -1,
        seqno: 0,
        group_uuid: hub.group_uuid(),
        members: 1,
        my_idx: node.member_id() as i64,
        state_transfer_required: false,
    };
    hub.deliver_view_to(node.member_id(), view);

    // A non-primary view only passes its own slot over; the next primary
    // action still flows.
    node.engine
        .append_query(1, "INSERT INTO t VALUES (1)", 0, 0)
        .unwrap();
    node.engine.commit(1, 1, b"").await.unwrap();
    node.engine.committed(1).await.unwrap();
    assert_eq!(node.engine.global_seqno(), 1);
    // The group UUID of a non-primary view is not adopted.
    assert_eq!(node.engine.group_uuid(), Uuid::nil());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_state_transfer_on_join() {
    let hub = LoopbackHub::new();
    let donor = spawn_node(&hub, test_config()).await;

    // The group has history the joiner does not.
    donor
        .engine
        .append_query(1, "INSERT INTO t VALUES (1)", 0, 0)
        .unwrap();
    donor
        .engine
        .append_row_key(1, "db.t", b"1", RowAction::Insert)
        .unwrap();
    donor.engine.commit(1, 1, b"").await.unwrap();
    donor.engine.committed(1).await.unwrap();

    let joiner = spawn_node(&hub, test_config()).await;
    let view = hub.current_view_for(joiner.member_id(), true);
    let view_seqno = view.seqno;
    hub.deliver_view_to(joiner.member_id(), view);

    // The joiner requests a donor, passes the request's slot over, joins,
    // and adopts the group seqno and identity.
    assert!(
        wait_until(
            || joiner.engine.global_seqno() == view_seqno,
            Duration::from_secs(2)
        )
        .await
    );
    assert_eq!(joiner.engine.group_uuid(), hub.group_uuid());
    assert_eq!(joiner.engine.node_index(), joiner.member_id() as i64);

    // New write sets flow to the joiner normally after the join.
    donor
        .engine
        .append_query(2, "INSERT INTO t VALUES (2)", 0, 0)
        .unwrap();
    donor
        .engine
        .append_row_key(2, "db.t", b"2", RowAction::Insert)
        .unwrap();
    donor.engine.commit(2, 1, b"").await.unwrap();
    donor.engine.committed(2).await.unwrap();

    assert!(
        wait_until(
            || {
                joiner
                    .handler
                    .applied_queries()
                    .contains(&"INSERT INTO t VALUES (2)".to_string())
            },
            Duration::from_secs(2)
        )
        .await
    );
    assert!(
        wait_until(
            || joiner.engine.global_seqno() == view_seqno + 1,
            Duration::from_secs(2)
        )
        .await
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_actions_below_join_seqno_are_skipped() {
    let hub = LoopbackHub::new();
    let donor = spawn_node(&hub, test_config()).await;
    let joiner = spawn_node(&hub, test_config()).await;

    // Pretend the state transfer covered five seqnos the transport has
    // not even assigned yet: everything below that must be skipped.
    let mut view = hub.current_view_for(joiner.member_id(), true);
    view.seqno = hub.global_seqno() + 5;
    let view_seqno = view.seqno;
    hub.deliver_view_to(joiner.member_id(), view);

    assert!(
        wait_until(
            || joiner.engine.global_seqno() == view_seqno,
            Duration::from_secs(2)
        )
        .await
    );

    donor
        .engine
        .append_query(1, "INSERT INTO t VALUES ('old')", 0, 0)
        .unwrap();
    donor
        .engine
        .append_row_key(1, "db.t", b"1", RowAction::Insert)
        .unwrap();
    donor.engine.commit(1, 1, b"").await.unwrap();
    donor.engine.committed(1).await.unwrap();

    // The write set's global seqno is below the join point: the joiner
    // passes it over without applying.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(joiner.handler.applied_queries().is_empty());
    assert_eq!(joiner.engine.global_seqno(), view_seqno);
}
