//! Integration tests for the transaction domain.

mod common;

use std::time::Duration;

use common::{domain, Call, EventLog, MockResource};
use xatm::{Status, TransactionEvent, XaError, Xid, XidKind};

#[tokio::test]
async fn test_begin_mints_global_xid() {
    let domain = domain();
    let tx = domain.begin().await.unwrap();
    assert_eq!(tx.xid().kind(), XidKind::Global);
    assert_eq!(tx.status(), Status::Active);

    let other = domain.begin().await.unwrap();
    assert_ne!(tx.xid(), other.xid());
    assert_eq!(domain.active_transactions().await.len(), 2);
}

#[tokio::test]
async fn test_lookup_by_branch_finds_global() {
    let domain = domain();
    let log = EventLog::new();
    let orders = MockResource::new("orders", "db1", &log);
    let tx = domain.begin().await.unwrap();
    tx.enlist_resource(orders.as_resource()).await.unwrap();

    let branch = orders.branch().unwrap();
    assert!(branch.is_branch());
    let found = domain.lookup(&branch).await.unwrap();
    assert_eq!(found.xid(), tx.xid());

    tx.commit().await.unwrap();
    assert!(domain.lookup(tx.xid()).await.is_none());
}

#[tokio::test]
async fn test_import_foreign_transaction() {
    let domain = domain();
    let log = EventLog::new();
    let orders = MockResource::new("orders", "db1", &log);
    let foreign = Xid::new(0x4a4f_5441, b"upstream-tm-42", b"").unwrap();

    let tx = domain.import(&foreign, Duration::from_secs(30)).await.unwrap();
    assert_eq!(tx.xid(), &foreign);
    assert_eq!(tx.timeout(), Duration::from_secs(30));

    tx.enlist_resource(orders.as_resource()).await.unwrap();
    let branch = orders.branch().unwrap();
    assert_eq!(branch.format_id(), 0x4a4f_5441);
    assert_eq!(branch.global_transaction_id(), b"upstream-tm-42");
    assert!(!branch.branch_qualifier().is_empty());

    tx.commit().await.unwrap();
    assert_eq!(orders.count(&Call::Commit(true)), 1);
}

#[tokio::test]
async fn test_recover_returns_only_internal_xids() {
    let domain = domain();
    let log = EventLog::new();
    let orders = MockResource::new("orders", "db1", &log);
    let ours = Xid::new_global().new_branch();
    let theirs = Xid::new(7, b"other-tm", b"b1").unwrap();
    orders.set_in_doubt(vec![ours.clone(), theirs]);

    let recovered = domain.recover(orders.as_ref()).await.unwrap();
    assert_eq!(recovered, vec![ours]);
}

#[tokio::test]
async fn test_events_follow_lifecycle() {
    let domain = domain();
    let mut events = domain.subscribe();

    let committed = domain.begin().await.unwrap();
    let rolled_back = domain.begin().await.unwrap();
    committed.commit().await.unwrap();
    rolled_back.rollback().await.unwrap();

    let received: Vec<TransactionEvent> = vec![
        events.recv().await.unwrap(),
        events.recv().await.unwrap(),
        events.recv().await.unwrap(),
        events.recv().await.unwrap(),
    ];
    assert_eq!(
        received,
        vec![
            TransactionEvent::Begun { xid: committed.xid().clone() },
            TransactionEvent::Begun { xid: rolled_back.xid().clone() },
            TransactionEvent::Completed {
                xid: committed.xid().clone(),
                status: Status::Committed
            },
            TransactionEvent::Completed {
                xid: rolled_back.xid().clone(),
                status: Status::RolledBack
            },
        ]
    );
}

#[tokio::test]
async fn test_shutdown_rolls_back_live_transactions() {
    let domain = domain();
    let log = EventLog::new();
    let orders = MockResource::new("orders", "db1", &log);
    let billing = MockResource::new("billing", "db2", &log);

    let first = domain.begin().await.unwrap();
    first.enlist_resource(orders.as_resource()).await.unwrap();
    let second = domain.begin().await.unwrap();
    second.enlist_resource(billing.as_resource()).await.unwrap();
    second.set_rollback_only().unwrap();

    domain.shutdown().await;

    assert!(domain.is_shutdown());
    assert_eq!(first.status(), Status::RolledBack);
    assert_eq!(second.status(), Status::RolledBack);
    assert_eq!(orders.count(&Call::Rollback), 1);
    assert_eq!(billing.count(&Call::Rollback), 1);
    assert!(matches!(
        domain.begin().await.unwrap_err(),
        XaError::IllegalStateTransition(_)
    ));

    // A second shutdown is a no-op.
    domain.shutdown().await;
}

#[test]
fn test_domain_is_send_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<xatm::TransactionDomain>();
    assert_send_sync::<xatm::Transaction>();
    assert_send_sync::<xatm::ConnectionPool>();
    assert_send_sync::<xatm::PooledHandle>();
}
