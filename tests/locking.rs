use conglomdb::config::AccessConfig;
use conglomdb::error::{AccessError, ErrorClass};
use conglomdb::locking::Granularity;
use conglomdb::{
    AccessManager, ColumnType, ConglomerateId, ConglomerateProperties, IsolationLevel, OpenMode,
    Row, Value,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn setup(config: AccessConfig) -> (AccessManager, ConglomerateId) {
    let manager = AccessManager::boot(config).expect("boot");
    let tx = manager.get_transaction().expect("tx");
    let id = tx
        .create_conglomerate("heap", &[ColumnType::Integer], &[], &ConglomerateProperties::new(), false)
        .expect("create");
    tx.commit().expect("commit");
    tx.destroy().expect("destroy");
    (manager, id)
}

fn insert_one(
    manager: &AccessManager,
    id: ConglomerateId,
    granularity: Granularity,
    value: i64,
) -> Result<conglomdb::xact::Transaction, AccessError> {
    let tx = manager.get_transaction()?;
    let cc = tx.open_conglomerate(
        id,
        false,
        OpenMode::FOR_UPDATE,
        granularity,
        IsolationLevel::ReadCommitted,
    )?;
    tx.insert(cc, Row::from([Value::Integer(value)]))?;
    Ok(tx)
}

#[test]
fn record_locking_lets_writers_share_a_heap() {
    let (manager, id) = setup(AccessConfig::testing());
    let first = insert_one(&manager, id, Granularity::Record, 1).expect("first writer");
    let second = insert_one(&manager, id, Granularity::Record, 2).expect("second writer");
    first.commit().expect("commit first");
    second.commit().expect("commit second");
}

#[test]
fn table_locks_make_the_second_writer_time_out() {
    let (manager, id) = setup(AccessConfig::testing().with_lock_wait_timeout_ms(100));
    let holder = insert_one(&manager, id, Granularity::Table, 1).expect("holder");

    let started = Instant::now();
    let err = insert_one(&manager, id, Granularity::Record, 2).expect_err("blocked");
    assert!(matches!(err, AccessError::LockTimeout { .. }));
    assert_eq!(err.class(), ErrorClass::Timeout);
    assert!(started.elapsed() >= Duration::from_millis(100));

    holder.commit().expect("commit");
    insert_one(&manager, id, Granularity::Record, 2)
        .expect("free after commit")
        .commit()
        .expect("commit");
}

#[test]
fn nowait_opens_fail_immediately() {
    let (manager, id) = setup(AccessConfig::testing().with_lock_wait_timeout_ms(5_000));
    let holder = insert_one(&manager, id, Granularity::Table, 1).expect("holder");
    let tx = manager.get_transaction().expect("tx");
    let started = Instant::now();
    let err = tx
        .open_conglomerate(
            id,
            false,
            OpenMode::FOR_UPDATE | OpenMode::LOCK_NOWAIT,
            Granularity::Record,
            IsolationLevel::ReadCommitted,
        )
        .expect_err("nowait");
    assert!(matches!(err, AccessError::LockTimeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(5));
    holder.abort().expect("abort");
}

#[test]
fn disabled_row_locking_promotes_record_requests() {
    let (manager, id) =
        setup(AccessConfig::testing().with_row_locking(false).with_lock_wait_timeout_ms(100));
    assert_eq!(manager.system_granularity(), Granularity::Table);
    let holder = insert_one(&manager, id, Granularity::Record, 1).expect("holder");
    assert!(matches!(
        insert_one(&manager, id, Granularity::Record, 2),
        Err(AccessError::LockTimeout { .. })
    ));
    holder.commit().expect("commit");
}

#[test]
fn blocked_writer_proceeds_once_the_holder_commits() {
    let (manager, id) = setup(AccessConfig::testing().with_lock_wait_timeout_ms(5_000));
    let manager = Arc::new(manager);
    let holder = insert_one(&manager, id, Granularity::Table, 1).expect("holder");

    let waiter = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || {
            let tx = insert_one(&manager, id, Granularity::Table, 2)?;
            tx.commit()
        })
    };
    let deadline = Instant::now() + Duration::from_secs(2);
    while !holder.anyone_blocked() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(holder.anyone_blocked(), "waiter never queued");
    holder.commit().expect("commit holder");
    waiter
        .join()
        .expect("join")
        .expect("waiter commits after the holder");
}

#[test]
fn nested_transactions_share_their_parent_locks() {
    let (manager, id) = setup(AccessConfig::testing().with_lock_wait_timeout_ms(100));
    let parent = insert_one(&manager, id, Granularity::Table, 1).expect("parent");
    let child = parent.start_nested_user_transaction(false).expect("child");
    let cc = child
        .open_conglomerate(
            id,
            false,
            OpenMode::FOR_UPDATE,
            Granularity::Table,
            IsolationLevel::ReadCommitted,
        )
        .expect("child shares the parent's table lock");
    child.insert(cc, Row::from([Value::Integer(2)])).expect("insert");
    child.commit().expect("commit child");
    parent.commit().expect("commit parent");
}
