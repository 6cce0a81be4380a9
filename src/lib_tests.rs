use super::AccessManager;
use crate::catalog::types::{ColumnOrdering, ColumnType, Row, Value};
use crate::catalog::{ConglomerateId, ConglomerateProperties, HEAP_KIND};
use crate::config::AccessConfig;
use crate::conglomerate::{CompareOp, OpenMode, Qualifier, ScanSpec};
use crate::error::{AccessError, ErrorClass, ResourceType};
use crate::locking::{Granularity, IsolationLevel};
use crate::property::DATABASE_COLLATION;
use crate::property::secret::BOOT_PASSWORD;
use crate::property::validation::{LOCK_WAIT_TIMEOUT, ROW_LOCKING};
use crate::raw::CommitFlags;
use crate::xact::xa::{GlobalXid, XaPrepareOutcome};
use crate::xact::{OpenCount, Transaction};
use std::time::Duration;

fn manager() -> AccessManager {
    AccessManager::boot(AccessConfig::testing()).expect("boot")
}

fn int_row(values: &[i64]) -> Row {
    Row::from_values(values.iter().map(|v| Value::Integer(*v)).collect())
}

fn create_heap(tx: &Transaction, columns: usize, temporary: bool) -> ConglomerateId {
    tx.create_conglomerate(
        "heap",
        &vec![ColumnType::Integer; columns],
        &[],
        &ConglomerateProperties::new(),
        temporary,
    )
    .expect("create heap")
}

fn insert_rows(tx: &Transaction, id: ConglomerateId, rows: &[&[i64]]) {
    let cc = tx
        .open_conglomerate(
            id,
            false,
            OpenMode::FOR_UPDATE,
            Granularity::Record,
            IsolationLevel::Serializable,
        )
        .expect("open for update");
    for row in rows {
        tx.insert(cc, int_row(row)).expect("insert");
    }
    tx.close_conglomerate(cc).expect("close");
}

fn scan_all(tx: &Transaction, id: ConglomerateId) -> Vec<Row> {
    let scan = tx
        .open_scan(
            id,
            false,
            OpenMode::empty(),
            Granularity::Record,
            IsolationLevel::ReadCommitted,
            ScanSpec::full(),
        )
        .expect("open scan");
    let rows = tx.fetch_next_group(scan, usize::MAX).expect("rows");
    tx.close_scan(scan).expect("close scan");
    rows
}

#[test]
fn heap_round_trip_then_drop_is_not_found() {
    let manager = manager();
    let tx = manager.get_transaction().expect("tx");
    let id = create_heap(&tx, 2, false);
    assert!(id.0 >= 0);
    assert_eq!(id.kind_tag(), HEAP_KIND);
    insert_rows(&tx, id, &[&[1, 10]]);
    tx.commit().expect("commit");

    let reader = manager.get_transaction().expect("reader");
    assert_eq!(scan_all(&reader, id), vec![int_row(&[1, 10])]);
    reader.drop_conglomerate(id).expect("drop");
    reader.commit().expect("commit drop");

    let third = manager.get_transaction().expect("third");
    let err = third
        .open_conglomerate(
            id,
            false,
            OpenMode::empty(),
            Granularity::Record,
            IsolationLevel::ReadCommitted,
        )
        .expect_err("dropped");
    assert!(matches!(
        err,
        AccessError::NotFound {
            resource_type: ResourceType::Conglomerate,
            ..
        }
    ));
    assert!(!third.conglomerate_exists(id).expect("exists"));
}

#[test]
fn temporary_conglomerates_are_private_to_their_transaction_family() {
    let manager = manager();
    let owner = manager.get_transaction().expect("owner");
    let other = manager.get_transaction().expect("other");
    let temp = create_heap(&owner, 1, true);
    assert_eq!(temp, ConglomerateId(-1));
    assert_eq!(create_heap(&owner, 1, true), ConglomerateId(-2));

    assert!(matches!(
        other.find_conglomerate(temp),
        Err(AccessError::NotFound { .. })
    ));
    let child = owner.start_nested_user_transaction(false).expect("child");
    assert!(child.conglomerate_exists(temp).expect("visible"));
    insert_rows(&child, temp, &[&[7]]);
    assert_eq!(scan_all(&owner, temp), vec![int_row(&[7])]);
}

#[test]
fn nested_abort_poisons_the_parent_until_it_aborts() {
    let manager = manager();
    let parent = manager.get_transaction().expect("parent");
    let id = create_heap(&parent, 1, false);
    parent.commit().expect("commit");

    let child = parent.start_nested_user_transaction(false).expect("child");
    assert!(matches!(
        child.start_nested_user_transaction(false),
        Err(AccessError::ProtocolViolation(_))
    ));
    insert_rows(&child, id, &[&[1]]);
    child.abort().expect("abort child");

    let err = parent
        .open_conglomerate(
            id,
            false,
            OpenMode::empty(),
            Granularity::Record,
            IsolationLevel::ReadCommitted,
        )
        .expect_err("parent aborted");
    assert!(matches!(err, AccessError::TransactionAborted));
    assert_eq!(err.class(), ErrorClass::Protocol);
    assert!(matches!(parent.commit(), Err(AccessError::TransactionAborted)));

    parent.abort().expect("acknowledge");
    assert!(scan_all(&parent, id).is_empty());
}

#[test]
fn commit_keeps_held_handles_and_abort_closes_everything() {
    let manager = manager();
    let tx = manager.get_transaction().expect("tx");
    let id = create_heap(&tx, 1, false);
    insert_rows(&tx, id, &[&[1], &[2]]);
    tx.commit().expect("commit");

    let _plain = tx
        .open_conglomerate(id, false, OpenMode::empty(), Granularity::Record, IsolationLevel::ReadCommitted)
        .expect("plain");
    let held = tx
        .open_scan(
            id,
            true,
            OpenMode::empty(),
            Granularity::Record,
            IsolationLevel::ReadCommitted,
            ScanSpec::full(),
        )
        .expect("held scan");
    assert_eq!(tx.count_opens(OpenCount::Total), 2);
    tx.commit().expect("commit");
    assert_eq!(tx.count_opens(OpenCount::Conglomerates), 0);
    assert_eq!(tx.count_opens(OpenCount::Scans), 1);
    assert_eq!(tx.fetch_next(held).expect("next"), Some(int_row(&[1])));
    assert!(tx.debug_opened().contains("held=true"));

    tx.abort().expect("abort");
    assert_eq!(tx.count_opens(OpenCount::Total), 0);
    assert!(matches!(
        tx.fetch_next(held),
        Err(AccessError::NotFound {
            resource_type: ResourceType::Scan,
            ..
        })
    ));
}

#[test]
fn sorts_survive_commit_and_feed_a_load() {
    let manager = manager();
    let tx = manager.get_transaction().expect("tx");
    let sort = tx
        .create_sort(None, &[ColumnType::Integer], &[ColumnOrdering::asc(0)], true)
        .expect("sort");
    let sc = tx.open_sort(sort).expect("sort controller");
    for v in [3, 1, 2, 3] {
        tx.sort_insert(sc, int_row(&[v])).expect("insert");
    }
    tx.commit().expect("commit completes sort controllers");
    assert_eq!(tx.count_opens(OpenCount::SortControllers), 0);
    assert_eq!(tx.count_opens(OpenCount::CreatedSorts), 1);
    assert!(matches!(
        tx.sort_insert(sc, int_row(&[4])),
        Err(AccessError::NotFound { .. })
    ));

    let rows = tx.open_sort_row_source(sort).expect("row source");
    let (id, loaded) = tx
        .create_and_load_conglomerate(
            "heap",
            &[ColumnType::Integer],
            &[],
            &ConglomerateProperties::new(),
            false,
            rows,
        )
        .expect("load");
    assert_eq!(loaded, 3);
    assert_eq!(scan_all(&tx, id), vec![int_row(&[1]), int_row(&[2]), int_row(&[3])]);

    let scan = tx.open_sort_scan(sort, false).expect("sort scan");
    assert!(matches!(
        tx.fetch_next_located(scan),
        Err(AccessError::Unsupported { .. })
    ));
    tx.abort().expect("abort");
    assert_eq!(tx.count_opens(OpenCount::CreatedSorts), 0);
    assert!(matches!(
        tx.open_sort_scan(sort, false),
        Err(AccessError::NotFound {
            resource_type: ResourceType::Sort,
            ..
        })
    ));
}

#[test]
fn dropped_sort_ids_are_reused() {
    let manager = manager();
    let tx = manager.get_transaction().expect("tx");
    let first = tx
        .create_sort(None, &[ColumnType::Integer], &[ColumnOrdering::asc(0)], false)
        .expect("first");
    let second = tx
        .create_sort(None, &[ColumnType::Integer], &[ColumnOrdering::desc(0)], false)
        .expect("second");
    assert_ne!(first, second);
    tx.drop_sort(first).expect("drop");
    assert!(matches!(tx.drop_sort(first), Err(AccessError::NotFound { .. })));
    let third = tx
        .create_sort(None, &[ColumnType::Integer], &[ColumnOrdering::asc(0)], false)
        .expect("third");
    assert_eq!(third, first);
    assert!(tx.create_sort(Some("no such sort"), &[], &[], false).is_err());
}

#[test]
fn recreate_and_load_keeps_the_original_when_nothing_loaded() {
    let manager = manager();
    let tx = manager.get_transaction().expect("tx");
    let original = create_heap(&tx, 1, false);
    let kept = tx
        .recreate_and_load_conglomerate(
            "heap",
            false,
            &[ColumnType::Integer],
            &[],
            &ConglomerateProperties::new(),
            false,
            original,
            std::iter::empty::<Result<Row, AccessError>>(),
        )
        .expect("recreate");
    assert_eq!(kept, original);

    let replaced = tx
        .recreate_and_load_conglomerate(
            "heap",
            false,
            &[ColumnType::Integer],
            &[],
            &ConglomerateProperties::new(),
            false,
            original,
            vec![Ok(int_row(&[5]))],
        )
        .expect("recreate");
    assert_ne!(replaced, original);
    assert_eq!(scan_all(&tx, replaced), vec![int_row(&[5])]);
}

#[test]
fn add_column_is_forgotten_when_the_transaction_aborts() {
    let manager = manager();
    let setup = manager.get_transaction().expect("setup");
    let id = create_heap(&setup, 2, false);
    insert_rows(&setup, id, &[&[1, 2]]);
    setup.commit().expect("commit");

    let alter = manager.get_transaction().expect("alter");
    alter
        .add_column_to_conglomerate(id, 2, ColumnType::Integer)
        .expect("add column");
    assert_eq!(alter.find_conglomerate(id).expect("find").template().len(), 3);
    assert_eq!(
        scan_all(&alter, id),
        vec![Row::from([Value::Integer(1), Value::Integer(2), Value::Null])]
    );
    let generation = manager.cache_stats().generation;
    alter.abort().expect("abort");
    assert!(manager.cache_stats().generation > generation);

    let after = manager.get_transaction().expect("after");
    assert_eq!(after.find_conglomerate(id).expect("find").template().len(), 2);
}

#[test]
fn ordered_indexes_do_not_support_add_column() {
    let manager = manager();
    let tx = manager.get_transaction().expect("tx");
    let id = tx
        .create_conglomerate(
            "btree",
            &[ColumnType::Integer, ColumnType::Text],
            &[ColumnOrdering::asc(0)],
            &ConglomerateProperties::new(),
            false,
        )
        .expect("btree");
    let err = tx
        .add_column_to_conglomerate(id, 2, ColumnType::Integer)
        .expect_err("unsupported");
    assert_eq!(err.class(), ErrorClass::Unsupported);
    assert!(matches!(
        tx.create_conglomerate("hash", &[ColumnType::Integer], &[], &ConglomerateProperties::new(), false),
        Err(AccessError::NotFound {
            resource_type: ResourceType::Factory,
            ..
        })
    ));
}

#[test]
fn id_collisions_are_retried_with_a_fresh_id() {
    let manager = manager();
    let tx = manager.get_transaction().expect("tx");
    let first = create_heap(&tx, 1, false);
    let squatted = ConglomerateId::encode(HEAP_KIND, first.sequence() + 1).expect("id");
    let mut raw = manager.shared.raw.start_internal_transaction().expect("raw");
    raw.create_container(squatted.persistent_container(), Vec::new())
        .expect("squat");
    raw.commit(CommitFlags::RELEASE_LOCKS).expect("commit");

    let second = create_heap(&tx, 1, false);
    assert_eq!(second.sequence(), first.sequence() + 2);
}

#[test]
fn qualified_scans_delete_in_place() {
    let manager = manager();
    let tx = manager.get_transaction().expect("tx");
    let id = create_heap(&tx, 2, false);
    insert_rows(&tx, id, &[&[1, 100], &[2, 200], &[3, 300]]);
    let scan = tx
        .open_scan(
            id,
            false,
            OpenMode::FOR_UPDATE,
            Granularity::Record,
            IsolationLevel::Serializable,
            ScanSpec::full().with_and(vec![Qualifier::new(1, CompareOp::Ge, 200i64)]),
        )
        .expect("scan");
    while tx.fetch_next(scan).expect("next").is_some() {
        assert!(tx.delete_current(scan).expect("delete"));
    }
    tx.close_scan(scan).expect("close");
    assert_eq!(scan_all(&tx, id), vec![int_row(&[1, 100])]);

    let group = tx
        .open_group_fetch_scan(
            id,
            false,
            OpenMode::empty(),
            Granularity::Record,
            IsolationLevel::ReadCommitted,
            ScanSpec::full(),
        )
        .expect("group scan");
    assert!(matches!(tx.fetch_next(group), Err(AccessError::Unsupported { .. })));
    assert_eq!(tx.fetch_next_group(group, 10).expect("group").len(), 1);
}

#[test]
fn savepoint_rollback_closes_controllers_on_request() {
    let manager = manager();
    let tx = manager.get_transaction().expect("tx");
    let id = create_heap(&tx, 1, false);
    insert_rows(&tx, id, &[&[1]]);
    tx.set_savepoint("sp1").expect("savepoint");
    insert_rows(&tx, id, &[&[2]]);
    let _open = tx
        .open_conglomerate(id, true, OpenMode::empty(), Granularity::Record, IsolationLevel::ReadCommitted)
        .expect("held");
    tx.rollback_to_savepoint("sp1", true).expect("rollback");
    assert_eq!(tx.count_opens(OpenCount::Total), 0);
    assert_eq!(scan_all(&tx, id), vec![int_row(&[1])]);
    assert!(matches!(
        tx.rollback_to_savepoint("missing", false),
        Err(AccessError::NotFound {
            resource_type: ResourceType::Savepoint,
            ..
        })
    ));
}

#[test]
fn global_transactions_commit_through_two_phase_protocol() {
    let manager = manager();
    let setup = manager.get_transaction().expect("setup");
    let id = create_heap(&setup, 1, false);
    setup.commit().expect("commit");

    let xid = GlobalXid::new(7, b"gtx-1".to_vec(), b"b1".to_vec()).expect("xid");
    let global = manager.start_xa_transaction(xid.clone()).expect("xa");
    assert!(global.is_global());
    assert!(matches!(
        manager.start_xa_transaction(xid.clone()),
        Err(AccessError::AlreadyExists {
            resource_type: ResourceType::GlobalTransaction,
            ..
        })
    ));
    insert_rows(&global, id, &[&[9]]);
    assert!(matches!(global.commit(), Err(AccessError::ProtocolViolation(_))));
    assert_eq!(global.xa_prepare().expect("prepare"), XaPrepareOutcome::Prepared);
    global.xa_commit(false).expect("commit");

    let reader = manager.get_transaction().expect("reader");
    assert_eq!(scan_all(&reader, id), vec![int_row(&[9])]);
}

#[test]
fn read_only_global_transactions_commit_and_stay_bound() {
    let manager = manager();
    let tx = manager.get_transaction().expect("local");
    let id = create_heap(&tx, 1, false);
    tx.commit().expect("commit");
    let xid = GlobalXid::new(1, b"local-to-global".to_vec(), Vec::new()).expect("xid");
    tx.create_xa_transaction_from_local(xid).expect("convert");
    assert!(tx.is_global());
    scan_all(&tx, id);
    tx.commit().expect("read-only global commit");
    assert!(tx.is_global());
    assert_eq!(tx.xa_prepare().expect("prepare"), XaPrepareOutcome::ReadOnly);
    assert!(!tx.is_global());
}

#[test]
fn property_writer_sees_its_own_changes_and_readers_see_committed_ones() {
    let manager = manager();
    let early_reader = manager.get_transaction().expect("reader");
    assert_eq!(early_reader.get_property("app.colour").expect("get"), None);

    let writer = manager.get_transaction().expect("writer");
    writer
        .set_property("app.colour", Some(Value::text("blue")), false)
        .expect("set");
    assert_eq!(
        writer.get_property("app.colour").expect("own write"),
        Some(Value::text("blue"))
    );
    assert_eq!(early_reader.get_property("app.colour").expect("cached"), None);
    writer.commit().expect("commit");

    let late_reader = manager.get_transaction().expect("late");
    assert_eq!(
        late_reader.get_property("app.colour").expect("refreshed"),
        Some(Value::text("blue"))
    );
}

#[test]
fn property_readers_do_not_wait_behind_an_open_writer() {
    let manager = manager();
    let first = manager.get_transaction().expect("first writer");
    first
        .set_property("app.a", Some(Value::text("1")), false)
        .expect("set a");
    first.commit().expect("commit a");

    let second = manager.get_transaction().expect("second writer");
    second
        .set_property("app.b", Some(Value::text("2")), false)
        .expect("set b");

    let reader = manager.get_transaction().expect("reader");
    assert_eq!(
        reader.get_property("app.a").expect("committed value without waiting"),
        Some(Value::text("1"))
    );
    assert_eq!(reader.get_property("app.b").expect("uncommitted hidden"), None);
    assert!(reader.get_properties().expect("all").contains_key("app.a"));

    second.commit().expect("commit b");
    assert_eq!(
        reader.get_property("app.b").expect("after commit"),
        Some(Value::text("2"))
    );
}

#[test]
fn defaults_show_through_until_a_value_is_set() {
    let manager = manager();
    let tx = manager.get_transaction().expect("tx");
    tx.set_property_default("app.mode", Some(Value::text("fast")))
        .expect("default");
    assert!(tx.property_default_is_visible("app.mode").expect("visible"));
    assert_eq!(tx.get_property("app.mode").expect("get"), Some(Value::text("fast")));
    tx.set_property("app.mode", Some(Value::text("safe")), false)
        .expect("set");
    assert!(!tx.property_default_is_visible("app.mode").expect("shadowed"));
    assert_eq!(
        tx.get_property_default("app.mode").expect("default"),
        Some(Value::text("fast"))
    );
    let all = tx.get_properties().expect("all");
    assert_eq!(all.get("app.mode"), Some(&Value::text("safe")));
    tx.set_property("app.mode", None, false).expect("remove");
    assert_eq!(tx.get_property("app.mode").expect("get"), Some(Value::text("fast")));
}

#[test]
fn property_callbacks_validate_and_apply_after_commit() {
    let manager = manager();
    let tx = manager.get_transaction().expect("tx");
    assert!(matches!(
        tx.set_property(ROW_LOCKING, Some(Value::text("sometimes")), false),
        Err(AccessError::Validation(_))
    ));
    assert_eq!(tx.get_property(ROW_LOCKING).expect("get"), None);

    let before = manager.lock_manager().wait_timeout();
    tx.set_property(LOCK_WAIT_TIMEOUT, Some(Value::text("7")), false)
        .expect("set timeout");
    assert_eq!(manager.lock_manager().wait_timeout(), before);
    assert_eq!(
        tx.get_property(LOCK_WAIT_TIMEOUT).expect("mapped"),
        Some(Value::Integer(7))
    );
    tx.commit().expect("commit");
    assert_eq!(manager.lock_manager().wait_timeout(), Duration::from_secs(7));
}

#[test]
fn service_properties_bypass_the_property_conglomerate() {
    let manager = manager();
    let tx = manager.get_transaction().expect("tx");
    tx.set_property(DATABASE_COLLATION, Some(Value::text("UCS_BASIC")), false)
        .expect("set");
    assert_eq!(
        manager.shared.raw.service_property(DATABASE_COLLATION).as_deref(),
        Some("UCS_BASIC")
    );
    assert!(!tx.get_properties().expect("all").contains_key(DATABASE_COLLATION));
    assert!(matches!(
        tx.set_property(BOOT_PASSWORD, Some(Value::text("a,b")), false),
        Err(AccessError::Validation(_))
    ));
}

#[test]
fn system_row_locking_override_promotes_to_table_locks() {
    let table_locked = AccessManager::boot(
        AccessConfig::testing().with_system_property(ROW_LOCKING, "false"),
    )
    .expect("boot");
    assert_eq!(table_locked.system_granularity(), Granularity::Table);
    assert_eq!(manager().system_granularity(), Granularity::Record);
    assert!(AccessManager::boot(AccessConfig::testing().with_system_property(ROW_LOCKING, "no")).is_err());
}

#[test]
fn destroyed_transactions_reject_further_work() {
    let manager = manager();
    let tx = manager.get_transaction().expect("tx");
    let temp = create_heap(&tx, 1, true);
    tx.destroy().expect("destroy");
    assert!(tx.is_destroyed());
    assert!(matches!(
        tx.find_conglomerate(temp),
        Err(AccessError::TransactionClosed)
    ));
    assert!(matches!(tx.commit(), Err(AccessError::TransactionClosed)));
    tx.destroy().expect("second destroy is a no-op");
}

#[test]
fn shutdown_is_final() {
    let manager = manager();
    manager.shutdown().expect("shutdown");
    assert!(matches!(
        manager.get_transaction(),
        Err(AccessError::IllegalState(_))
    ));
    manager.shutdown().expect("idempotent");
}
