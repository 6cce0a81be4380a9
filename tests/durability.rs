use conglomdb::config::AccessConfig;
use conglomdb::error::AccessError;
use conglomdb::locking::Granularity;
use conglomdb::property::validation::ROW_LOCKING;
use conglomdb::raw::image::verify_backup;
use conglomdb::{
    AccessManager, ColumnType, ConglomerateId, ConglomerateProperties, IsolationLevel, OpenMode,
    Row, ScanSpec, Value,
};
use std::path::Path;
use tempfile::tempdir;

fn config_for(dir: &Path) -> AccessConfig {
    AccessConfig::testing().with_data_dir(dir)
}

fn seed(manager: &AccessManager, rows: i64) -> ConglomerateId {
    let tx = manager.get_transaction().expect("tx");
    let id = tx
        .create_conglomerate(
            "heap",
            &[ColumnType::Integer, ColumnType::Text],
            &[],
            &ConglomerateProperties::new(),
            false,
        )
        .expect("create");
    let cc = tx
        .open_conglomerate(
            id,
            false,
            OpenMode::FOR_UPDATE,
            Granularity::Record,
            IsolationLevel::ReadCommitted,
        )
        .expect("open");
    for i in 0..rows {
        tx.insert(cc, Row::from([Value::Integer(i), Value::text(format!("row-{i}"))]))
            .expect("insert");
    }
    tx.commit().expect("commit");
    id
}

fn count_rows(manager: &AccessManager, id: ConglomerateId) -> usize {
    let tx = manager.get_transaction().expect("tx");
    let scan = tx
        .open_scan(
            id,
            false,
            OpenMode::empty(),
            Granularity::Record,
            IsolationLevel::ReadCommitted,
            ScanSpec::full(),
        )
        .expect("scan");
    let rows = tx.fetch_next_group(scan, usize::MAX).expect("rows");
    tx.destroy().expect("destroy");
    rows.len()
}

#[test]
fn shutdown_checkpoint_restores_committed_state() {
    let dir = tempdir().expect("temp");
    let id = {
        let manager = AccessManager::boot(config_for(dir.path())).expect("boot");
        let id = seed(&manager, 25);
        let tx = manager.get_transaction().expect("tx");
        tx.set_property("app.owner", Some(Value::text("ops")), false)
            .expect("set");
        tx.commit().expect("commit");
        tx.destroy().expect("destroy");
        manager.shutdown().expect("shutdown");
        id
    };

    let manager = AccessManager::boot(config_for(dir.path())).expect("reboot");
    assert_eq!(count_rows(&manager, id), 25);
    let tx = manager.get_transaction().expect("tx");
    assert_eq!(
        tx.get_property("app.owner").expect("get"),
        Some(Value::text("ops"))
    );
    let next = tx
        .create_conglomerate("heap", &[ColumnType::Integer], &[], &ConglomerateProperties::new(), false)
        .expect("create after reboot");
    assert!(next.sequence() > id.sequence());
}

#[test]
fn uncommitted_rows_are_not_checkpointed() {
    let dir = tempdir().expect("temp");
    let id = {
        let manager = AccessManager::boot(config_for(dir.path())).expect("boot");
        let id = seed(&manager, 3);
        let tx = manager.get_transaction().expect("tx");
        let cc = tx
            .open_conglomerate(
                id,
                false,
                OpenMode::FOR_UPDATE,
                Granularity::Record,
                IsolationLevel::ReadCommitted,
            )
            .expect("open");
        tx.insert(cc, Row::from([Value::Integer(99), Value::Null]))
            .expect("insert");
        manager.checkpoint().expect("checkpoint");
        tx.abort().expect("abort");
        id
    };
    let manager = AccessManager::boot(config_for(dir.path())).expect("reboot");
    assert_eq!(count_rows(&manager, id), 3);
}

#[test]
fn persistent_row_locking_setting_applies_at_next_boot() {
    let dir = tempdir().expect("temp");
    {
        let manager = AccessManager::boot(config_for(dir.path())).expect("boot");
        assert_eq!(manager.system_granularity(), Granularity::Record);
        let tx = manager.get_transaction().expect("tx");
        tx.set_property(ROW_LOCKING, Some(Value::text("false")), false)
            .expect("set");
        tx.commit().expect("commit");
        tx.destroy().expect("destroy");
        assert_eq!(manager.system_granularity(), Granularity::Record);
    }
    let manager = AccessManager::boot(config_for(dir.path())).expect("reboot");
    assert_eq!(manager.system_granularity(), Granularity::Table);

    let overridden = {
        drop(manager);
        AccessManager::boot(config_for(dir.path()).with_system_property(ROW_LOCKING, "true"))
            .expect("reboot with override")
    };
    assert_eq!(overridden.system_granularity(), Granularity::Record);
}

#[test]
fn backups_verify_and_refuse_in_flight_updates_without_wait() {
    let dir = tempdir().expect("temp");
    let backup_root = tempdir().expect("backup root");
    let manager = AccessManager::boot(config_for(dir.path())).expect("boot");
    let id = seed(&manager, 10);

    let first = backup_root.path().join("b1");
    let manifest = manager.backup(&first, false).expect("backup");
    let (verified, image) = verify_backup(&first).expect("verify");
    assert_eq!(verified, manifest);
    assert!(image.containers.len() >= 2, "property heap plus the seeded heap");

    let tx = manager.get_transaction().expect("tx");
    let cc = tx
        .open_conglomerate(
            id,
            false,
            OpenMode::FOR_UPDATE,
            Granularity::Record,
            IsolationLevel::ReadCommitted,
        )
        .expect("open");
    tx.insert(cc, Row::from([Value::Integer(11), Value::Null]))
        .expect("insert");
    let err = manager
        .backup(&backup_root.path().join("b2"), false)
        .expect_err("update in flight");
    assert!(matches!(err, AccessError::LockTimeout { .. }));
    assert!(err.is_retryable());
    tx.commit().expect("commit");
    manager
        .backup(&backup_root.path().join("b2"), true)
        .expect("backup after commit");
}

#[test]
fn frozen_store_refuses_checkpoints_until_unfrozen() {
    let dir = tempdir().expect("temp");
    let manager = AccessManager::boot(config_for(dir.path())).expect("boot");
    manager.freeze().expect("freeze");
    assert!(matches!(
        manager.checkpoint(),
        Err(AccessError::IllegalState(_))
    ));
    manager.unfreeze().expect("unfreeze");
    manager.checkpoint().expect("checkpoint");
    assert!(dir.path().join(conglomdb::raw::image::IMAGE_FILE).exists());
}

#[test]
fn protected_store_requires_its_boot_password() {
    let dir = tempdir().expect("temp");
    {
        let manager = AccessManager::boot(config_for(dir.path()).with_boot_password("s3cret"))
            .expect("create protected");
        seed(&manager, 1);
    }
    assert!(AccessManager::boot(config_for(dir.path())).is_err());
    assert!(AccessManager::boot(config_for(dir.path()).with_boot_password("guess")).is_err());
    let manager = AccessManager::boot(config_for(dir.path()).with_boot_password("s3cret"))
        .expect("reboot");
    let tx = manager.get_transaction().expect("tx");
    tx.set_property(
        conglomdb::property::secret::BOOT_PASSWORD,
        Some(Value::text("s3cret,rotated")),
        false,
    )
    .expect("rotate");
    tx.commit().expect("commit");
    tx.destroy().expect("destroy");
    drop(manager);
    AccessManager::boot(config_for(dir.path()).with_boot_password("rotated"))
        .expect("boot with rotated password");
}
