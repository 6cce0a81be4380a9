pub mod secret;
pub mod validation;

use crate::cache::ConglomerateCache;
use crate::catalog::types::{ColumnType, Row, Value};
use crate::catalog::{ConglomerateId, ConglomerateProperties, HEAP_KIND};
use crate::config::AccessConfig;
use crate::conglomerate::heap::HEAP_IMPLEMENTATION;
use crate::conglomerate::{
    CompareOp, Conglomerate, OpenContext, OpenMode, Qualifier, ScanController, ScanSpec,
};
use crate::error::{AccessError, ResourceType};
use crate::locking::lock_manager::{LockMode, Lockable, WaitPolicy};
use crate::locking::{Granularity, IsolationLevel, LockingPolicy};
use crate::raw::{CommitFlags, RawStore, RawTransaction};
use crate::registry::ConglomerateRegistry;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};
use validation::{PropertySetCallback, PropertyValidation};

pub type PropertyMap = BTreeMap<String, Value>;

pub const PROPERTIES_ID: &str = "conglomdb.storage.propertiesId";
pub const SERVICE_PROTOCOL: &str = "conglomdb.serviceProtocol";
pub const DATABASE_COLLATION: &str = "conglomdb.database.collation";
pub const LOG_DEVICE_WHEN_BACKED_UP: &str = "conglomdb.storage.logDeviceWhenBackedUp";
/// Key of the row holding the defaults map.
pub const DEFAULTS_ROW_KEY: &str = "conglomdb.defaultPropertyName";
const STORE_LOCK_NAME: &str = "property-store";

/// Keys kept in the raw store's service map instead of the property
/// conglomerate.
static SERVICE_PROPERTIES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        SERVICE_PROTOCOL,
        PROPERTIES_ID,
        secret::ENCRYPTED_BOOT_PASSWORD,
        DATABASE_COLLATION,
        LOG_DEVICE_WHEN_BACKED_UP,
    ]
    .into_iter()
    .collect()
});

pub fn is_service_property(key: &str) -> bool {
    SERVICE_PROPERTIES.contains(key)
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    values: PropertyMap,
    defaults: PropertyMap,
}

impl Snapshot {
    /// Defaults overlaid by concrete values.
    fn effective(&self) -> PropertyMap {
        let mut out = self.defaults.clone();
        out.extend(self.values.iter().map(|(k, v)| (k.clone(), v.clone())));
        out
    }
}

#[derive(Default)]
struct SnapshotCache {
    snapshot: Option<Arc<Snapshot>>,
    generation: u64,
}

/// Transactional key/value properties stored as rows of a heap. Writers
/// serialize on one exclusive lock held to transaction end; everyone else
/// reads a shared snapshot that is dropped whenever that lock is released.
pub struct PropertyStore {
    conglomerate: Arc<dyn Conglomerate>,
    raw_store: Arc<dyn RawStore>,
    validation: PropertyValidation,
    system_properties: BTreeMap<String, String>,
    cache: Arc<Mutex<SnapshotCache>>,
}

impl PropertyStore {
    /// Finds the property conglomerate through the service map, creating it
    /// on first boot.
    pub fn boot(
        raw_store: Arc<dyn RawStore>,
        registry: &ConglomerateRegistry,
        cache: &ConglomerateCache,
        config: &AccessConfig,
    ) -> Result<Self, AccessError> {
        let conglomerate = match raw_store.service_property(PROPERTIES_ID) {
            Some(stored) => {
                let id = stored.trim().parse::<i64>().map_err(|_| {
                    AccessError::Corrupt(format!("{PROPERTIES_ID} is not an id: '{stored}'"))
                })?;
                cache.find(ConglomerateId(id), registry, raw_store.as_ref())?
            }
            None => {
                if raw_store.is_read_only() {
                    return Err(AccessError::ReadOnly);
                }
                let created = create_property_conglomerate(raw_store.as_ref(), registry)?;
                raw_store.set_service_property(PROPERTIES_ID, Some(created.id().to_string()))?;
                cache.add_entry(Arc::clone(&created))?;
                info!(conglomerate = %created.id(), "property conglomerate created");
                created
            }
        };

        let snapshots = Arc::new(Mutex::new(SnapshotCache::default()));
        let observed = Arc::clone(&snapshots);
        raw_store.lock_manager().add_release_observer(
            store_lock(),
            Arc::new(move |_released: &Lockable| {
                let mut cache = observed.lock();
                cache.snapshot = None;
                cache.generation += 1;
            }),
        );

        Ok(Self {
            conglomerate,
            raw_store,
            validation: PropertyValidation::new(),
            system_properties: config.system_properties.clone(),
            cache: snapshots,
        })
    }

    pub fn conglomerate_id(&self) -> ConglomerateId {
        self.conglomerate.id()
    }

    pub fn add_callback(&self, callback: Arc<dyn PropertySetCallback>) {
        self.validation.add_callback(callback);
    }

    pub fn holds_update_lock(&self, raw: &dyn RawTransaction) -> bool {
        raw.is_lock_held(&store_lock(), LockMode::Exclusive)
    }

    /// Takes the exclusive update lock until the transaction ends.
    pub fn lock(&self, raw: &mut dyn RawTransaction) -> Result<(), AccessError> {
        raw.lock_object(None, &store_lock(), LockMode::Exclusive, WaitPolicy::Timed)
    }

    pub fn get(&self, raw: &mut dyn RawTransaction, key: &str) -> Result<Option<Value>, AccessError> {
        if is_service_property(key) {
            return Ok(self.raw_store.service_property(key).map(Value::text));
        }
        let snapshot = self.snapshot(raw)?;
        Ok(snapshot
            .values
            .get(key)
            .or_else(|| snapshot.defaults.get(key))
            .cloned())
    }

    pub fn get_default(&self, raw: &mut dyn RawTransaction, key: &str) -> Result<Option<Value>, AccessError> {
        if is_service_property(key) {
            return Ok(None);
        }
        Ok(self.snapshot(raw)?.defaults.get(key).cloned())
    }

    pub fn get_properties(&self, raw: &mut dyn RawTransaction) -> Result<PropertyMap, AccessError> {
        Ok(self.snapshot(raw)?.effective())
    }

    /// Locks the store and reports whether `key` has no concrete value, so
    /// that its default is what readers see.
    pub fn property_default_is_visible(
        &self,
        raw: &mut dyn RawTransaction,
        key: &str,
    ) -> Result<bool, AccessError> {
        self.lock(raw)?;
        Ok(!self.read_direct(raw)?.values.contains_key(key))
    }

    /// Sets or, with `None`, removes a property. Removal validates and
    /// applies the default, then stores the removal.
    pub fn set(
        &self,
        raw: &mut dyn RawTransaction,
        key: &str,
        value: Option<Value>,
        db_only: bool,
    ) -> Result<(), AccessError> {
        if key == secret::BOOT_PASSWORD {
            let Some(request) = value.as_ref().and_then(Value::as_text) else {
                return Err(AccessError::Validation(format!(
                    "{key} must be given as 'old,new'"
                )));
            };
            return secret::change_boot_password(self.raw_store.as_ref(), request);
        }

        self.lock(raw)?;
        let snapshot = self.read_direct(raw)?;
        let proposed = value.clone().or_else(|| snapshot.defaults.get(key).cloned());
        let apply = db_only || !self.system_properties.contains_key(key);
        let change =
            self.validation
                .validate_apply_and_map(key, proposed, &snapshot.effective(), apply)?;
        let to_save = value.and(change.value);

        if is_service_property(key) {
            let text = to_save.map(|v| match v {
                Value::Text(s) => s.to_string(),
                other => other.to_string(),
            });
            self.raw_store.set_service_property(key, text)?;
        } else {
            let bytes = to_save.as_ref().map(encode_value).transpose()?;
            self.save_row(raw, key, bytes)?;
        }
        for work in change.post_commit {
            raw.add_post_commit_work(work);
        }
        debug!(key, db_only, "property set");
        Ok(())
    }

    /// Sets or removes the default for `key`. While a concrete value shadows
    /// the default, the default is only validated against the other
    /// defaults and nothing is applied.
    pub fn set_default(
        &self,
        raw: &mut dyn RawTransaction,
        key: &str,
        value: Option<Value>,
    ) -> Result<(), AccessError> {
        self.lock(raw)?;
        let snapshot = self.read_direct(raw)?;
        let mut post_commit = Vec::new();
        let to_save = if snapshot.values.contains_key(key) {
            self.validation
                .validate_only(key, value.as_ref(), &snapshot.defaults)?;
            value
        } else {
            let change =
                self.validation
                    .validate_apply_and_map(key, value, &snapshot.effective(), true)?;
            post_commit = change.post_commit;
            change.value
        };

        let mut defaults = snapshot.defaults;
        match to_save {
            Some(v) => defaults.insert(key.to_string(), v),
            None => defaults.remove(key),
        };
        let bytes = rmp_serde::to_vec(&defaults).map_err(|e| AccessError::Encode(e.to_string()))?;
        self.save_row(raw, DEFAULTS_ROW_KEY, Some(bytes))?;
        for work in post_commit {
            raw.add_post_commit_work(work);
        }
        debug!(key, "property default set");
        Ok(())
    }

    fn snapshot(&self, raw: &mut dyn RawTransaction) -> Result<Arc<Snapshot>, AccessError> {
        if self.holds_update_lock(raw) {
            return Ok(Arc::new(self.read_direct(raw)?));
        }
        let generation = {
            let cache = self.cache.lock();
            if let Some(snapshot) = &cache.snapshot {
                return Ok(Arc::clone(snapshot));
            }
            cache.generation
        };
        let read = Arc::new(self.read_committed()?);
        let mut cache = self.cache.lock();
        if cache.generation == generation {
            cache.snapshot = Some(Arc::clone(&read));
        }
        Ok(read)
    }

    /// Committed rows only, so a reader never waits on an open writer.
    fn read_committed(&self) -> Result<Snapshot, AccessError> {
        let container = self.conglomerate.container();
        let rows = self
            .raw_store
            .committed_rows(container)?
            .ok_or_else(|| AccessError::not_found(ResourceType::Container, container))?;
        let mut snapshot = Snapshot::default();
        for row in &rows {
            absorb_row(&mut snapshot, row)?;
        }
        Ok(snapshot)
    }

    /// Read by the holder of the update lock, seeing its own changes.
    fn read_direct(&self, raw: &mut dyn RawTransaction) -> Result<Snapshot, AccessError> {
        let ctx = OpenContext {
            hold: false,
            mode: OpenMode::empty(),
            policy: write_policy(),
            lock_group: raw.new_lock_group(),
        };
        let mut scan = self.conglomerate.open_scan(raw, ctx, ScanSpec::full())?;
        let mut snapshot = Snapshot::default();
        let filled = fill_snapshot(scan.as_mut(), raw, &mut snapshot);
        scan.close(raw)?;
        filled.map(|()| snapshot)
    }

    /// Upsert by scan: replace or delete the row for `key` in place, else
    /// insert a new one.
    fn save_row(
        &self,
        raw: &mut dyn RawTransaction,
        key: &str,
        bytes: Option<Vec<u8>>,
    ) -> Result<(), AccessError> {
        let ctx = OpenContext {
            hold: false,
            mode: OpenMode::FOR_UPDATE,
            policy: write_policy(),
            lock_group: raw.new_lock_group(),
        };
        let spec = ScanSpec::full().with_and(vec![Qualifier::new(0, CompareOp::Eq, key)]);
        let mut scan = self.conglomerate.open_scan(raw, ctx, spec)?;
        let found = match scan.next(raw) {
            Ok(found) => found.is_some(),
            Err(e) => {
                scan.close(raw)?;
                return Err(e);
            }
        };
        let outcome = match (&bytes, found) {
            (Some(b), true) => scan.replace_current(raw, property_row(key, b.clone())).map(|_| ()),
            (None, true) => scan.delete_current(raw).map(|_| ()),
            (_, false) => Ok(()),
        };
        scan.close(raw)?;
        outcome?;

        if let (Some(b), false) = (bytes, found) {
            let ctx = OpenContext {
                lock_group: raw.new_lock_group(),
                ..ctx
            };
            let mut controller = self.conglomerate.open(raw, ctx)?;
            let inserted = controller.insert(raw, property_row(key, b));
            controller.close(raw)?;
            inserted?;
        }
        Ok(())
    }
}

fn fill_snapshot(
    scan: &mut dyn ScanController,
    raw: &mut dyn RawTransaction,
    snapshot: &mut Snapshot,
) -> Result<(), AccessError> {
    while let Some((_, row)) = scan.next(raw)? {
        absorb_row(snapshot, &row)?;
    }
    Ok(())
}

fn absorb_row(snapshot: &mut Snapshot, row: &Row) -> Result<(), AccessError> {
    let (key, bytes) = split_row(row)?;
    if key == DEFAULTS_ROW_KEY {
        snapshot.defaults =
            rmp_serde::from_slice(bytes).map_err(|e| AccessError::Decode(e.to_string()))?;
    } else {
        snapshot.values.insert(key.to_string(), decode_value(bytes)?);
    }
    Ok(())
}

fn store_lock() -> Lockable {
    Lockable::Named(STORE_LOCK_NAME.to_string())
}

fn write_policy() -> LockingPolicy {
    LockingPolicy::new(Granularity::Table, IsolationLevel::Serializable)
}

fn property_row(key: &str, bytes: Vec<u8>) -> Row {
    Row::from([Value::text(key), Value::Blob(bytes)])
}

fn split_row(row: &Row) -> Result<(&str, &[u8]), AccessError> {
    match (
        row.get(0).and_then(Value::as_text),
        row.get(1).and_then(Value::as_blob),
    ) {
        (Some(key), Some(bytes)) => Ok((key, bytes)),
        _ => Err(AccessError::Corrupt("malformed property row".into())),
    }
}

fn encode_value(value: &Value) -> Result<Vec<u8>, AccessError> {
    rmp_serde::to_vec(value).map_err(|e| AccessError::Encode(e.to_string()))
}

fn decode_value(bytes: &[u8]) -> Result<Value, AccessError> {
    rmp_serde::from_slice(bytes).map_err(|e| AccessError::Decode(e.to_string()))
}

fn create_property_conglomerate(
    raw_store: &dyn RawStore,
    registry: &ConglomerateRegistry,
) -> Result<Arc<dyn Conglomerate>, AccessError> {
    let factory = registry.conglomerate_factory(HEAP_IMPLEMENTATION)?;
    let id = registry.next_identifier(HEAP_KIND, || raw_store.max_container_id())?;
    let mut raw = raw_store.start_internal_transaction()?;
    let created = factory.create(
        raw.as_mut(),
        id,
        id.persistent_container(),
        &[ColumnType::Text, ColumnType::Blob],
        &[],
        &ConglomerateProperties::new(),
    );
    match created {
        Ok(conglomerate) => {
            raw.commit(CommitFlags::empty())?;
            Ok(conglomerate)
        }
        Err(e) => {
            raw.abort()?;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DEFAULTS_ROW_KEY, PROPERTIES_ID, PropertyStore, SERVICE_PROTOCOL, is_service_property};
    use crate::cache::ConglomerateCache;
    use crate::catalog::types::Value;
    use crate::config::AccessConfig;
    use crate::conglomerate::heap::HeapFactory;
    use crate::raw::memory::MemoryRawStore;
    use crate::raw::{CommitFlags, RawStore};
    use crate::registry::{AccessMethod, ConglomerateRegistry};
    use std::sync::Arc;
    use std::time::Duration;

    fn boot() -> (Arc<dyn RawStore>, PropertyStore) {
        let store: Arc<dyn RawStore> = Arc::new(MemoryRawStore::in_memory(Duration::from_millis(150)));
        let registry = ConglomerateRegistry::new();
        registry
            .register(AccessMethod::Conglomerate(Arc::new(HeapFactory)))
            .expect("heap");
        let cache = ConglomerateCache::new(8);
        let props = PropertyStore::boot(Arc::clone(&store), &registry, &cache, &AccessConfig::testing())
            .expect("boot");
        (store, props)
    }

    #[test]
    fn boot_records_the_conglomerate_in_the_service_map() {
        let (store, props) = boot();
        assert_eq!(
            store.service_property(PROPERTIES_ID),
            Some(props.conglomerate_id().to_string())
        );
        assert!(is_service_property(SERVICE_PROTOCOL));
        assert!(!is_service_property(DEFAULTS_ROW_KEY));
    }

    #[test]
    fn values_shadow_defaults_and_removal_reveals_them() {
        let (store, props) = boot();
        let mut raw = store.start_user_transaction(false).expect("txn");
        props
            .set_default(raw.as_mut(), "app.mode", Some(Value::text("safe")))
            .expect("default");
        assert_eq!(props.get(raw.as_mut(), "app.mode").expect("get"), Some(Value::text("safe")));
        props
            .set(raw.as_mut(), "app.mode", Some(Value::text("fast")), true)
            .expect("set");
        assert_eq!(props.get(raw.as_mut(), "app.mode").expect("get"), Some(Value::text("fast")));
        assert!(!props.property_default_is_visible(raw.as_mut(), "app.mode").expect("visible"));
        props.set(raw.as_mut(), "app.mode", None, true).expect("remove");
        assert!(props.property_default_is_visible(raw.as_mut(), "app.mode").expect("visible"));
        assert_eq!(props.get(raw.as_mut(), "app.mode").expect("get"), Some(Value::text("safe")));
        assert_eq!(
            props.get_default(raw.as_mut(), "app.mode").expect("default"),
            Some(Value::text("safe"))
        );
        raw.commit(CommitFlags::empty()).expect("commit");
    }

    #[test]
    fn service_properties_bypass_the_conglomerate() {
        let (store, props) = boot();
        let mut raw = store.start_user_transaction(false).expect("txn");
        props
            .set(raw.as_mut(), SERVICE_PROTOCOL, Some(Value::text("2")), true)
            .expect("set");
        raw.abort().expect("abort");
        assert_eq!(store.service_property(SERVICE_PROTOCOL), Some("2".to_string()));
        let mut raw = store.start_user_transaction(false).expect("txn");
        assert!(props.get_properties(raw.as_mut()).expect("all").is_empty());
    }
}
