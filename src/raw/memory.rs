use crate::catalog::types::Row;
use crate::catalog::{ContainerKey, TEMPORARY_SEGMENT};
use crate::error::{AccessError, ResourceType};
use crate::locking::lock_manager::{
    CompatibilitySpace, LockGroup, LockManager, LockMode, Lockable, WaitPolicy,
};
use crate::raw::image::{
    BackupManifest, ContainerImage, StoreImage, load_image_if_present, write_backup, write_image,
};
use crate::raw::{
    CommitFlags, KeyRange, PostCommitWork, RawStore, RawTransaction, range_is_empty,
};
use crate::storage::encoded_key::EncodedKey;
use crate::xact::xa::{GlobalXid, XaPrepareOutcome, XaState};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
struct Container {
    metadata: Vec<u8>,
    rows: im::OrdMap<EncodedKey, Row>,
    next_record_id: u64,
}

#[derive(Default)]
struct StoreState {
    live: HashMap<ContainerKey, Container>,
    /// Persistent containers as of the last commit touching them.
    committed: HashMap<ContainerKey, Container>,
    max_container_id: i64,
    service_properties: BTreeMap<String, String>,
    globals: HashSet<GlobalXid>,
}

impl StoreState {
    fn live_mut(&mut self, key: ContainerKey) -> Result<&mut Container, AccessError> {
        self.live
            .get_mut(&key)
            .ok_or_else(|| AccessError::not_found(ResourceType::Container, key))
    }

    fn live(&self, key: ContainerKey) -> Result<&Container, AccessError> {
        self.live
            .get(&key)
            .ok_or_else(|| AccessError::not_found(ResourceType::Container, key))
    }

    fn image(&self) -> StoreImage {
        let mut containers: Vec<ContainerImage> = self
            .committed
            .iter()
            .map(|(key, c)| ContainerImage {
                key: *key,
                metadata: c.metadata.clone(),
                next_record_id: c.next_record_id,
                rows: c.rows.iter().map(|(k, r)| (k.clone(), r.clone())).collect(),
            })
            .collect();
        containers.sort_by_key(|c| c.key);
        StoreImage {
            format_version: 0,
            max_container_id: self.max_container_id,
            containers,
            service_properties: self.service_properties.clone(),
        }
    }
}

#[derive(Default)]
struct Activity {
    frozen: bool,
    update_transactions: usize,
    post_commit_running: usize,
}

struct StoreShared {
    state: Mutex<StoreState>,
    locks: Arc<LockManager>,
    next_txn_id: AtomicU64,
    next_temp_container: AtomicI64,
    data_dir: Option<PathBuf>,
    read_only: bool,
    activity: Mutex<Activity>,
    activity_cv: Condvar,
}

impl StoreShared {
    /// Waits, bounded by the lock wait timeout, until `done` holds.
    fn wait_for_activity(
        &self,
        what: &str,
        done: impl Fn(&Activity) -> bool,
    ) -> Result<MutexGuard<'_, Activity>, AccessError> {
        let deadline = Instant::now() + self.locks.wait_timeout();
        let mut activity = self.activity.lock();
        while !done(&activity) {
            let now = Instant::now();
            if now >= deadline {
                return Err(AccessError::LockTimeout {
                    lockable: what.to_string(),
                });
            }
            self.activity_cv.wait_for(&mut activity, deadline - now);
        }
        Ok(activity)
    }
}

/// In-memory raw store with an undo log per transaction and an optional
/// checkpoint image on disk.
#[derive(Clone)]
pub struct MemoryRawStore {
    shared: Arc<StoreShared>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStoreOptions {
    pub data_dir: Option<PathBuf>,
    pub read_only: bool,
    pub lock_wait_timeout: Duration,
}

impl MemoryRawStore {
    /// Opens the store, reloading `data_dir/store.img` when present.
    pub fn open(options: MemoryStoreOptions) -> Result<Self, AccessError> {
        let mut state = StoreState {
            max_container_id: -1,
            ..StoreState::default()
        };
        if let Some(dir) = &options.data_dir
            && let Some(image) = load_image_if_present(dir)?
        {
            for c in image.containers {
                let container = Container {
                    metadata: c.metadata,
                    rows: c.rows.into_iter().collect(),
                    next_record_id: c.next_record_id,
                };
                state.live.insert(c.key, container.clone());
                state.committed.insert(c.key, container);
            }
            state.max_container_id = image.max_container_id;
            state.service_properties = image.service_properties;
            info!(
                dir = %dir.display(),
                containers = state.live.len(),
                max_container_id = state.max_container_id,
                "raw store reloaded from image"
            );
        }
        Ok(Self {
            shared: Arc::new(StoreShared {
                state: Mutex::new(state),
                locks: Arc::new(LockManager::new(options.lock_wait_timeout)),
                next_txn_id: AtomicU64::new(1),
                next_temp_container: AtomicI64::new(1),
                data_dir: options.data_dir,
                read_only: options.read_only,
                activity: Mutex::new(Activity::default()),
                activity_cv: Condvar::new(),
            }),
        })
    }

    pub fn in_memory(lock_wait_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(StoreShared {
                state: Mutex::new(StoreState {
                    max_container_id: -1,
                    ..StoreState::default()
                }),
                locks: Arc::new(LockManager::new(lock_wait_timeout)),
                next_txn_id: AtomicU64::new(1),
                next_temp_container: AtomicI64::new(1),
                data_dir: None,
                read_only: false,
                activity: Mutex::new(Activity::default()),
                activity_cv: Condvar::new(),
            }),
        }
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.shared.data_dir.as_deref()
    }

    fn transaction(
        &self,
        space: CompatibilitySpace,
        read_only: bool,
        xid: Option<GlobalXid>,
    ) -> MemoryRawTransaction {
        let shared = Arc::clone(&self.shared);
        let txn_group = shared.locks.new_group();
        MemoryRawTransaction {
            id: shared.next_txn_id.fetch_add(1, Ordering::Relaxed),
            space,
            txn_group,
            read_only: read_only || shared.read_only,
            shared,
            undo: Vec::new(),
            savepoints: Vec::new(),
            post_commit: Vec::new(),
            registered_update: false,
            touched: false,
            xid,
            xa_state: None,
            destroyed: false,
        }
    }
}

impl RawStore for MemoryRawStore {
    fn lock_manager(&self) -> &Arc<LockManager> {
        &self.shared.locks
    }

    fn start_user_transaction(&self, read_only: bool) -> Result<Box<dyn RawTransaction>, AccessError> {
        let space = self.shared.locks.new_space();
        Ok(Box::new(self.transaction(space, read_only, None)))
    }

    fn start_nested_transaction(
        &self,
        space: CompatibilitySpace,
        read_only: bool,
    ) -> Result<Box<dyn RawTransaction>, AccessError> {
        Ok(Box::new(self.transaction(space, read_only, None)))
    }

    fn start_internal_transaction(&self) -> Result<Box<dyn RawTransaction>, AccessError> {
        let space = self.shared.locks.new_space();
        Ok(Box::new(self.transaction(space, false, None)))
    }

    fn start_global_transaction(&self, xid: GlobalXid) -> Result<Box<dyn RawTransaction>, AccessError> {
        register_global(&self.shared, &xid)?;
        let space = self.shared.locks.new_space();
        let mut txn = self.transaction(space, false, Some(xid));
        txn.xa_state = Some(XaState::Active);
        Ok(Box::new(txn))
    }

    fn max_container_id(&self) -> i64 {
        self.shared.state.lock().max_container_id
    }

    fn container_metadata(&self, key: ContainerKey) -> Result<Option<Vec<u8>>, AccessError> {
        Ok(self
            .shared
            .state
            .lock()
            .live
            .get(&key)
            .map(|c| c.metadata.clone()))
    }

    fn committed_rows(&self, key: ContainerKey) -> Result<Option<Vec<Row>>, AccessError> {
        Ok(self
            .shared
            .state
            .lock()
            .committed
            .get(&key)
            .map(|c| c.rows.values().cloned().collect()))
    }

    fn service_property(&self, key: &str) -> Option<String> {
        self.shared.state.lock().service_properties.get(key).cloned()
    }

    fn set_service_property(&self, key: &str, value: Option<String>) -> Result<(), AccessError> {
        if self.shared.read_only {
            return Err(AccessError::ReadOnly);
        }
        let mut state = self.shared.state.lock();
        match value {
            Some(v) => state.service_properties.insert(key.to_string(), v),
            None => state.service_properties.remove(key),
        };
        Ok(())
    }

    fn service_properties(&self) -> BTreeMap<String, String> {
        self.shared.state.lock().service_properties.clone()
    }

    fn is_read_only(&self) -> bool {
        self.shared.read_only
    }

    fn is_frozen(&self) -> bool {
        self.shared.activity.lock().frozen
    }

    fn freeze(&self) -> Result<(), AccessError> {
        let mut activity = self.shared.activity.lock();
        if activity.frozen {
            return Err(AccessError::IllegalState("store is already frozen".into()));
        }
        activity.frozen = true;
        info!("raw store frozen");
        Ok(())
    }

    fn unfreeze(&self) -> Result<(), AccessError> {
        let mut activity = self.shared.activity.lock();
        if !activity.frozen {
            return Err(AccessError::IllegalState("store is not frozen".into()));
        }
        activity.frozen = false;
        drop(activity);
        self.shared.activity_cv.notify_all();
        info!("raw store unfrozen");
        Ok(())
    }

    fn checkpoint(&self) -> Result<(), AccessError> {
        if self.is_frozen() {
            return Err(AccessError::IllegalState(
                "cannot checkpoint a frozen store".into(),
            ));
        }
        let Some(dir) = self.shared.data_dir.as_deref() else {
            debug!("checkpoint skipped: store has no data directory");
            return Ok(());
        };
        let image = self.shared.state.lock().image();
        let bytes = write_image(&image, dir)?;
        info!(
            dir = %dir.display(),
            containers = image.containers.len(),
            bytes,
            "checkpoint written"
        );
        Ok(())
    }

    fn backup(&self, dir: &Path, wait: bool) -> Result<BackupManifest, AccessError> {
        {
            let activity = self.shared.activity.lock();
            if activity.frozen {
                return Err(AccessError::IllegalState(
                    "cannot back up a frozen store".into(),
                ));
            }
            if !wait && activity.update_transactions > 0 {
                return Err(AccessError::LockTimeout {
                    lockable: format!(
                        "backup ({} update transactions in flight)",
                        activity.update_transactions
                    ),
                });
            }
        }
        if wait {
            self.shared
                .wait_for_activity("backup quiesce", |a| a.update_transactions == 0)?;
        }
        let image = self.shared.state.lock().image();
        let manifest = write_backup(&image, dir)?;
        info!(
            dir = %dir.display(),
            sha256 = %manifest.sha256_hex,
            containers = manifest.container_count,
            "backup written"
        );
        Ok(manifest)
    }

    fn wait_for_post_commit_to_finish(&self) -> Result<(), AccessError> {
        self.shared
            .wait_for_activity("post-commit work", |a| a.post_commit_running == 0)
            .map(|_| ())
    }

    fn shutdown(&self) -> Result<(), AccessError> {
        if self.shared.data_dir.is_some() && !self.shared.read_only && !self.is_frozen() {
            self.checkpoint()?;
        }
        Ok(())
    }
}

fn register_global(shared: &StoreShared, xid: &GlobalXid) -> Result<(), AccessError> {
    if !shared.state.lock().globals.insert(xid.clone()) {
        return Err(AccessError::AlreadyExists {
            resource_type: ResourceType::GlobalTransaction,
            resource_id: xid.to_string(),
        });
    }
    Ok(())
}

#[derive(Debug)]
enum Undo {
    CreatedContainer(ContainerKey),
    DroppedContainer(ContainerKey, Container),
    Metadata(ContainerKey, Vec<u8>),
    Inserted(ContainerKey, EncodedKey),
    Replaced(ContainerKey, EncodedKey, Row),
    Deleted(ContainerKey, EncodedKey, Row),
}

impl Undo {
    fn apply(self, state: &mut StoreState) {
        match self {
            Undo::CreatedContainer(key) => {
                state.live.remove(&key);
            }
            Undo::DroppedContainer(key, container) => {
                state.live.insert(key, container);
            }
            Undo::Metadata(key, old) => {
                if let Some(c) = state.live.get_mut(&key) {
                    c.metadata = old;
                }
            }
            Undo::Inserted(key, record) => {
                if let Some(c) = state.live.get_mut(&key) {
                    c.rows.remove(&record);
                }
            }
            Undo::Replaced(key, record, old) | Undo::Deleted(key, record, old) => {
                if let Some(c) = state.live.get_mut(&key) {
                    c.rows.insert(record, old);
                }
            }
        }
    }
}

pub struct MemoryRawTransaction {
    shared: Arc<StoreShared>,
    id: u64,
    space: CompatibilitySpace,
    txn_group: LockGroup,
    read_only: bool,
    undo: Vec<Undo>,
    savepoints: Vec<(String, usize)>,
    post_commit: Vec<Box<dyn PostCommitWork>>,
    /// Counted in the store's in-flight update transactions.
    registered_update: bool,
    touched: bool,
    xid: Option<GlobalXid>,
    xa_state: Option<XaState>,
    destroyed: bool,
}

impl MemoryRawTransaction {
    fn ensure_open(&self) -> Result<(), AccessError> {
        if self.destroyed {
            return Err(AccessError::TransactionClosed);
        }
        if self.xa_state == Some(XaState::Prepared) {
            return Err(AccessError::ProtocolViolation(
                "prepared global transaction accepts only commit or rollback".into(),
            ));
        }
        Ok(())
    }

    /// Checks the write is allowed and, for logged writes, counts this
    /// transaction as an in-flight updater. Blocks while the store is frozen.
    fn begin_write(&mut self, key: ContainerKey) -> Result<(), AccessError> {
        self.ensure_open()?;
        if self.read_only {
            return Err(AccessError::ReadOnly);
        }
        self.touched = true;
        if key.is_temporary() || self.registered_update {
            return Ok(());
        }
        let mut activity = self
            .shared
            .wait_for_activity("frozen store", |a| !a.frozen)?;
        activity.update_transactions += 1;
        self.registered_update = true;
        Ok(())
    }

    fn log(&mut self, key: ContainerKey, entry: Undo) {
        if !key.is_temporary() {
            self.undo.push(entry);
        }
    }

    fn end_update(&mut self) {
        if self.registered_update {
            self.registered_update = false;
            let mut activity = self.shared.activity.lock();
            activity.update_transactions = activity.update_transactions.saturating_sub(1);
            drop(activity);
            self.shared.activity_cv.notify_all();
        }
    }

    fn rollback_undo_to(&mut self, position: usize) {
        let tail: Vec<Undo> = self.undo.drain(position..).collect();
        let mut state = self.shared.state.lock();
        for entry in tail.into_iter().rev() {
            entry.apply(&mut state);
        }
    }

    /// Copies everything this transaction touched from the live state into
    /// the committed mirror.
    fn publish(&mut self) {
        if self.undo.is_empty() {
            return;
        }
        let mut containers = BTreeSet::new();
        let mut records = BTreeSet::new();
        for entry in &self.undo {
            match entry {
                Undo::CreatedContainer(key)
                | Undo::DroppedContainer(key, _)
                | Undo::Metadata(key, _) => {
                    containers.insert(*key);
                }
                Undo::Inserted(key, record)
                | Undo::Replaced(key, record, _)
                | Undo::Deleted(key, record, _) => {
                    records.insert((*key, record.clone()));
                }
            }
        }
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        for key in containers {
            match state.live.get(&key) {
                Some(live) => {
                    let entry = state.committed.entry(key).or_default();
                    entry.metadata = live.metadata.clone();
                    entry.next_record_id = entry.next_record_id.max(live.next_record_id);
                }
                None => {
                    state.committed.remove(&key);
                }
            }
        }
        for (key, record) in records {
            let live_row = state.live.get(&key).and_then(|c| c.rows.get(&record).cloned());
            let live_next = state.live.get(&key).map(|c| c.next_record_id);
            if let Some(committed) = state.committed.get_mut(&key) {
                match live_row {
                    Some(row) => {
                        committed.rows.insert(record, row);
                    }
                    None => {
                        committed.rows.remove(&record);
                    }
                }
                if let Some(next) = live_next {
                    committed.next_record_id = committed.next_record_id.max(next);
                }
            }
        }
        self.undo.clear();
    }

    fn release_transaction_locks(&mut self) -> Result<(), AccessError> {
        self.shared.locks.unlock_group(self.space, self.txn_group)?;
        Ok(())
    }

    fn run_post_commit_work(&mut self) {
        if self.post_commit.is_empty() {
            return;
        }
        let work = std::mem::take(&mut self.post_commit);
        self.shared.activity.lock().post_commit_running += work.len();
        for item in work {
            let name = item.describe();
            if let Err(err) = item.perform() {
                warn!(txn = self.id, work = %name, error = %err, "post-commit work failed");
            }
            self.shared.activity.lock().post_commit_running -= 1;
            self.shared.activity_cv.notify_all();
        }
    }

    fn finish_global(&mut self) {
        if let Some(xid) = self.xid.take() {
            self.shared.state.lock().globals.remove(&xid);
        }
        self.xa_state = None;
    }

    fn commit_inner(&mut self, flags: CommitFlags) -> Result<(), AccessError> {
        if flags.contains(CommitFlags::READONLY_TRANSACTION_INITIALIZATION) && !self.undo.is_empty() {
            return Err(AccessError::ProtocolViolation(
                "read-only initialization commit on a transaction with updates".into(),
            ));
        }
        self.publish();
        self.savepoints.clear();
        if !flags.contains(CommitFlags::KEEP_LOCKS) {
            self.release_transaction_locks()?;
        }
        self.end_update();
        self.touched = false;
        self.run_post_commit_work();
        Ok(())
    }

    fn abort_inner(&mut self) -> Result<(), AccessError> {
        self.rollback_undo_to(0);
        self.savepoints.clear();
        if !self.post_commit.is_empty() {
            debug!(txn = self.id, discarded = self.post_commit.len(), "post-commit work discarded on abort");
            self.post_commit.clear();
        }
        self.end_update();
        self.touched = false;
        self.release_transaction_locks()
    }

    fn savepoint_index(&self, name: &str) -> Result<usize, AccessError> {
        self.savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| AccessError::not_found(ResourceType::Savepoint, name))
    }
}

impl RawTransaction for MemoryRawTransaction {
    fn id(&self) -> u64 {
        self.id
    }

    fn id_string(&self) -> String {
        match &self.xid {
            Some(xid) => format!("{}@{xid}", self.id),
            None => self.id.to_string(),
        }
    }

    fn compatibility_space(&self) -> CompatibilitySpace {
        self.space
    }

    fn lock_manager(&self) -> Arc<LockManager> {
        Arc::clone(&self.shared.locks)
    }

    fn new_lock_group(&self) -> LockGroup {
        self.shared.locks.new_group()
    }

    fn lock_object(
        &mut self,
        group: Option<LockGroup>,
        lockable: &Lockable,
        mode: LockMode,
        wait: WaitPolicy,
    ) -> Result<(), AccessError> {
        self.ensure_open()?;
        self.touched = true;
        self.shared
            .locks
            .lock(self.space, group.unwrap_or(self.txn_group), lockable, mode, wait)
    }

    fn unlock_object(
        &mut self,
        group: Option<LockGroup>,
        lockable: &Lockable,
        mode: LockMode,
    ) -> Result<(), AccessError> {
        self.shared
            .locks
            .unlock(self.space, group.unwrap_or(self.txn_group), lockable, mode)?;
        Ok(())
    }

    fn release_lock_group(&mut self, group: LockGroup) -> Result<(), AccessError> {
        self.shared.locks.unlock_group(self.space, group)?;
        Ok(())
    }

    fn is_lock_held(&self, lockable: &Lockable, mode: LockMode) -> bool {
        self.shared.locks.is_lock_held(self.space, lockable, mode)
    }

    fn create_container(&mut self, key: ContainerKey, metadata: Vec<u8>) -> Result<(), AccessError> {
        self.begin_write(key)?;
        {
            let mut state = self.shared.state.lock();
            if state.live.contains_key(&key) || state.committed.contains_key(&key) {
                return Err(AccessError::AlreadyExists {
                    resource_type: ResourceType::Container,
                    resource_id: key.to_string(),
                });
            }
            state.live.insert(
                key,
                Container {
                    metadata,
                    rows: im::OrdMap::new(),
                    next_record_id: 1,
                },
            );
            if !key.is_temporary() {
                state.max_container_id = state.max_container_id.max(key.container_id);
            }
        }
        self.log(key, Undo::CreatedContainer(key));
        Ok(())
    }

    fn new_temp_container_key(&mut self) -> ContainerKey {
        ContainerKey {
            segment: TEMPORARY_SEGMENT,
            container_id: self.shared.next_temp_container.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn drop_container(&mut self, key: ContainerKey) -> Result<(), AccessError> {
        self.begin_write(key)?;
        let removed = {
            let mut state = self.shared.state.lock();
            state
                .live
                .remove(&key)
                .ok_or_else(|| AccessError::not_found(ResourceType::Container, key))?
        };
        self.log(key, Undo::DroppedContainer(key, removed));
        Ok(())
    }

    fn container_metadata(&self, key: ContainerKey) -> Result<Vec<u8>, AccessError> {
        self.ensure_open()?;
        Ok(self.shared.state.lock().live(key)?.metadata.clone())
    }

    fn update_container_metadata(&mut self, key: ContainerKey, metadata: Vec<u8>) -> Result<(), AccessError> {
        self.begin_write(key)?;
        let old = {
            let mut state = self.shared.state.lock();
            std::mem::replace(&mut state.live_mut(key)?.metadata, metadata)
        };
        self.log(key, Undo::Metadata(key, old));
        Ok(())
    }

    fn next_record_id(&mut self, key: ContainerKey) -> Result<u64, AccessError> {
        self.ensure_open()?;
        let mut state = self.shared.state.lock();
        let container = state.live_mut(key)?;
        let id = container.next_record_id;
        container.next_record_id += 1;
        Ok(id)
    }

    fn insert_record(&mut self, key: ContainerKey, record: EncodedKey, row: Row) -> Result<bool, AccessError> {
        self.begin_write(key)?;
        {
            let mut state = self.shared.state.lock();
            let container = state.live_mut(key)?;
            if container.rows.contains_key(&record) {
                return Ok(false);
            }
            container.rows.insert(record.clone(), row);
        }
        self.log(key, Undo::Inserted(key, record));
        Ok(true)
    }

    fn fetch_record(&self, key: ContainerKey, record: &EncodedKey) -> Result<Option<Row>, AccessError> {
        self.ensure_open()?;
        Ok(self.shared.state.lock().live(key)?.rows.get(record).cloned())
    }

    fn replace_record(&mut self, key: ContainerKey, record: &EncodedKey, row: Row) -> Result<bool, AccessError> {
        self.begin_write(key)?;
        let old = {
            let mut state = self.shared.state.lock();
            let container = state.live_mut(key)?;
            if !container.rows.contains_key(record) {
                return Ok(false);
            }
            container.rows.insert(record.clone(), row)
        };
        if let Some(old) = old {
            self.log(key, Undo::Replaced(key, record.clone(), old));
        }
        Ok(true)
    }

    fn delete_record(&mut self, key: ContainerKey, record: &EncodedKey) -> Result<bool, AccessError> {
        self.begin_write(key)?;
        let old = {
            let mut state = self.shared.state.lock();
            state.live_mut(key)?.rows.remove(record)
        };
        match old {
            Some(old) => {
                self.log(key, Undo::Deleted(key, record.clone(), old));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn scan_keys(&self, key: ContainerKey, range: KeyRange) -> Result<Vec<EncodedKey>, AccessError> {
        self.ensure_open()?;
        let state = self.shared.state.lock();
        let rows = &state.live(key)?.rows;
        if range_is_empty(&range) {
            return Ok(Vec::new());
        }
        Ok(rows
            .range(range)
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn set_savepoint(&mut self, name: &str) -> Result<usize, AccessError> {
        self.ensure_open()?;
        if self.savepoints.iter().any(|(n, _)| n == name) {
            return Err(AccessError::AlreadyExists {
                resource_type: ResourceType::Savepoint,
                resource_id: name.to_string(),
            });
        }
        self.savepoints.push((name.to_string(), self.undo.len()));
        Ok(self.savepoints.len())
    }

    fn release_savepoint(&mut self, name: &str) -> Result<usize, AccessError> {
        self.ensure_open()?;
        let index = self.savepoint_index(name)?;
        self.savepoints.truncate(index);
        Ok(self.savepoints.len())
    }

    fn rollback_to_savepoint(&mut self, name: &str) -> Result<usize, AccessError> {
        self.ensure_open()?;
        let index = self.savepoint_index(name)?;
        let position = self.savepoints[index].1;
        self.rollback_undo_to(position);
        self.savepoints.truncate(index + 1);
        Ok(self.savepoints.len())
    }

    fn commit(&mut self, flags: CommitFlags) -> Result<(), AccessError> {
        self.ensure_open()?;
        self.commit_inner(flags)
    }

    fn abort(&mut self) -> Result<(), AccessError> {
        if self.destroyed {
            return Err(AccessError::TransactionClosed);
        }
        if self.xa_state == Some(XaState::Prepared) {
            return Err(AccessError::ProtocolViolation(
                "prepared global transaction must be resolved with xa_rollback".into(),
            ));
        }
        self.abort_inner()
    }

    fn destroy(&mut self) -> Result<(), AccessError> {
        if self.destroyed {
            return Ok(());
        }
        let result = self.abort_inner();
        self.finish_global();
        self.destroyed = true;
        result
    }

    fn add_post_commit_work(&mut self, work: Box<dyn PostCommitWork>) {
        self.post_commit.push(work);
    }

    fn is_idle(&self) -> bool {
        self.undo.is_empty() && !self.registered_update
    }

    fn is_pristine(&self) -> bool {
        self.is_idle() && !self.touched
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn global_xid(&self) -> Option<&GlobalXid> {
        self.xid.as_ref()
    }

    fn bind_global(&mut self, xid: GlobalXid) -> Result<(), AccessError> {
        self.ensure_open()?;
        if self.xid.is_some() {
            return Err(AccessError::ProtocolViolation(
                "transaction is already bound to a global id".into(),
            ));
        }
        register_global(&self.shared, &xid)?;
        self.xid = Some(xid);
        self.xa_state = Some(XaState::Active);
        Ok(())
    }

    fn xa_prepare(&mut self) -> Result<XaPrepareOutcome, AccessError> {
        if self.xid.is_none() {
            return Err(AccessError::ProtocolViolation(
                "xa_prepare on a local transaction".into(),
            ));
        }
        self.ensure_open()?;
        if self.is_idle() {
            self.commit_inner(CommitFlags::RELEASE_LOCKS)?;
            self.finish_global();
            return Ok(XaPrepareOutcome::ReadOnly);
        }
        self.xa_state = Some(XaState::Prepared);
        Ok(XaPrepareOutcome::Prepared)
    }

    fn xa_commit(&mut self, one_phase: bool) -> Result<(), AccessError> {
        if self.destroyed {
            return Err(AccessError::TransactionClosed);
        }
        let prepared = match self.xa_state {
            None => {
                return Err(AccessError::ProtocolViolation(
                    "xa_commit on a local transaction".into(),
                ));
            }
            Some(state) => state == XaState::Prepared,
        };
        if one_phase && prepared {
            return Err(AccessError::ProtocolViolation(
                "one-phase commit of a prepared transaction".into(),
            ));
        }
        if !one_phase && !prepared {
            return Err(AccessError::ProtocolViolation(
                "two-phase commit requires a prior prepare".into(),
            ));
        }
        self.commit_inner(CommitFlags::RELEASE_LOCKS)?;
        self.finish_global();
        Ok(())
    }

    fn xa_rollback(&mut self) -> Result<(), AccessError> {
        if self.destroyed {
            return Err(AccessError::TransactionClosed);
        }
        if self.xid.is_none() {
            return Err(AccessError::ProtocolViolation(
                "xa_rollback on a local transaction".into(),
            ));
        }
        let result = self.abort_inner();
        self.finish_global();
        result
    }
}

impl Drop for MemoryRawTransaction {
    fn drop(&mut self) {
        if !self.destroyed
            && let Err(err) = self.destroy()
        {
            warn!(txn = self.id, error = %err, "raw transaction cleanup failed");
        }
    }
}
