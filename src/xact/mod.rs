pub mod xa;

use crate::AccessShared;
use crate::catalog::types::{ColumnOrdering, ColumnType, Row, RowLocation, Value};
use crate::catalog::{ConglomerateId, ConglomerateProperties};
use crate::conglomerate::{
    Conglomerate, ConglomerateController, OpenContext, OpenMode, ScanController, ScanSpec,
};
use crate::error::{AccessError, ResourceType};
use crate::locking::lock_manager::WaitPolicy;
use crate::locking::{Granularity, IsolationLevel, LockingPolicy};
use crate::property::PropertyMap;
use crate::raw::{CommitFlags, RawTransaction};
use crate::sort::{SORT_EXTERNAL_IMPLEMENTATION, Sort, SortRowSource, SortScan};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, warn};
use xa::{GlobalXid, XaPrepareOutcome};

macro_rules! handle_type {
    ($name:ident, $label:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($label, "#{}"), self.0)
            }
        }
    };
}

handle_type!(ConglomerateHandle, "controller");
handle_type!(ScanHandle, "scan");
handle_type!(SortControllerHandle, "sort-controller");

/// Slot of a sort created by a transaction. Ids of dropped sorts are reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SortId(usize);

impl std::fmt::Display for SortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sort#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    User,
    /// Child of a user transaction, sharing its lock space and temporaries.
    Nested,
    Internal,
    Global,
}

/// What `count_opens` counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenCount {
    Conglomerates,
    Scans,
    CreatedSorts,
    SortControllers,
    Total,
}

/// Temporary conglomerates of a top-level transaction and its child.
#[derive(Debug)]
struct TempConglomerates {
    next_id: i64,
    by_id: BTreeMap<ConglomerateId, Arc<dyn Conglomerate>>,
}

impl Default for TempConglomerates {
    fn default() -> Self {
        Self {
            next_id: -1,
            by_id: BTreeMap::new(),
        }
    }
}

impl TempConglomerates {
    fn allocate(&mut self) -> ConglomerateId {
        let id = ConglomerateId(self.next_id);
        self.next_id -= 1;
        id
    }
}

enum OpenScan {
    Conglomerate {
        scan: Box<dyn ScanController>,
        group_fetch: bool,
    },
    Sort {
        scan: Box<dyn SortScan>,
        sort: SortId,
        hold: bool,
    },
}

#[derive(Default)]
struct OpenHandles {
    next: u64,
    controllers: BTreeMap<u64, Box<dyn ConglomerateController>>,
    scans: BTreeMap<u64, OpenScan>,
    sort_controllers: BTreeMap<u64, SortId>,
}

impl OpenHandles {
    fn allocate(&mut self) -> u64 {
        self.next += 1;
        self.next
    }

    fn controller(&mut self, handle: ConglomerateHandle) -> Result<&mut Box<dyn ConglomerateController>, AccessError> {
        self.controllers
            .get_mut(&handle.0)
            .ok_or_else(|| AccessError::not_found(ResourceType::Controller, handle))
    }

    fn scan(&mut self, handle: ScanHandle) -> Result<&mut OpenScan, AccessError> {
        self.scans
            .get_mut(&handle.0)
            .ok_or_else(|| AccessError::not_found(ResourceType::Scan, handle))
    }
}

#[derive(Default)]
struct SortTable {
    slots: Vec<Option<Box<dyn Sort>>>,
    free: Vec<usize>,
}

impl SortTable {
    fn add(&mut self, sort: Box<dyn Sort>) -> SortId {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(sort);
                SortId(slot)
            }
            None => {
                self.slots.push(Some(sort));
                SortId(self.slots.len() - 1)
            }
        }
    }

    fn get_mut(&mut self, id: SortId) -> Result<&mut Box<dyn Sort>, AccessError> {
        self.slots
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| AccessError::not_found(ResourceType::Sort, id))
    }

    fn remove(&mut self, id: SortId) -> Result<Box<dyn Sort>, AccessError> {
        let sort = self
            .slots
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or_else(|| AccessError::not_found(ResourceType::Sort, id))?;
        self.free.push(id.0);
        Ok(sort)
    }

    fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Drops every sort, logging failures.
    fn drop_all(&mut self, txn: &str) {
        for (slot, sort) in self.slots.iter_mut().enumerate() {
            if let Some(mut sort) = sort.take()
                && let Err(err) = sort.drop_sort()
            {
                warn!(txn, sort = slot, error = %err, "failed to drop sort");
            }
        }
        self.slots.clear();
        self.free.clear();
    }
}

struct TxCore {
    name: String,
    kind: TransactionKind,
    /// `None` once destroyed.
    raw: Option<Box<dyn RawTransaction>>,
    parent: Option<Arc<Mutex<TxCore>>>,
    open: OpenHandles,
    sorts: SortTable,
    temp: Arc<Mutex<TempConglomerates>>,
    schema_changed: bool,
    /// Set on a parent whose nested child aborted; cleared by `abort`.
    aborted_by_child: bool,
}

impl TxCore {
    fn new(
        name: String,
        kind: TransactionKind,
        raw: Box<dyn RawTransaction>,
        parent: Option<Arc<Mutex<TxCore>>>,
        temp: Arc<Mutex<TempConglomerates>>,
    ) -> Self {
        Self {
            name,
            kind,
            raw: Some(raw),
            parent,
            open: OpenHandles::default(),
            sorts: SortTable::default(),
            temp,
            schema_changed: false,
            aborted_by_child: false,
        }
    }

    fn raw(&self) -> Result<&dyn RawTransaction, AccessError> {
        self.raw.as_deref().ok_or(AccessError::TransactionClosed)
    }

    /// The raw transaction and handle tables, for a transaction that may be
    /// used.
    fn active(&mut self) -> Result<(&mut dyn RawTransaction, &mut OpenHandles, &mut SortTable), AccessError> {
        let raw: &mut dyn RawTransaction = self.raw.as_deref_mut().ok_or(AccessError::TransactionClosed)?;
        if self.aborted_by_child {
            return Err(AccessError::TransactionAborted);
        }
        Ok((raw, &mut self.open, &mut self.sorts))
    }

    fn raw_mut(&mut self) -> Result<&mut dyn RawTransaction, AccessError> {
        Ok(self.active()?.0)
    }

    fn find(&self, shared: &AccessShared, id: ConglomerateId) -> Result<Arc<dyn Conglomerate>, AccessError> {
        if id.is_temporary() {
            return self
                .temp
                .lock()
                .by_id
                .get(&id)
                .cloned()
                .ok_or_else(|| AccessError::not_found(ResourceType::Conglomerate, id));
        }
        shared
            .cache
            .find(id, &shared.registry, shared.raw.as_ref())
    }

    /// Closes controllers and scans, skipping held ones unless
    /// `closing_held`. Sort controllers always complete; sorts are dropped
    /// only with the held handles. Every handle is attempted; the first
    /// failure is returned.
    fn close_controllers(&mut self, closing_held: bool) -> Result<(), AccessError> {
        let Some(raw) = self.raw.as_deref_mut() else {
            return Ok(());
        };
        let txn = self.name.as_str();
        let mut first_error = None;

        let mut kept = BTreeMap::new();
        for (handle, mut controller) in std::mem::take(&mut self.open.controllers) {
            match controller.close_for_end_transaction(raw, closing_held) {
                Ok(true) => {}
                Ok(false) => {
                    kept.insert(handle, controller);
                }
                Err(err) => {
                    warn!(txn, handle, error = %err, "failed to close controller");
                    first_error.get_or_insert(err);
                }
            }
        }
        self.open.controllers = kept;

        let mut kept = BTreeMap::new();
        for (handle, open) in std::mem::take(&mut self.open.scans) {
            match open {
                OpenScan::Conglomerate {
                    mut scan,
                    group_fetch,
                } => match scan.close_for_end_transaction(raw, closing_held) {
                    Ok(true) => {}
                    Ok(false) => {
                        kept.insert(handle, OpenScan::Conglomerate { scan, group_fetch });
                    }
                    Err(err) => {
                        warn!(txn, handle, error = %err, "failed to close scan");
                        first_error.get_or_insert(err);
                    }
                },
                OpenScan::Sort { scan, sort, hold } => {
                    if hold && !closing_held {
                        kept.insert(handle, OpenScan::Sort { scan, sort, hold });
                    }
                }
            }
        }
        self.open.scans = kept;

        for (handle, sort) in std::mem::take(&mut self.open.sort_controllers) {
            if let Some(Some(sort)) = self.sorts.slots.get_mut(sort.0)
                && !sort.inserts_complete()
                && let Err(err) = sort.complete_inserts()
            {
                warn!(txn, handle, error = %err, "failed to complete sort inserts");
                first_error.get_or_insert(err);
            }
        }

        if closing_held {
            self.sorts.drop_all(txn);
        }
        first_error.map_or(Ok(()), Err)
    }

    fn invalidate_if_schema_changed(&self, shared: &AccessShared) {
        if self.schema_changed
            && let Err(err) = shared.cache.invalidate_all()
        {
            warn!(txn = %self.name, error = %err, "conglomerate cache invalidation failed");
        }
    }

    /// Aborts this transaction and, for a nested one, its parent. Handle
    /// cleanup is best effort; the raw abort always runs.
    fn abort(&mut self, shared: &AccessShared) -> Result<(), AccessError> {
        if self.raw.is_none() {
            return Err(AccessError::TransactionClosed);
        }
        self.invalidate_if_schema_changed(shared);
        if let Err(err) = self.close_controllers(true) {
            debug!(txn = %self.name, error = %err, "abort continued past close failure");
        }
        let result = match self.raw.as_deref_mut() {
            Some(raw) => raw.abort(),
            None => Ok(()),
        };
        // A find that missed the cache before the undo may have cached the
        // rolled-back descriptor.
        self.invalidate_if_schema_changed(shared);
        self.schema_changed = false;
        self.aborted_by_child = false;
        debug!(txn = %self.name, "transaction aborted");

        if let Some(parent) = &self.parent {
            let mut parent = parent.lock();
            if parent.raw.is_some() {
                if let Err(err) = parent.abort(shared) {
                    warn!(txn = %parent.name, error = %err, "aborting parent of nested transaction failed");
                }
                parent.aborted_by_child = true;
            }
        }
        result
    }

    /// Invalidation, then handle closure, then raw termination. The cache is
    /// invalidated again once the raw work is undone.
    fn destroy(&mut self, shared: &AccessShared) -> Result<(), AccessError> {
        if self.raw.is_none() {
            return Ok(());
        }
        self.invalidate_if_schema_changed(shared);
        if let Err(err) = self.close_controllers(true) {
            debug!(txn = %self.name, error = %err, "destroy continued past close failure");
        }
        let Some(mut raw) = self.raw.take() else {
            return Ok(());
        };
        if self.kind != TransactionKind::Nested {
            let temps = std::mem::take(&mut self.temp.lock().by_id);
            for (id, conglomerate) in temps {
                if let Err(err) = conglomerate.drop_conglomerate(raw.as_mut()) {
                    warn!(txn = %self.name, conglomerate = %id, error = %err, "failed to drop temporary conglomerate");
                }
            }
        }
        let result = raw.destroy();
        self.invalidate_if_schema_changed(shared);
        self.schema_changed = false;
        debug!(txn = %self.name, "transaction destroyed");
        result
    }
}

/// A caller's unit of work over conglomerates, sorts and properties. Every
/// controller, scan and sort it opens is addressed by a handle and closed by
/// the transaction when it ends.
pub struct Transaction {
    shared: Arc<AccessShared>,
    core: Arc<Mutex<TxCore>>,
}

impl Transaction {
    pub(crate) fn new(
        shared: Arc<AccessShared>,
        name: impl Into<String>,
        kind: TransactionKind,
        raw: Box<dyn RawTransaction>,
    ) -> Self {
        let core = TxCore::new(
            name.into(),
            kind,
            raw,
            None,
            Arc::new(Mutex::new(TempConglomerates::default())),
        );
        Self {
            shared,
            core: Arc::new(Mutex::new(core)),
        }
    }

    pub fn name(&self) -> String {
        self.core.lock().name.clone()
    }

    pub fn kind(&self) -> TransactionKind {
        self.core.lock().kind
    }

    fn policy(&self, granularity: Granularity, isolation: IsolationLevel) -> LockingPolicy {
        self.shared.policies.effective_policy(granularity, isolation)
    }

    // ---- conglomerates ----

    pub fn find_conglomerate(&self, id: ConglomerateId) -> Result<Arc<dyn Conglomerate>, AccessError> {
        let core = self.core.lock();
        core.raw()?;
        core.find(&self.shared, id)
    }

    pub fn conglomerate_exists(&self, id: ConglomerateId) -> Result<bool, AccessError> {
        match self.find_conglomerate(id) {
            Ok(_) => Ok(true),
            Err(AccessError::NotFound {
                resource_type: ResourceType::Conglomerate,
                ..
            }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Creates a conglomerate of the named kind. Temporaries get the next
    /// negative id and stay private to this transaction and its child.
    pub fn create_conglomerate(
        &self,
        implementation: &str,
        template: &[ColumnType],
        ordering: &[ColumnOrdering],
        properties: &ConglomerateProperties,
        temporary: bool,
    ) -> Result<ConglomerateId, AccessError> {
        let factory = self.shared.registry.conglomerate_factory(implementation)?;
        let mut core = self.core.lock();
        let core = &mut *core;
        let temp = Arc::clone(&core.temp);
        let raw = core.raw_mut()?;

        if temporary {
            let id = temp.lock().allocate();
            let container = raw.new_temp_container_key();
            let created = factory.create(raw, id, container, template, ordering, properties)?;
            temp.lock().by_id.insert(id, created);
            debug!(txn = %core.name, conglomerate = %id, implementation, "temporary conglomerate created");
            return Ok(id);
        }

        let raw_store = Arc::clone(&self.shared.raw);
        let mut collisions = 0;
        let created = loop {
            let id = self
                .shared
                .registry
                .next_identifier(factory.kind_tag(), || raw_store.max_container_id())?;
            match factory.create(raw, id, id.persistent_container(), template, ordering, properties) {
                Ok(created) => break created,
                Err(AccessError::AlreadyExists {
                    resource_type: ResourceType::Container,
                    ..
                }) if collisions < self.shared.config.max_id_collision_retries => {
                    collisions += 1;
                    warn!(conglomerate = %id, attempt = collisions, "conglomerate id already in use, retrying");
                }
                Err(err) => return Err(err),
            }
        };
        let id = created.id();
        self.shared.cache.add_entry(created)?;
        core.schema_changed = true;
        debug!(txn = %core.name, conglomerate = %id, implementation, "conglomerate created");
        Ok(id)
    }

    /// Creates a conglomerate and inserts every row from `rows`. Returns the
    /// id and the number of rows loaded.
    pub fn create_and_load_conglomerate<I>(
        &self,
        implementation: &str,
        template: &[ColumnType],
        ordering: &[ColumnOrdering],
        properties: &ConglomerateProperties,
        temporary: bool,
        rows: I,
    ) -> Result<(ConglomerateId, usize), AccessError>
    where
        I: IntoIterator<Item = Result<Row, AccessError>>,
    {
        let id = self.create_conglomerate(implementation, template, ordering, properties, temporary)?;
        let loaded = self.load(id, rows)?;
        Ok((id, loaded))
    }

    /// Like `create_and_load_conglomerate`, but when nothing was loaded and
    /// `recreate_if_empty` is false the new conglomerate is dropped and
    /// `original` returned instead.
    #[allow(clippy::too_many_arguments)]
    pub fn recreate_and_load_conglomerate<I>(
        &self,
        implementation: &str,
        recreate_if_empty: bool,
        template: &[ColumnType],
        ordering: &[ColumnOrdering],
        properties: &ConglomerateProperties,
        temporary: bool,
        original: ConglomerateId,
        rows: I,
    ) -> Result<ConglomerateId, AccessError>
    where
        I: IntoIterator<Item = Result<Row, AccessError>>,
    {
        let (id, loaded) =
            self.create_and_load_conglomerate(implementation, template, ordering, properties, temporary, rows)?;
        if loaded == 0 && !recreate_if_empty {
            self.drop_conglomerate(id)?;
            return Ok(original);
        }
        Ok(id)
    }

    fn load<I>(&self, id: ConglomerateId, rows: I) -> Result<usize, AccessError>
    where
        I: IntoIterator<Item = Result<Row, AccessError>>,
    {
        let handle = self.open_conglomerate(
            id,
            false,
            OpenMode::FOR_UPDATE,
            Granularity::Table,
            IsolationLevel::Serializable,
        )?;
        let mut loaded = 0;
        let outcome = rows.into_iter().try_for_each(|row| {
            self.insert(handle, row?)?;
            loaded += 1;
            Ok(())
        });
        self.close_conglomerate(handle)?;
        outcome.map(|()| loaded)
    }

    pub fn drop_conglomerate(&self, id: ConglomerateId) -> Result<(), AccessError> {
        let mut core = self.core.lock();
        let core = &mut *core;
        let conglomerate = core.find(&self.shared, id)?;
        let raw = core.raw_mut()?;
        let group = raw.new_lock_group();
        exclusive_table_policy().lock_container(raw, conglomerate.container(), true, group, WaitPolicy::Timed)?;
        conglomerate.drop_conglomerate(raw)?;
        if id.is_temporary() {
            core.temp.lock().by_id.remove(&id);
        } else {
            self.shared.cache.remove_entry(id)?;
            core.schema_changed = true;
        }
        debug!(txn = %core.name, conglomerate = %id, "conglomerate dropped");
        Ok(())
    }

    /// Appends a column. The successor descriptor replaces the cached one
    /// and the cache is flushed if this transaction later aborts.
    pub fn add_column_to_conglomerate(
        &self,
        id: ConglomerateId,
        column: usize,
        column_type: ColumnType,
    ) -> Result<(), AccessError> {
        let mut core = self.core.lock();
        let core = &mut *core;
        let conglomerate = core.find(&self.shared, id)?;
        let raw = core.raw_mut()?;
        let group = raw.new_lock_group();
        exclusive_table_policy().lock_container(raw, conglomerate.container(), true, group, WaitPolicy::Timed)?;
        let successor = conglomerate.add_column(raw, column, column_type)?;
        if id.is_temporary() {
            core.temp.lock().by_id.insert(id, successor);
        } else {
            self.shared.cache.update_entry(successor)?;
        }
        core.schema_changed = true;
        debug!(txn = %core.name, conglomerate = %id, column, "column added");
        Ok(())
    }

    // ---- controllers ----

    pub fn open_conglomerate(
        &self,
        id: ConglomerateId,
        hold: bool,
        mode: OpenMode,
        granularity: Granularity,
        isolation: IsolationLevel,
    ) -> Result<ConglomerateHandle, AccessError> {
        let policy = self.policy(granularity, isolation);
        let mut core = self.core.lock();
        let conglomerate = core.find(&self.shared, id)?;
        let (raw, open, _) = core.active()?;
        let ctx = OpenContext {
            hold,
            mode,
            policy,
            lock_group: raw.new_lock_group(),
        };
        let controller = conglomerate.open(raw, ctx)?;
        let handle = open.allocate();
        open.controllers.insert(handle, controller);
        Ok(ConglomerateHandle(handle))
    }

    pub fn insert(&self, handle: ConglomerateHandle, row: Row) -> Result<RowLocation, AccessError> {
        let mut core = self.core.lock();
        let (raw, open, _) = core.active()?;
        open.controller(handle)?.insert(raw, row)
    }

    pub fn fetch(
        &self,
        handle: ConglomerateHandle,
        location: &RowLocation,
        projection: Option<&[usize]>,
    ) -> Result<Option<Row>, AccessError> {
        let mut core = self.core.lock();
        let (raw, open, _) = core.active()?;
        open.controller(handle)?.fetch(raw, location, projection)
    }

    pub fn replace(&self, handle: ConglomerateHandle, location: &RowLocation, row: Row) -> Result<bool, AccessError> {
        let mut core = self.core.lock();
        let (raw, open, _) = core.active()?;
        open.controller(handle)?.replace(raw, location, row)
    }

    pub fn delete(&self, handle: ConglomerateHandle, location: &RowLocation) -> Result<bool, AccessError> {
        let mut core = self.core.lock();
        let (raw, open, _) = core.active()?;
        open.controller(handle)?.delete(raw, location)
    }

    pub fn lock_row(
        &self,
        handle: ConglomerateHandle,
        location: &RowLocation,
        for_update: bool,
    ) -> Result<(), AccessError> {
        let mut core = self.core.lock();
        let (raw, open, _) = core.active()?;
        open.controller(handle)?.lock_row(raw, location, for_update)
    }

    pub fn close_conglomerate(&self, handle: ConglomerateHandle) -> Result<(), AccessError> {
        let mut core = self.core.lock();
        let (raw, open, _) = core.active()?;
        let mut controller = open
            .controllers
            .remove(&handle.0)
            .ok_or_else(|| AccessError::not_found(ResourceType::Controller, handle))?;
        controller.close(raw)
    }

    // ---- scans ----

    pub fn open_scan(
        &self,
        id: ConglomerateId,
        hold: bool,
        mode: OpenMode,
        granularity: Granularity,
        isolation: IsolationLevel,
        spec: ScanSpec,
    ) -> Result<ScanHandle, AccessError> {
        self.open_conglomerate_scan(id, hold, mode, granularity, isolation, spec, false)
    }

    /// A scan that only serves `fetch_next_group`.
    pub fn open_group_fetch_scan(
        &self,
        id: ConglomerateId,
        hold: bool,
        mode: OpenMode,
        granularity: Granularity,
        isolation: IsolationLevel,
        spec: ScanSpec,
    ) -> Result<ScanHandle, AccessError> {
        self.open_conglomerate_scan(id, hold, mode, granularity, isolation, spec, true)
    }

    #[allow(clippy::too_many_arguments)]
    fn open_conglomerate_scan(
        &self,
        id: ConglomerateId,
        hold: bool,
        mode: OpenMode,
        granularity: Granularity,
        isolation: IsolationLevel,
        spec: ScanSpec,
        group_fetch: bool,
    ) -> Result<ScanHandle, AccessError> {
        let policy = self.policy(granularity, isolation);
        let mut core = self.core.lock();
        let conglomerate = core.find(&self.shared, id)?;
        let (raw, open, _) = core.active()?;
        let ctx = OpenContext {
            hold,
            mode,
            policy,
            lock_group: raw.new_lock_group(),
        };
        let scan = conglomerate.open_scan(raw, ctx, spec)?;
        let handle = open.allocate();
        open.scans
            .insert(handle, OpenScan::Conglomerate { scan, group_fetch });
        Ok(ScanHandle(handle))
    }

    pub fn fetch_next(&self, handle: ScanHandle) -> Result<Option<Row>, AccessError> {
        let mut core = self.core.lock();
        let (raw, open, _) = core.active()?;
        match open.scan(handle)? {
            OpenScan::Conglomerate {
                group_fetch: true, ..
            } => Err(AccessError::unsupported("fetch_next", "group fetch scan")),
            OpenScan::Conglomerate { scan, .. } => Ok(scan.next(raw)?.map(|(_, row)| row)),
            OpenScan::Sort { scan, .. } => scan.next_row(),
        }
    }

    /// Next row together with its location. Sort scans have no locations.
    pub fn fetch_next_located(&self, handle: ScanHandle) -> Result<Option<(RowLocation, Row)>, AccessError> {
        let mut core = self.core.lock();
        let (raw, open, _) = core.active()?;
        match open.scan(handle)? {
            OpenScan::Conglomerate {
                scan,
                group_fetch: false,
            } => scan.next(raw),
            OpenScan::Conglomerate { .. } => {
                Err(AccessError::unsupported("fetch_next_located", "group fetch scan"))
            }
            OpenScan::Sort { .. } => Err(AccessError::unsupported("fetch_next_located", "sort scan")),
        }
    }

    pub fn fetch_next_group(&self, handle: ScanHandle, max_rows: usize) -> Result<Vec<Row>, AccessError> {
        let mut core = self.core.lock();
        let (raw, open, _) = core.active()?;
        match open.scan(handle)? {
            OpenScan::Conglomerate { scan, .. } => scan.fetch_next_group(raw, max_rows),
            OpenScan::Sort { scan, .. } => {
                let mut rows = Vec::new();
                while rows.len() < max_rows {
                    match scan.next_row()? {
                        Some(row) => rows.push(row),
                        None => break,
                    }
                }
                Ok(rows)
            }
        }
    }

    pub fn delete_current(&self, handle: ScanHandle) -> Result<bool, AccessError> {
        let mut core = self.core.lock();
        let (raw, open, _) = core.active()?;
        match open.scan(handle)? {
            OpenScan::Conglomerate {
                scan,
                group_fetch: false,
            } => scan.delete_current(raw),
            _ => Err(AccessError::unsupported("delete_current", "read-only scan")),
        }
    }

    pub fn replace_current(&self, handle: ScanHandle, row: Row) -> Result<bool, AccessError> {
        let mut core = self.core.lock();
        let (raw, open, _) = core.active()?;
        match open.scan(handle)? {
            OpenScan::Conglomerate {
                scan,
                group_fetch: false,
            } => scan.replace_current(raw, row),
            _ => Err(AccessError::unsupported("replace_current", "read-only scan")),
        }
    }

    pub fn close_scan(&self, handle: ScanHandle) -> Result<(), AccessError> {
        let mut core = self.core.lock();
        let (raw, open, _) = core.active()?;
        match open.scans.remove(&handle.0) {
            Some(OpenScan::Conglomerate { mut scan, .. }) => scan.close(raw),
            Some(OpenScan::Sort { .. }) => Ok(()),
            None => Err(AccessError::not_found(ResourceType::Scan, handle)),
        }
    }

    // ---- sorts ----

    /// Creates a sort with the named implementation, or the external sort
    /// when `None`.
    pub fn create_sort(
        &self,
        implementation: Option<&str>,
        template: &[ColumnType],
        ordering: &[ColumnOrdering],
        unique: bool,
    ) -> Result<SortId, AccessError> {
        let factory = self
            .shared
            .registry
            .sort_factory(implementation.unwrap_or(SORT_EXTERNAL_IMPLEMENTATION))?;
        let mut core = self.core.lock();
        let (_, _, sorts) = core.active()?;
        let sort = factory.create_sort(template, ordering, unique)?;
        Ok(sorts.add(sort))
    }

    /// Opens an insert controller on a sort. Closing it completes the
    /// inserts.
    pub fn open_sort(&self, sort: SortId) -> Result<SortControllerHandle, AccessError> {
        let mut core = self.core.lock();
        let (_, open, sorts) = core.active()?;
        if sorts.get_mut(sort)?.inserts_complete() {
            return Err(AccessError::ProtocolViolation(format!(
                "{sort} no longer accepts rows"
            )));
        }
        let handle = open.allocate();
        open.sort_controllers.insert(handle, sort);
        Ok(SortControllerHandle(handle))
    }

    pub fn sort_insert(&self, handle: SortControllerHandle, row: Row) -> Result<(), AccessError> {
        let mut core = self.core.lock();
        let (_, open, sorts) = core.active()?;
        let sort = *open
            .sort_controllers
            .get(&handle.0)
            .ok_or_else(|| AccessError::not_found(ResourceType::Controller, handle))?;
        sorts.get_mut(sort)?.insert(row)
    }

    pub fn close_sort_controller(&self, handle: SortControllerHandle) -> Result<(), AccessError> {
        let mut core = self.core.lock();
        let (_, open, sorts) = core.active()?;
        let sort = open
            .sort_controllers
            .remove(&handle.0)
            .ok_or_else(|| AccessError::not_found(ResourceType::Controller, handle))?;
        let sort = sorts.get_mut(sort)?;
        if sort.inserts_complete() {
            return Ok(());
        }
        sort.complete_inserts()
    }

    pub fn open_sort_scan(&self, sort: SortId, hold: bool) -> Result<ScanHandle, AccessError> {
        let mut core = self.core.lock();
        let (_, open, sorts) = core.active()?;
        let scan = sorts.get_mut(sort)?.open_scan()?;
        let handle = open.allocate();
        open.scans.insert(handle, OpenScan::Sort { scan, sort, hold });
        Ok(ScanHandle(handle))
    }

    /// Sorted rows as an iterator owned by the caller, typically fed to
    /// `create_and_load_conglomerate`.
    pub fn open_sort_row_source(&self, sort: SortId) -> Result<SortRowSource, AccessError> {
        let mut core = self.core.lock();
        let (_, _, sorts) = core.active()?;
        Ok(SortRowSource::new(sorts.get_mut(sort)?.open_scan()?))
    }

    pub fn drop_sort(&self, sort: SortId) -> Result<(), AccessError> {
        let mut core = self.core.lock();
        let (_, open, sorts) = core.active()?;
        let mut dropped = sorts.remove(sort)?;
        open.sort_controllers.retain(|_, s| *s != sort);
        open.scans
            .retain(|_, scan| !matches!(scan, OpenScan::Sort { sort: s, .. } if *s == sort));
        dropped.drop_sort()
    }

    // ---- lifecycle ----

    /// Commits, closing every controller and scan that is not held. Sorts
    /// survive.
    pub fn commit(&self) -> Result<(), AccessError> {
        self.commit_with(CommitFlags::RELEASE_LOCKS)
    }

    pub fn commit_no_sync(&self, flags: CommitFlags) -> Result<(), AccessError> {
        self.commit_with(flags)
    }

    fn commit_with(&self, flags: CommitFlags) -> Result<(), AccessError> {
        let mut core = self.core.lock();
        let raw = core.raw_mut()?;
        if raw.global_xid().is_some() && !raw.is_idle() {
            return Err(AccessError::ProtocolViolation(
                "global transaction with updates must commit through xa_commit".into(),
            ));
        }
        core.close_controllers(false)?;
        core.raw_mut()?.commit(flags)?;
        core.schema_changed = false;
        debug!(txn = %core.name, ?flags, "transaction committed");
        Ok(())
    }

    /// Aborts, closing every handle including held ones and dropping all
    /// sorts. A nested transaction aborts its parent too.
    pub fn abort(&self) -> Result<(), AccessError> {
        self.core.lock().abort(&self.shared)
    }

    /// Ends the transaction for good. Later calls fail with
    /// `TransactionClosed`.
    pub fn destroy(&self) -> Result<(), AccessError> {
        self.core.lock().destroy(&self.shared)
    }

    pub fn set_savepoint(&self, name: &str) -> Result<usize, AccessError> {
        self.core.lock().raw_mut()?.set_savepoint(name)
    }

    pub fn release_savepoint(&self, name: &str) -> Result<usize, AccessError> {
        self.core.lock().raw_mut()?.release_savepoint(name)
    }

    /// Rolls back to `name`. Open scans may be positioned on undone rows, so
    /// `close_controllers` closes every handle first.
    pub fn rollback_to_savepoint(&self, name: &str, close_controllers: bool) -> Result<usize, AccessError> {
        let mut core = self.core.lock();
        core.raw_mut()?;
        if close_controllers {
            core.close_controllers(true)?;
        }
        let depth = core.raw_mut()?.rollback_to_savepoint(name)?;
        core.invalidate_if_schema_changed(&self.shared);
        Ok(depth)
    }

    /// Child transaction sharing this one's lock space and temporary
    /// conglomerates. Children cannot nest further.
    pub fn start_nested_user_transaction(&self, read_only: bool) -> Result<Transaction, AccessError> {
        let core = self.core.lock();
        if core.kind == TransactionKind::Nested {
            return Err(AccessError::ProtocolViolation(
                "nested transactions cannot start further nested transactions".into(),
            ));
        }
        if core.aborted_by_child {
            return Err(AccessError::TransactionAborted);
        }
        let space = core.raw()?.compatibility_space();
        let raw = self.shared.raw.start_nested_transaction(space, read_only)?;
        let child = TxCore::new(
            format!("{}/nested", core.name),
            TransactionKind::Nested,
            raw,
            Some(Arc::clone(&self.core)),
            Arc::clone(&core.temp),
        );
        Ok(Transaction {
            shared: Arc::clone(&self.shared),
            core: Arc::new(Mutex::new(child)),
        })
    }

    /// Independent transaction with its own lock space, for work that must
    /// commit regardless of this one.
    pub fn get_internal_transaction(&self) -> Result<Transaction, AccessError> {
        self.core.lock().raw()?;
        let raw = self.shared.raw.start_internal_transaction()?;
        Ok(Transaction::new(
            Arc::clone(&self.shared),
            "InternalTransaction",
            TransactionKind::Internal,
            raw,
        ))
    }

    // ---- global transactions ----

    /// Makes this local transaction a branch of `xid`, keeping its work.
    pub fn create_xa_transaction_from_local(&self, xid: GlobalXid) -> Result<(), AccessError> {
        let mut core = self.core.lock();
        if core.kind != TransactionKind::User {
            return Err(AccessError::ProtocolViolation(format!(
                "cannot convert a {:?} transaction to a global one",
                core.kind
            )));
        }
        core.raw_mut()?.bind_global(xid)?;
        core.kind = TransactionKind::Global;
        Ok(())
    }

    pub fn xa_prepare(&self) -> Result<XaPrepareOutcome, AccessError> {
        let mut core = self.core.lock();
        core.raw_mut()?;
        core.close_controllers(false)?;
        let outcome = core.raw_mut()?.xa_prepare()?;
        if outcome == XaPrepareOutcome::ReadOnly {
            core.schema_changed = false;
        }
        Ok(outcome)
    }

    pub fn xa_commit(&self, one_phase: bool) -> Result<(), AccessError> {
        let mut core = self.core.lock();
        core.raw_mut()?;
        core.close_controllers(false)?;
        core.raw_mut()?.xa_commit(one_phase)?;
        core.schema_changed = false;
        Ok(())
    }

    pub fn xa_rollback(&self) -> Result<(), AccessError> {
        let mut core = self.core.lock();
        core.raw_mut()?;
        core.invalidate_if_schema_changed(&self.shared);
        if let Err(err) = core.close_controllers(true) {
            debug!(txn = %core.name, error = %err, "rollback continued past close failure");
        }
        let result = core.raw_mut()?.xa_rollback();
        core.invalidate_if_schema_changed(&self.shared);
        core.schema_changed = false;
        result
    }

    // ---- properties ----

    pub fn get_property(&self, key: &str) -> Result<Option<Value>, AccessError> {
        let mut core = self.core.lock();
        self.shared.properties.get(core.raw_mut()?, key)
    }

    pub fn get_property_default(&self, key: &str) -> Result<Option<Value>, AccessError> {
        let mut core = self.core.lock();
        self.shared.properties.get_default(core.raw_mut()?, key)
    }

    pub fn get_properties(&self) -> Result<PropertyMap, AccessError> {
        let mut core = self.core.lock();
        self.shared.properties.get_properties(core.raw_mut()?)
    }

    pub fn property_default_is_visible(&self, key: &str) -> Result<bool, AccessError> {
        let mut core = self.core.lock();
        self.shared
            .properties
            .property_default_is_visible(core.raw_mut()?, key)
    }

    /// Sets or, with `None`, removes a property. Held under the property
    /// store's exclusive lock until this transaction ends.
    pub fn set_property(&self, key: &str, value: Option<Value>, db_only: bool) -> Result<(), AccessError> {
        let mut core = self.core.lock();
        self.shared.properties.set(core.raw_mut()?, key, value, db_only)
    }

    pub fn set_property_default(&self, key: &str, value: Option<Value>) -> Result<(), AccessError> {
        let mut core = self.core.lock();
        self.shared.properties.set_default(core.raw_mut()?, key, value)
    }

    pub fn lock_property_store(&self) -> Result<(), AccessError> {
        let mut core = self.core.lock();
        self.shared.properties.lock(core.raw_mut()?)
    }

    // ---- introspection ----

    pub fn count_opens(&self, which: OpenCount) -> usize {
        let core = self.core.lock();
        let open = &core.open;
        match which {
            OpenCount::Conglomerates => open.controllers.len(),
            OpenCount::Scans => open.scans.len(),
            OpenCount::CreatedSorts => core.sorts.live(),
            OpenCount::SortControllers => open.sort_controllers.len(),
            OpenCount::Total => {
                open.controllers.len()
                    + open.scans.len()
                    + core.sorts.live()
                    + open.sort_controllers.len()
            }
        }
    }

    /// One line per open handle.
    pub fn debug_opened(&self) -> String {
        let core = self.core.lock();
        let mut out = String::new();
        for (handle, controller) in &core.open.controllers {
            let _ = writeln!(
                out,
                "controller#{handle}: conglomerate {} held={}",
                controller.conglomerate_id(),
                controller.is_held()
            );
        }
        for (handle, scan) in &core.open.scans {
            let _ = match scan {
                OpenScan::Conglomerate { scan, group_fetch } => writeln!(
                    out,
                    "scan#{handle}: conglomerate {} held={} group_fetch={group_fetch} visited={}",
                    scan.conglomerate_id(),
                    scan.is_held(),
                    scan.rows_visited()
                ),
                OpenScan::Sort { scan, sort, hold } => writeln!(
                    out,
                    "scan#{handle}: {sort} held={hold} returned={}",
                    scan.rows_returned()
                ),
            };
        }
        for (slot, sort) in core.sorts.slots.iter().enumerate() {
            if let Some(sort) = sort {
                let _ = writeln!(
                    out,
                    "sort#{slot}: rows={} complete={}",
                    sort.rows_inserted(),
                    sort.inserts_complete()
                );
            }
        }
        for (handle, sort) in &core.open.sort_controllers {
            let _ = writeln!(out, "sort-controller#{handle}: {sort}");
        }
        out
    }

    pub fn is_idle(&self) -> bool {
        let core = self.core.lock();
        core.raw().map(|raw| raw.is_idle()).unwrap_or(true)
    }

    pub fn is_pristine(&self) -> bool {
        let core = self.core.lock();
        core.raw().map(|raw| raw.is_pristine()).unwrap_or(true)
    }

    pub fn is_global(&self) -> bool {
        let core = self.core.lock();
        core.raw()
            .map(|raw| raw.global_xid().is_some())
            .unwrap_or(false)
    }

    pub fn is_destroyed(&self) -> bool {
        self.core.lock().raw.is_none()
    }

    pub fn anyone_blocked(&self) -> bool {
        self.shared.raw.lock_manager().anyone_blocked()
    }

    pub fn transaction_id_string(&self) -> Result<String, AccessError> {
        Ok(self.core.lock().raw()?.id_string())
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.core.lock();
        f.debug_struct("Transaction")
            .field("name", &core.name)
            .field("kind", &core.kind)
            .field("destroyed", &core.raw.is_none())
            .field("schema_changed", &core.schema_changed)
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let mut core = self.core.lock();
        if core.raw.is_some()
            && let Err(err) = core.destroy(&self.shared)
        {
            warn!(txn = %core.name, error = %err, "transaction cleanup on drop failed");
        }
    }
}

fn exclusive_table_policy() -> LockingPolicy {
    LockingPolicy::new(Granularity::Table, IsolationLevel::Serializable)
}
