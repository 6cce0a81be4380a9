pub mod cache;
pub mod catalog;
pub mod config;
pub mod conglomerate;
pub mod error;
mod lib_helpers;
#[cfg(test)]
mod lib_tests;
pub mod locking;
pub mod property;
pub mod raw;
pub mod registry;
pub mod sort;
pub mod storage;
pub mod xact;

use crate::cache::{CacheStats, ConglomerateCache};
use crate::config::AccessConfig;
use crate::conglomerate::btree::BTreeFactory;
use crate::conglomerate::heap::HeapFactory;
use crate::error::AccessError;
use crate::lib_helpers::*;
use crate::locking::lock_manager::LockManager;
use crate::locking::{Granularity, LockingPolicyTable};
use crate::property::PropertyStore;
use crate::property::validation::{LockWaitTimeoutCallback, RowLockingCallback};
use crate::raw::image::BackupManifest;
use crate::raw::memory::{MemoryRawStore, MemoryStoreOptions};
use crate::raw::RawStore;
use crate::registry::{AccessMethod, ConglomerateRegistry, FactoryProvider};
use crate::sort::ExternalSortFactory;
use crate::xact::xa::GlobalXid;
use crate::xact::{Transaction, TransactionKind};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;
use uuid::Uuid;

pub use crate::catalog::types::{ColumnOrdering, ColumnType, Row, RowLocation, Value};
pub use crate::catalog::{ConglomerateId, ConglomerateProperties};
pub use crate::conglomerate::{CompareOp, OpenMode, Qualifier, ScanOperator, ScanSpec};
pub use crate::locking::IsolationLevel;
pub use crate::raw::CommitFlags;

const USER_TRANSACTION_NAME: &str = "UserTransaction";

/// State shared by the access manager and every transaction it hands out.
pub(crate) struct AccessShared {
    pub(crate) config: AccessConfig,
    pub(crate) raw: Arc<dyn RawStore>,
    pub(crate) cache: ConglomerateCache,
    pub(crate) registry: ConglomerateRegistry,
    pub(crate) policies: LockingPolicyTable,
    pub(crate) properties: PropertyStore,
}

/// Entry point: boots raw storage, the conglomerate cache, the locking
/// policies and the property store, then hands out transactions.
pub struct AccessManager {
    shared: Arc<AccessShared>,
    shut_down: AtomicBool,
}

impl AccessManager {
    /// Boots over the in-memory raw store, reloading `config.data_dir` when
    /// it holds a checkpoint image.
    pub fn boot(config: AccessConfig) -> Result<Self, AccessError> {
        validate_config(&config)?;
        let raw = MemoryRawStore::open(MemoryStoreOptions {
            data_dir: config.data_dir.clone(),
            read_only: config.read_only,
            lock_wait_timeout: config.lock_wait_timeout(),
        })?;
        Self::boot_with_store(config, Arc::new(raw))
    }

    pub fn boot_with_store(config: AccessConfig, raw: Arc<dyn RawStore>) -> Result<Self, AccessError> {
        validate_config(&config)?;
        property::secret::boot(raw.as_ref(), config.boot_password())?;

        let registry = ConglomerateRegistry::new();
        registry.register(AccessMethod::Conglomerate(Arc::new(HeapFactory)))?;
        registry.register(AccessMethod::Conglomerate(Arc::new(BTreeFactory)))?;
        registry.register(AccessMethod::Sort(Arc::new(ExternalSortFactory::new(
            config.sort_buffer_rows,
        ))))?;

        let cache = ConglomerateCache::new(config.conglomerate_cache_capacity);
        // Table locking until the persistent rowLocking setting can be read.
        let policies = LockingPolicyTable::build(raw.as_ref(), Granularity::Table);

        let properties = PropertyStore::boot(Arc::clone(&raw), &registry, &cache, &config)?;
        properties.add_callback(Arc::new(RowLockingCallback));
        properties.add_callback(Arc::new(LockWaitTimeoutCallback::new(
            Arc::clone(raw.lock_manager()),
            config.lock_wait_timeout(),
        )));

        let settings = read_boot_settings(raw.as_ref(), &properties, &config)?;
        let granularity = if settings.row_locking {
            Granularity::Record
        } else {
            Granularity::Table
        };
        policies.set_system_granularity(granularity);
        raw.lock_manager().set_wait_timeout(settings.lock_wait_timeout);

        info!(
            row_locking = settings.row_locking,
            lock_wait_timeout_ms = settings.lock_wait_timeout.as_millis() as u64,
            properties_conglomerate = %properties.conglomerate_id(),
            max_container_id = raw.max_container_id(),
            read_only = raw.is_read_only(),
            "access manager booted"
        );

        Ok(Self {
            shared: Arc::new(AccessShared {
                config,
                raw,
                cache,
                registry,
                policies,
                properties,
            }),
            shut_down: AtomicBool::new(false),
        })
    }

    fn ensure_running(&self) -> Result<(), AccessError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(AccessError::IllegalState("access manager has been shut down".into()));
        }
        Ok(())
    }

    pub fn config(&self) -> &AccessConfig {
        &self.shared.config
    }

    pub fn get_transaction(&self) -> Result<Transaction, AccessError> {
        self.get_and_name_transaction(USER_TRANSACTION_NAME)
    }

    pub fn get_and_name_transaction(&self, name: &str) -> Result<Transaction, AccessError> {
        self.ensure_running()?;
        let raw = self.shared.raw.start_user_transaction(self.shared.raw.is_read_only())?;
        Ok(Transaction::new(
            Arc::clone(&self.shared),
            name,
            TransactionKind::User,
            raw,
        ))
    }

    pub fn get_read_only_transaction(&self, name: &str) -> Result<Transaction, AccessError> {
        self.ensure_running()?;
        let raw = self.shared.raw.start_user_transaction(true)?;
        Ok(Transaction::new(
            Arc::clone(&self.shared),
            name,
            TransactionKind::User,
            raw,
        ))
    }

    /// New branch of the global transaction `xid`. Fails with
    /// `AlreadyExists` while another branch with the same id is active.
    pub fn start_xa_transaction(&self, xid: GlobalXid) -> Result<Transaction, AccessError> {
        self.ensure_running()?;
        let name = format!("XATransaction({xid})");
        let raw = self.shared.raw.start_global_transaction(xid)?;
        Ok(Transaction::new(
            Arc::clone(&self.shared),
            name,
            TransactionKind::Global,
            raw,
        ))
    }

    pub fn register_access_method(&self, method: AccessMethod) -> Result<(), AccessError> {
        self.shared.registry.register(method)
    }

    pub fn register_factory_provider(&self, provider: Arc<dyn FactoryProvider>) {
        self.shared.registry.register_provider(provider);
    }

    pub fn find_method_factory(&self, implementation: &str) -> Result<AccessMethod, AccessError> {
        self.shared.registry.resolve_by_name(implementation)
    }

    pub fn find_method_factory_by_format(&self, format: &Uuid) -> Result<AccessMethod, AccessError> {
        self.shared.registry.resolve_by_format(format)
    }

    pub fn system_granularity(&self) -> Granularity {
        self.shared.policies.system_granularity()
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        self.shared.raw.lock_manager()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.shared.cache.stats()
    }

    pub fn property_conglomerate(&self) -> ConglomerateId {
        self.shared.properties.conglomerate_id()
    }

    pub fn is_read_only(&self) -> bool {
        self.shared.raw.is_read_only()
    }

    pub fn freeze(&self) -> Result<(), AccessError> {
        self.ensure_running()?;
        self.shared.raw.freeze()
    }

    pub fn unfreeze(&self) -> Result<(), AccessError> {
        self.ensure_running()?;
        self.shared.raw.unfreeze()
    }

    pub fn checkpoint(&self) -> Result<(), AccessError> {
        self.ensure_running()?;
        self.shared.raw.checkpoint()
    }

    pub fn backup(&self, dir: &Path, wait: bool) -> Result<BackupManifest, AccessError> {
        self.ensure_running()?;
        self.shared.raw.backup(dir, wait)
    }

    pub fn wait_for_post_commit_to_finish(&self) -> Result<(), AccessError> {
        self.shared.raw.wait_for_post_commit_to_finish()
    }

    /// Shuts down the cache and the raw store. Transactions still alive
    /// fail on their next cache miss.
    pub fn shutdown(&self) -> Result<(), AccessError> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.cache.shutdown();
        self.shared.raw.shutdown()?;
        info!("access manager shut down");
        Ok(())
    }
}

impl Drop for AccessManager {
    fn drop(&mut self) {
        if !self.shut_down.load(Ordering::Acquire)
            && let Err(err) = self.shutdown()
        {
            tracing::warn!(error = %err, "access manager shutdown on drop failed");
        }
    }
}
