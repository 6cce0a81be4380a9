pub mod image;
pub mod memory;

use crate::catalog::ContainerKey;
use crate::catalog::types::Row;
use crate::error::AccessError;
use crate::locking::lock_manager::{CompatibilitySpace, LockGroup, LockManager, LockMode, Lockable, WaitPolicy};
use crate::locking::{Granularity, IsolationLevel, LockingPolicy};
use crate::raw::image::BackupManifest;
use crate::storage::encoded_key::EncodedKey;
use crate::xact::xa::{GlobalXid, XaPrepareOutcome};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

bitflags::bitflags! {
    /// Options for `commit_no_sync`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CommitFlags: u32 {
        const RELEASE_LOCKS = 0x01;
        /// Commit the work but keep every transaction-duration lock.
        const KEEP_LOCKS = 0x02;
        /// The transaction is known to have done no updates; committing one
        /// that has is a protocol violation.
        const READONLY_TRANSACTION_INITIALIZATION = 0x04;
    }
}

/// Deferred action queued by a transaction and run after it commits.
pub trait PostCommitWork: Send {
    fn describe(&self) -> String;
    fn perform(self: Box<Self>) -> Result<(), AccessError>;
}

pub type KeyRange = (Bound<EncodedKey>, Bound<EncodedKey>);

/// True when no key can fall inside `range`, including inverted ranges.
pub fn range_is_empty(range: &KeyRange) -> bool {
    use Bound::{Excluded, Included};
    match (&range.0, &range.1) {
        (Included(lo), Included(hi)) => lo > hi,
        (Included(lo), Excluded(hi)) | (Excluded(lo), Included(hi)) | (Excluded(lo), Excluded(hi)) => {
            lo >= hi
        }
        _ => false,
    }
}

/// Page-level storage engine as seen from the access layer.
pub trait RawStore: Send + Sync {
    fn lock_manager(&self) -> &Arc<LockManager>;

    fn new_locking_policy(&self, granularity: Granularity, isolation: IsolationLevel) -> LockingPolicy {
        LockingPolicy::new(granularity, isolation)
    }

    fn start_user_transaction(&self, read_only: bool) -> Result<Box<dyn RawTransaction>, AccessError>;

    /// Child transaction running in `space`, so it never waits on its
    /// parent's locks.
    fn start_nested_transaction(
        &self,
        space: CompatibilitySpace,
        read_only: bool,
    ) -> Result<Box<dyn RawTransaction>, AccessError>;

    fn start_internal_transaction(&self) -> Result<Box<dyn RawTransaction>, AccessError>;

    fn start_global_transaction(&self, xid: GlobalXid) -> Result<Box<dyn RawTransaction>, AccessError>;

    /// Largest persistent container id ever created, or -1 for an empty store.
    fn max_container_id(&self) -> i64;

    /// Metadata of a live container, read outside any transaction.
    fn container_metadata(&self, key: ContainerKey) -> Result<Option<Vec<u8>>, AccessError>;

    /// Rows of a persistent container as of its last commit, read without
    /// taking locks. `Ok(None)` when no committed container exists.
    fn committed_rows(&self, key: ContainerKey) -> Result<Option<Vec<Row>>, AccessError>;

    fn service_property(&self, key: &str) -> Option<String>;
    fn set_service_property(&self, key: &str, value: Option<String>) -> Result<(), AccessError>;
    fn service_properties(&self) -> BTreeMap<String, String>;

    fn is_read_only(&self) -> bool;
    fn is_frozen(&self) -> bool;
    fn freeze(&self) -> Result<(), AccessError>;
    fn unfreeze(&self) -> Result<(), AccessError>;
    fn checkpoint(&self) -> Result<(), AccessError>;
    fn backup(&self, dir: &Path, wait: bool) -> Result<BackupManifest, AccessError>;
    fn wait_for_post_commit_to_finish(&self) -> Result<(), AccessError>;
    fn shutdown(&self) -> Result<(), AccessError>;
}

/// One raw transaction. All lifecycle calls are all-or-nothing.
pub trait RawTransaction: Send {
    fn id(&self) -> u64;

    fn id_string(&self) -> String {
        self.id().to_string()
    }

    fn compatibility_space(&self) -> CompatibilitySpace;
    fn lock_manager(&self) -> Arc<LockManager>;
    fn new_lock_group(&self) -> LockGroup;

    /// `group: None` means the transaction-duration group.
    fn lock_object(
        &mut self,
        group: Option<LockGroup>,
        lockable: &Lockable,
        mode: LockMode,
        wait: WaitPolicy,
    ) -> Result<(), AccessError>;
    fn unlock_object(
        &mut self,
        group: Option<LockGroup>,
        lockable: &Lockable,
        mode: LockMode,
    ) -> Result<(), AccessError>;
    fn release_lock_group(&mut self, group: LockGroup) -> Result<(), AccessError>;
    fn is_lock_held(&self, lockable: &Lockable, mode: LockMode) -> bool;

    fn create_container(&mut self, key: ContainerKey, metadata: Vec<u8>) -> Result<(), AccessError>;
    fn new_temp_container_key(&mut self) -> ContainerKey;
    fn drop_container(&mut self, key: ContainerKey) -> Result<(), AccessError>;
    fn container_metadata(&self, key: ContainerKey) -> Result<Vec<u8>, AccessError>;
    fn update_container_metadata(&mut self, key: ContainerKey, metadata: Vec<u8>) -> Result<(), AccessError>;

    fn next_record_id(&mut self, key: ContainerKey) -> Result<u64, AccessError>;
    /// Returns false, writing nothing, when `record` already exists.
    fn insert_record(&mut self, key: ContainerKey, record: EncodedKey, row: Row) -> Result<bool, AccessError>;
    fn fetch_record(&self, key: ContainerKey, record: &EncodedKey) -> Result<Option<Row>, AccessError>;
    fn replace_record(&mut self, key: ContainerKey, record: &EncodedKey, row: Row) -> Result<bool, AccessError>;
    fn delete_record(&mut self, key: ContainerKey, record: &EncodedKey) -> Result<bool, AccessError>;
    fn scan_keys(&self, key: ContainerKey, range: KeyRange) -> Result<Vec<EncodedKey>, AccessError>;

    fn set_savepoint(&mut self, name: &str) -> Result<usize, AccessError>;
    fn release_savepoint(&mut self, name: &str) -> Result<usize, AccessError>;
    fn rollback_to_savepoint(&mut self, name: &str) -> Result<usize, AccessError>;

    fn commit(&mut self, flags: CommitFlags) -> Result<(), AccessError>;
    fn abort(&mut self) -> Result<(), AccessError>;
    /// Aborts outstanding work and releases every lock. The transaction is
    /// unusable afterwards.
    fn destroy(&mut self) -> Result<(), AccessError>;
    fn add_post_commit_work(&mut self, work: Box<dyn PostCommitWork>);

    /// No updates since the last commit or abort.
    fn is_idle(&self) -> bool;
    /// Nothing at all, not even a lock, since the last commit or abort.
    fn is_pristine(&self) -> bool;
    fn is_read_only(&self) -> bool;

    fn global_xid(&self) -> Option<&GlobalXid>;
    /// Turns a local transaction into a branch of `xid`, keeping its work and
    /// locks.
    fn bind_global(&mut self, xid: GlobalXid) -> Result<(), AccessError>;
    fn xa_prepare(&mut self) -> Result<XaPrepareOutcome, AccessError>;
    fn xa_commit(&mut self, one_phase: bool) -> Result<(), AccessError>;
    fn xa_rollback(&mut self) -> Result<(), AccessError>;
}
