pub mod lock_manager;

use crate::catalog::ContainerKey;
use crate::error::AccessError;
use crate::locking::lock_manager::{LockGroup, LockMode, Lockable, WaitPolicy};
use crate::raw::{RawStore, RawTransaction};
use crate::storage::encoded_key::EncodedKey;
use std::sync::atomic::{AtomicU8, Ordering};

pub const ISOLATION_LEVEL_COUNT: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum IsolationLevel {
    NoLock = 0,
    ReadUncommitted = 1,
    ReadCommitted = 2,
    ReadCommittedNoHold = 3,
    RepeatableRead = 4,
    Serializable = 5,
}

impl IsolationLevel {
    pub const ALL: [IsolationLevel; ISOLATION_LEVEL_COUNT] = [
        IsolationLevel::NoLock,
        IsolationLevel::ReadUncommitted,
        IsolationLevel::ReadCommitted,
        IsolationLevel::ReadCommittedNoHold,
        IsolationLevel::RepeatableRead,
        IsolationLevel::Serializable,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    Table,
    Record,
}

impl Granularity {
    pub const MODE_RECORD: u8 = 6;
    pub const MODE_TABLE: u8 = 7;

    pub fn code(self) -> u8 {
        match self {
            Granularity::Record => Self::MODE_RECORD,
            Granularity::Table => Self::MODE_TABLE,
        }
    }
}

/// TABLE wins if either side asks for it.
pub fn determine_granularity(requested: Granularity, system_minimum: Granularity) -> Granularity {
    if requested == Granularity::Table || system_minimum == Granularity::Table {
        Granularity::Table
    } else {
        Granularity::Record
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockDuration {
    /// Held until the owning transaction commits or aborts.
    Transaction,
    /// Held until the controller that took it closes.
    Open,
    /// Released as soon as the protected read finishes.
    Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRequest {
    pub mode: LockMode,
    pub duration: LockDuration,
}

impl LockRequest {
    fn new(mode: LockMode, duration: LockDuration) -> Option<Self> {
        Some(Self { mode, duration })
    }
}

/// Which locks an open conglomerate takes, for one granularity and isolation
/// level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockingPolicy {
    granularity: Granularity,
    isolation: IsolationLevel,
}

impl LockingPolicy {
    pub fn new(granularity: Granularity, isolation: IsolationLevel) -> Self {
        Self {
            granularity,
            isolation,
        }
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn container_lock(&self, for_update: bool) -> Option<LockRequest> {
        use IsolationLevel::*;
        use LockDuration::{Open, Transaction};
        match (self.granularity, self.isolation, for_update) {
            (_, NoLock, _) => None,
            (Granularity::Table, _, true) => LockRequest::new(LockMode::Exclusive, Transaction),
            (Granularity::Table, ReadUncommitted, false) => None,
            (Granularity::Table, ReadCommitted | ReadCommittedNoHold, false) => {
                LockRequest::new(LockMode::Shared, Open)
            }
            (Granularity::Table, RepeatableRead | Serializable, false) => {
                LockRequest::new(LockMode::Shared, Transaction)
            }
            (Granularity::Record, _, true) => {
                LockRequest::new(LockMode::IntentExclusive, Transaction)
            }
            (Granularity::Record, ReadUncommitted, false) => None,
            (Granularity::Record, ReadCommitted | ReadCommittedNoHold, false) => {
                LockRequest::new(LockMode::IntentShared, Open)
            }
            (Granularity::Record, RepeatableRead, false) => {
                LockRequest::new(LockMode::IntentShared, Transaction)
            }
            (Granularity::Record, Serializable, false) => {
                LockRequest::new(LockMode::Shared, Transaction)
            }
        }
    }

    pub fn row_lock(&self, for_update: bool) -> Option<LockRequest> {
        use IsolationLevel::*;
        if self.granularity == Granularity::Table || self.isolation == NoLock {
            return None;
        }
        if for_update {
            return LockRequest::new(LockMode::Exclusive, LockDuration::Transaction);
        }
        match self.isolation {
            NoLock | ReadUncommitted => None,
            ReadCommitted | ReadCommittedNoHold => {
                LockRequest::new(LockMode::Shared, LockDuration::Instant)
            }
            RepeatableRead | Serializable => {
                LockRequest::new(LockMode::Shared, LockDuration::Transaction)
            }
        }
    }

    pub fn lock_container(
        &self,
        raw: &mut dyn RawTransaction,
        container: ContainerKey,
        for_update: bool,
        open_group: LockGroup,
        wait: WaitPolicy,
    ) -> Result<(), AccessError> {
        if container.is_temporary() {
            return Ok(());
        }
        match self.container_lock(for_update) {
            Some(request) => apply(raw, Lockable::Container(container), request, open_group, wait),
            None => Ok(()),
        }
    }

    pub fn lock_record(
        &self,
        raw: &mut dyn RawTransaction,
        container: ContainerKey,
        record: &EncodedKey,
        for_update: bool,
        open_group: LockGroup,
        wait: WaitPolicy,
    ) -> Result<(), AccessError> {
        if container.is_temporary() {
            return Ok(());
        }
        match self.row_lock(for_update) {
            Some(request) => apply(
                raw,
                Lockable::Record(container, record.clone()),
                request,
                open_group,
                wait,
            ),
            None => Ok(()),
        }
    }
}

fn apply(
    raw: &mut dyn RawTransaction,
    lockable: Lockable,
    request: LockRequest,
    open_group: LockGroup,
    wait: WaitPolicy,
) -> Result<(), AccessError> {
    match request.duration {
        LockDuration::Transaction => raw.lock_object(None, &lockable, request.mode, wait),
        LockDuration::Open => raw.lock_object(Some(open_group), &lockable, request.mode, wait),
        LockDuration::Instant => {
            raw.lock_object(Some(open_group), &lockable, request.mode, wait)?;
            raw.unlock_object(Some(open_group), &lockable, request.mode)
        }
    }
}

/// Policies for every (granularity, isolation) pair, computed once at boot,
/// plus the system-wide minimum granularity.
#[derive(Debug)]
pub struct LockingPolicyTable {
    table_level: [LockingPolicy; ISOLATION_LEVEL_COUNT],
    record_level: [LockingPolicy; ISOLATION_LEVEL_COUNT],
    system_granularity: AtomicU8,
}

impl LockingPolicyTable {
    pub fn build(raw: &dyn RawStore, system_granularity: Granularity) -> Self {
        Self {
            table_level: IsolationLevel::ALL
                .map(|level| raw.new_locking_policy(Granularity::Table, level)),
            record_level: IsolationLevel::ALL
                .map(|level| raw.new_locking_policy(Granularity::Record, level)),
            system_granularity: AtomicU8::new(system_granularity.code()),
        }
    }

    pub fn system_granularity(&self) -> Granularity {
        match self.system_granularity.load(Ordering::Acquire) {
            Granularity::MODE_RECORD => Granularity::Record,
            _ => Granularity::Table,
        }
    }

    pub fn set_system_granularity(&self, granularity: Granularity) {
        self.system_granularity
            .store(granularity.code(), Ordering::Release);
    }

    pub fn policy_for(&self, granularity: Granularity, isolation: IsolationLevel) -> LockingPolicy {
        match granularity {
            Granularity::Table => self.table_level[isolation.index()],
            Granularity::Record => self.record_level[isolation.index()],
        }
    }

    /// The policy an open actually runs under once the system minimum has
    /// been applied.
    pub fn effective_policy(
        &self,
        requested: Granularity,
        isolation: IsolationLevel,
    ) -> LockingPolicy {
        self.policy_for(
            determine_granularity(requested, self.system_granularity()),
            isolation,
        )
    }
}
