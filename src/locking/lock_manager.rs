use crate::catalog::ContainerKey;
use crate::error::AccessError;
use crate::storage::encoded_key::EncodedKey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    IntentShared,
    IntentExclusive,
    Shared,
    Exclusive,
}

impl LockMode {
    pub fn compatible_with(self, other: LockMode) -> bool {
        use LockMode::*;
        matches!(
            (self, other),
            (IntentShared, IntentShared)
                | (IntentShared, IntentExclusive)
                | (IntentShared, Shared)
                | (IntentExclusive, IntentShared)
                | (IntentExclusive, IntentExclusive)
                | (Shared, IntentShared)
                | (Shared, Shared)
        )
    }

    /// Whether holding `self` already grants everything `requested` would.
    pub fn covers(self, requested: LockMode) -> bool {
        use LockMode::*;
        match self {
            Exclusive => true,
            Shared => matches!(requested, Shared | IntentShared),
            IntentExclusive => matches!(requested, IntentExclusive | IntentShared),
            IntentShared => requested == IntentShared,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Lockable {
    Container(ContainerKey),
    Record(ContainerKey, EncodedKey),
    Named(String),
}

impl std::fmt::Display for Lockable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lockable::Container(key) => write!(f, "{key}"),
            Lockable::Record(key, record) => write!(f, "record {record} in {key}"),
            Lockable::Named(name) => write!(f, "lock '{name}'"),
        }
    }
}

/// Identity under which locks are granted. Locks held in the same space
/// never conflict with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompatibilitySpace(pub u64);

/// Locks released together, e.g. everything held until transaction end or
/// everything held until one controller closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockGroup(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    Timed,
    NoWait,
}

pub type ReleaseObserver = Arc<dyn Fn(&Lockable) + Send + Sync>;

#[derive(Debug, Clone)]
struct Grant {
    space: CompatibilitySpace,
    group: LockGroup,
    mode: LockMode,
    count: usize,
}

#[derive(Default)]
struct LockState {
    granted: HashMap<Lockable, Vec<Grant>>,
    waiters: usize,
}

impl LockState {
    fn grantable(&self, space: CompatibilitySpace, lockable: &Lockable, mode: LockMode) -> bool {
        self.granted.get(lockable).is_none_or(|grants| {
            grants
                .iter()
                .all(|g| g.space == space || g.mode.compatible_with(mode))
        })
    }

    fn space_holds(&self, space: CompatibilitySpace, lockable: &Lockable) -> bool {
        self.granted
            .get(lockable)
            .is_some_and(|grants| grants.iter().any(|g| g.space == space))
    }
}

pub struct LockManager {
    state: Mutex<LockState>,
    cv: Condvar,
    /// Set when a thread panicked while holding the state mutex. Afterwards
    /// every request is rejected.
    poisoned: AtomicBool,
    wait_timeout_ms: AtomicU64,
    next_id: AtomicU64,
    observers: parking_lot::RwLock<HashMap<Lockable, Vec<ReleaseObserver>>>,
}

impl LockManager {
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            cv: Condvar::new(),
            poisoned: AtomicBool::new(false),
            wait_timeout_ms: AtomicU64::new(wait_timeout.as_millis() as u64),
            next_id: AtomicU64::new(1),
            observers: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    pub fn new_space(&self) -> CompatibilitySpace {
        CompatibilitySpace(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn new_group(&self) -> LockGroup {
        LockGroup(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms.load(Ordering::Acquire))
    }

    pub fn set_wait_timeout(&self, timeout: Duration) {
        self.wait_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Release);
    }

    /// Registers a callback fired whenever some compatibility space gives up
    /// its last grant on `lockable`. Callbacks run after the state mutex is
    /// released.
    pub fn add_release_observer(&self, lockable: Lockable, observer: ReleaseObserver) {
        self.observers
            .write()
            .entry(lockable)
            .or_default()
            .push(observer);
    }

    fn state(&self) -> Result<MutexGuard<'_, LockState>, AccessError> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(AccessError::IllegalState(
                "lock manager poisoned - system in fail-safe mode".into(),
            ));
        }
        self.state.lock().map_err(|_| {
            self.poisoned.store(true, Ordering::Release);
            error!("lock manager mutex poisoned - entering fail-safe mode");
            AccessError::IllegalState("lock manager poisoned - entering fail-safe mode".into())
        })
    }

    pub fn lock(
        &self,
        space: CompatibilitySpace,
        group: LockGroup,
        lockable: &Lockable,
        mode: LockMode,
        wait: WaitPolicy,
    ) -> Result<(), AccessError> {
        let deadline = Instant::now() + self.wait_timeout();
        let mut state = self.state()?;
        loop {
            if state.grantable(space, lockable, mode) {
                let grants = state.granted.entry(lockable.clone()).or_default();
                match grants
                    .iter_mut()
                    .find(|g| g.space == space && g.group == group && g.mode == mode)
                {
                    Some(grant) => grant.count += 1,
                    None => grants.push(Grant {
                        space,
                        group,
                        mode,
                        count: 1,
                    }),
                }
                return Ok(());
            }
            let timeout = || AccessError::LockTimeout {
                lockable: lockable.to_string(),
            };
            if wait == WaitPolicy::NoWait {
                return Err(timeout());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(timeout());
            }
            debug!(lockable = %lockable, ?mode, space = space.0, "waiting for lock");
            state.waiters += 1;
            let waited = self.cv.wait_timeout(state, deadline - now);
            let (next, result) = match waited {
                Ok(pair) => pair,
                Err(_) => {
                    self.poisoned.store(true, Ordering::Release);
                    error!("lock manager poisoned during wait - entering fail-safe mode");
                    return Err(AccessError::IllegalState(
                        "lock manager poisoned - entering fail-safe mode".into(),
                    ));
                }
            };
            state = next;
            state.waiters -= 1;
            if result.timed_out() && !state.grantable(space, lockable, mode) {
                return Err(timeout());
            }
        }
    }

    /// Releases one count of a grant. Returns false when no such grant exists.
    pub fn unlock(
        &self,
        space: CompatibilitySpace,
        group: LockGroup,
        lockable: &Lockable,
        mode: LockMode,
    ) -> Result<bool, AccessError> {
        let mut state = self.state()?;
        let Some(grants) = state.granted.get_mut(lockable) else {
            return Ok(false);
        };
        let Some(pos) = grants
            .iter()
            .position(|g| g.space == space && g.group == group && g.mode == mode)
        else {
            return Ok(false);
        };
        grants[pos].count -= 1;
        if grants[pos].count == 0 {
            grants.remove(pos);
        }
        if grants.is_empty() {
            state.granted.remove(lockable);
        }
        let released = !state.space_holds(space, lockable);
        drop(state);
        self.cv.notify_all();
        if released {
            self.fire_observers(std::slice::from_ref(lockable));
        }
        Ok(true)
    }

    /// Drops every grant `space` holds in `group`. Returns the number of
    /// grants removed.
    pub fn unlock_group(
        &self,
        space: CompatibilitySpace,
        group: LockGroup,
    ) -> Result<usize, AccessError> {
        let mut state = self.state()?;
        let mut removed = 0;
        let mut touched = Vec::new();
        state.granted.retain(|lockable, grants| {
            let before = grants.len();
            grants.retain(|g| !(g.space == space && g.group == group));
            if grants.len() != before {
                removed += before - grants.len();
                if !grants.iter().any(|g| g.space == space) {
                    touched.push(lockable.clone());
                }
            }
            !grants.is_empty()
        });
        drop(state);
        if removed > 0 {
            self.cv.notify_all();
            self.fire_observers(&touched);
        }
        Ok(removed)
    }

    pub fn is_lock_held(
        &self,
        space: CompatibilitySpace,
        lockable: &Lockable,
        mode: LockMode,
    ) -> bool {
        let Ok(state) = self.state() else {
            return false;
        };
        state.granted.get(lockable).is_some_and(|grants| {
            grants
                .iter()
                .any(|g| g.space == space && g.mode.covers(mode))
        })
    }

    pub fn held_lock_count(&self, space: CompatibilitySpace) -> usize {
        let Ok(state) = self.state() else {
            return 0;
        };
        state
            .granted
            .values()
            .flat_map(|grants| grants.iter())
            .filter(|g| g.space == space)
            .count()
    }

    pub fn anyone_blocked(&self) -> bool {
        self.state().map(|s| s.waiters > 0).unwrap_or(false)
    }

    fn fire_observers(&self, released: &[Lockable]) {
        if released.is_empty() {
            return;
        }
        let callbacks: Vec<(Lockable, ReleaseObserver)> = {
            let observers = self.observers.read();
            released
                .iter()
                .filter_map(|l| observers.get(l).map(|list| (l, list)))
                .flat_map(|(l, list)| list.iter().map(move |cb| (l.clone(), Arc::clone(cb))))
                .collect()
        };
        for (lockable, callback) in callbacks {
            callback(&lockable);
        }
    }
}
