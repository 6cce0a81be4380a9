use super::PropertyMap;
use crate::catalog::types::Value;
use crate::error::AccessError;
use crate::locking::lock_manager::LockManager;
use crate::raw::PostCommitWork;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const ROW_LOCKING: &str = "conglomdb.storage.rowLocking";
pub const LOCK_WAIT_TIMEOUT: &str = "conglomdb.locks.waitTimeout";

/// Observer consulted on every property change. `value` is `None` when the
/// property is being removed and has no default.
pub trait PropertySetCallback: Send + Sync {
    /// `Ok(false)` means the key is not this callback's concern; an error
    /// vetoes the change.
    fn validate(&self, key: &str, value: Option<&Value>, current: &PropertyMap) -> Result<bool, AccessError>;

    /// Makes the new value take effect, optionally after commit.
    fn apply(
        &self,
        _key: &str,
        _value: Option<&Value>,
        _current: &PropertyMap,
    ) -> Result<Option<Box<dyn PostCommitWork>>, AccessError> {
        Ok(None)
    }

    /// Rewrites the value before it is stored. `None` keeps it as given.
    fn map(&self, _key: &str, _value: Option<&Value>, _current: &PropertyMap) -> Result<Option<Value>, AccessError> {
        Ok(None)
    }
}

/// Outcome of running a change through every callback.
pub struct ValidatedChange {
    pub value: Option<Value>,
    pub post_commit: Vec<Box<dyn PostCommitWork>>,
}

#[derive(Default)]
pub struct PropertyValidation {
    callbacks: RwLock<Vec<Arc<dyn PropertySetCallback>>>,
}

impl PropertyValidation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_callback(&self, callback: Arc<dyn PropertySetCallback>) {
        self.callbacks.write().push(callback);
    }

    /// Validates with every interested callback; applies only when `apply`
    /// is set. Later callbacks see the value as mapped by earlier ones.
    pub fn validate_apply_and_map(
        &self,
        key: &str,
        value: Option<Value>,
        current: &PropertyMap,
        apply: bool,
    ) -> Result<ValidatedChange, AccessError> {
        let callbacks = self.callbacks.read().clone();
        let mut value = value;
        let mut post_commit = Vec::new();
        for callback in callbacks {
            if !callback.validate(key, value.as_ref(), current)? {
                continue;
            }
            if apply && let Some(work) = callback.apply(key, value.as_ref(), current)? {
                post_commit.push(work);
            }
            if let Some(mapped) = callback.map(key, value.as_ref(), current)? {
                value = Some(mapped);
            }
        }
        debug!(key, apply, deferred = post_commit.len(), "property change validated");
        Ok(ValidatedChange { value, post_commit })
    }

    pub fn validate_only(&self, key: &str, value: Option<&Value>, current: &PropertyMap) -> Result<(), AccessError> {
        let callbacks = self.callbacks.read().clone();
        for callback in callbacks {
            callback.validate(key, value, current)?;
        }
        Ok(())
    }
}

pub fn parse_bool(key: &str, value: &Value) -> Result<bool, AccessError> {
    match value {
        Value::Boolean(b) => Ok(*b),
        Value::Text(s) if s.eq_ignore_ascii_case("true") => Ok(true),
        Value::Text(s) if s.eq_ignore_ascii_case("false") => Ok(false),
        other => Err(AccessError::Validation(format!(
            "{key} must be true or false, got {other}"
        ))),
    }
}

pub fn parse_seconds(key: &str, value: &Value) -> Result<u64, AccessError> {
    let seconds = match value {
        Value::Integer(i) => *i,
        Value::Text(s) => s.trim().parse::<i64>().map_err(|_| {
            AccessError::Validation(format!("{key} must be a whole number of seconds, got '{s}'"))
        })?,
        other => {
            return Err(AccessError::Validation(format!(
                "{key} must be a whole number of seconds, got {other}"
            )));
        }
    };
    u64::try_from(seconds)
        .map_err(|_| AccessError::Validation(format!("{key} must not be negative, got {seconds}")))
}

/// `conglomdb.storage.rowLocking`. Read once at boot, so changes only need
/// to be well formed.
pub struct RowLockingCallback;

impl PropertySetCallback for RowLockingCallback {
    fn validate(&self, key: &str, value: Option<&Value>, _current: &PropertyMap) -> Result<bool, AccessError> {
        if key != ROW_LOCKING {
            return Ok(false);
        }
        if let Some(value) = value {
            parse_bool(key, value)?;
        }
        Ok(true)
    }
}

/// `conglomdb.locks.waitTimeout`, applied to the lock manager once the
/// change commits.
pub struct LockWaitTimeoutCallback {
    locks: Arc<LockManager>,
    default_timeout: Duration,
}

impl LockWaitTimeoutCallback {
    pub fn new(locks: Arc<LockManager>, default_timeout: Duration) -> Self {
        Self {
            locks,
            default_timeout,
        }
    }
}

impl PropertySetCallback for LockWaitTimeoutCallback {
    fn validate(&self, key: &str, value: Option<&Value>, _current: &PropertyMap) -> Result<bool, AccessError> {
        if key != LOCK_WAIT_TIMEOUT {
            return Ok(false);
        }
        if let Some(value) = value {
            parse_seconds(key, value)?;
        }
        Ok(true)
    }

    fn apply(
        &self,
        key: &str,
        value: Option<&Value>,
        _current: &PropertyMap,
    ) -> Result<Option<Box<dyn PostCommitWork>>, AccessError> {
        let timeout = match value {
            Some(value) => Duration::from_secs(parse_seconds(key, value)?),
            None => self.default_timeout,
        };
        Ok(Some(Box::new(SetLockWaitTimeout {
            locks: Arc::clone(&self.locks),
            timeout,
        })))
    }

    fn map(&self, key: &str, value: Option<&Value>, _current: &PropertyMap) -> Result<Option<Value>, AccessError> {
        match value {
            Some(value @ Value::Text(_)) => {
                Ok(Some(Value::Integer(parse_seconds(key, value)? as i64)))
            }
            _ => Ok(None),
        }
    }
}

struct SetLockWaitTimeout {
    locks: Arc<LockManager>,
    timeout: Duration,
}

impl PostCommitWork for SetLockWaitTimeout {
    fn describe(&self) -> String {
        format!("set lock wait timeout to {:?}", self.timeout)
    }

    fn perform(self: Box<Self>) -> Result<(), AccessError> {
        self.locks.set_wait_timeout(self.timeout);
        info!(timeout_ms = self.timeout.as_millis() as u64, "lock wait timeout changed");
        Ok(())
    }
}
