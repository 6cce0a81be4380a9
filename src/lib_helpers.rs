use super::*;
use crate::property::validation::{LOCK_WAIT_TIMEOUT, ROW_LOCKING, parse_bool, parse_seconds};
use std::time::Duration;

pub(crate) fn validate_config(config: &AccessConfig) -> Result<(), AccessError> {
    if config.conglomerate_cache_capacity == 0 {
        return Err(AccessError::InvalidConfig {
            message: "conglomerate_cache_capacity must be > 0".into(),
        });
    }
    if config.lock_wait_timeout_ms == 0 {
        return Err(AccessError::InvalidConfig {
            message: "lock_wait_timeout_ms must be > 0".into(),
        });
    }
    if config.sort_buffer_rows == 0 {
        return Err(AccessError::InvalidConfig {
            message: "sort_buffer_rows must be > 0".into(),
        });
    }
    if config.boot_password().is_some_and(str::is_empty) {
        return Err(AccessError::InvalidConfig {
            message: "boot_password must not be empty".into(),
        });
    }
    if let Some(value) = config.system_properties.get(ROW_LOCKING) {
        parse_bool(ROW_LOCKING, &Value::text(value)).map_err(|e| AccessError::InvalidConfig {
            message: e.to_string(),
        })?;
    }
    if let Some(value) = config.system_properties.get(LOCK_WAIT_TIMEOUT) {
        parse_seconds(LOCK_WAIT_TIMEOUT, &Value::text(value)).map_err(|e| {
            AccessError::InvalidConfig {
                message: e.to_string(),
            }
        })?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BootSettings {
    pub(crate) row_locking: bool,
    pub(crate) lock_wait_timeout: Duration,
}

/// Settings read once the property store is up. A system property wins over
/// the persistent one, which wins over the config field.
pub(crate) fn read_boot_settings(
    raw: &dyn RawStore,
    properties: &PropertyStore,
    config: &AccessConfig,
) -> Result<BootSettings, AccessError> {
    let mut txn = raw.start_internal_transaction()?;
    let stored_row_locking = properties.get(txn.as_mut(), ROW_LOCKING);
    let stored_timeout = properties.get(txn.as_mut(), LOCK_WAIT_TIMEOUT);
    txn.commit(CommitFlags::RELEASE_LOCKS)?;
    txn.destroy()?;

    let row_locking = match config.system_properties.get(ROW_LOCKING) {
        Some(value) => parse_bool(ROW_LOCKING, &Value::text(value))?,
        None => match stored_row_locking? {
            Some(value) => parse_bool(ROW_LOCKING, &value)?,
            None => config.row_locking,
        },
    };
    let lock_wait_timeout = match config.system_properties.get(LOCK_WAIT_TIMEOUT) {
        Some(value) => Duration::from_secs(parse_seconds(LOCK_WAIT_TIMEOUT, &Value::text(value))?),
        None => match stored_timeout? {
            Some(value) => Duration::from_secs(parse_seconds(LOCK_WAIT_TIMEOUT, &value)?),
            None => config.lock_wait_timeout(),
        },
    };
    Ok(BootSettings {
        row_locking,
        lock_wait_timeout,
    })
}
