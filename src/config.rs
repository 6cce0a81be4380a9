use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

/// Runtime configuration for an access manager.
#[derive(Debug, Clone)]
pub struct AccessConfig {
    /// Upper bound on cached conglomerate descriptors. Unreferenced entries
    /// beyond this are evicted least-recently-used first.
    pub conglomerate_cache_capacity: usize,
    pub lock_wait_timeout_ms: u64,
    /// When false every open is promoted to table-level locking. The
    /// persistent `conglomdb.storage.rowLocking` property overrides this at
    /// boot.
    pub row_locking: bool,
    pub read_only: bool,
    /// Directory holding the checkpoint image. `None` keeps the store purely
    /// in memory.
    pub data_dir: Option<PathBuf>,
    /// Password protecting a newly created store. Wrapped in
    /// Arc<Zeroizing<>> so the plaintext is wiped when the last clone drops.
    pub boot_password: Option<Arc<Zeroizing<String>>>,
    /// Process-level property overrides. A key present here wins over the
    /// persistent value and is not re-applied when the persistent value
    /// changes without `db_only`.
    pub system_properties: BTreeMap<String, String>,
    pub max_id_collision_retries: usize,
    pub sort_buffer_rows: usize,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            conglomerate_cache_capacity: 300,
            lock_wait_timeout_ms: 60_000,
            row_locking: true,
            read_only: false,
            data_dir: None,
            boot_password: None,
            system_properties: BTreeMap::new(),
            max_id_collision_retries: 3,
            sort_buffer_rows: 10_000,
        }
    }
}

impl AccessConfig {
    pub fn development() -> Self {
        Self {
            lock_wait_timeout_ms: 5_000,
            ..Self::default()
        }
    }

    /// Short lock waits so contention tests fail fast instead of hanging.
    pub fn testing() -> Self {
        Self {
            conglomerate_cache_capacity: 64,
            lock_wait_timeout_ms: 250,
            ..Self::default()
        }
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_row_locking(mut self, enabled: bool) -> Self {
        self.row_locking = enabled;
        self
    }

    pub fn with_lock_wait_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.lock_wait_timeout_ms = timeout_ms;
        self
    }

    /// Sets the boot password, wrapping it in Arc<Zeroizing<>> for secure
    /// memory handling.
    pub fn with_boot_password(mut self, password: impl Into<String>) -> Self {
        self.boot_password = Some(Arc::new(Zeroizing::new(password.into())));
        self
    }

    pub fn with_system_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.system_properties.insert(key.into(), value.into());
        self
    }

    pub fn boot_password(&self) -> Option<&str> {
        self.boot_password.as_ref().map(|arc| arc.as_str())
    }
}
