//! Sparse Counter Store
//!
//! Durable, crash-recoverable 64-bit counters, one sparse backing file per
//! counter id under the store directory. Counters are created lazily on
//! first open and recover instantly: the value is read straight from the
//! mapped file, with no log replay. Corruption is scoped to the affected
//! counter and never cascades.

pub mod file;

pub use file::{SparseCounterFile, ACTIVE_REGION};

use crate::common::{encode_counter_id, validate_counter_id, Error, FlushPolicy, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Store of all counters on this node.
///
/// Handles are cached; different counters operate fully independently,
/// with no lock spanning increments on distinct counters.
pub struct CounterStore {
    dir: PathBuf,
    virtual_size: u64,
    flush_policy: FlushPolicy,
    counters: RwLock<HashMap<String, Arc<SparseCounterFile>>>,
}

impl CounterStore {
    /// Open the store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl AsRef<Path>, virtual_size: u64, flush_policy: FlushPolicy) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            virtual_size,
            flush_policy,
            counters: RwLock::new(HashMap::new()),
        })
    }

    /// Deterministic backing-file path for a counter id.
    pub fn file_path(&self, counter_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.counter", encode_counter_id(counter_id)))
    }

    /// Open a counter, creating its backing file if absent.
    pub fn open_counter(&self, counter_id: &str) -> Result<Arc<SparseCounterFile>> {
        validate_counter_id(counter_id)?;

        if let Some(handle) = self.counters.read().unwrap().get(counter_id) {
            return Ok(handle.clone());
        }

        let mut counters = self.counters.write().unwrap();
        // Re-check under the write lock.
        if let Some(handle) = counters.get(counter_id) {
            return Ok(handle.clone());
        }

        let path = self.file_path(counter_id);
        let file = if path.exists() {
            SparseCounterFile::recover(&path, counter_id, self.flush_policy)?
        } else {
            SparseCounterFile::create(&path, counter_id, self.virtual_size, self.flush_policy)?
        };
        let handle = Arc::new(file);
        counters.insert(counter_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Reopen an existing counter, replacing any cached mapping.
    ///
    /// This is the explicit recovery path a new owner runs before serving:
    /// a missing, undersized, or corrupt file fails with StorageCorruption
    /// scoped to this counter only.
    pub fn recover_counter(&self, counter_id: &str) -> Result<Arc<SparseCounterFile>> {
        validate_counter_id(counter_id)?;

        let path = self.file_path(counter_id);
        let file = SparseCounterFile::recover(&path, counter_id, self.flush_policy)?;
        let handle = Arc::new(file);
        self.counters
            .write()
            .unwrap()
            .insert(counter_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Atomic increment on a counter, creating it lazily.
    pub fn increment(&self, counter_id: &str, delta: u64) -> Result<u64> {
        self.open_counter(counter_id)?.increment(delta)
    }

    /// Current value of a counter, if its backing file exists.
    pub fn get(&self, counter_id: &str) -> Result<Option<u64>> {
        validate_counter_id(counter_id)?;

        if let Some(handle) = self.counters.read().unwrap().get(counter_id) {
            return Ok(Some(handle.value()));
        }
        if !self.file_path(counter_id).exists() {
            return Ok(None);
        }
        Ok(Some(self.open_counter(counter_id)?.value()))
    }

    /// Drop the cached handle for a counter. The next open remaps from
    /// disk; used after a counter is fenced away from this node.
    pub fn evict(&self, counter_id: &str) {
        self.counters.write().unwrap().remove(counter_id);
    }
}

impl std::fmt::Debug for CounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterStore")
            .field("dir", &self.dir)
            .field("virtual_size", &self.virtual_size)
            .field("flush_policy", &self.flush_policy)
            .finish()
    }
}
