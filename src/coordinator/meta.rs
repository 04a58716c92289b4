//! Consensus metadata store using RocksDB
//!
//! Stores:
//! - Hard state (current term, voted-for), persisted before any vote or
//!   term change becomes visible to peers
//! - The ownership log
//! - The committed ownership table and commit index

use crate::common::Result;
use crate::coordinator::ownership::{LogEntry, OwnershipRecord};
use rocksdb::{Options, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;

const CF_STATE: &str = "state";
const CF_LOG: &str = "log";
const CF_OWNERSHIP: &str = "ownership";

const KEY_HARD_STATE: &[u8] = b"hard_state";
const KEY_COMMIT_INDEX: &[u8] = b"commit_index";

/// Consensus hard state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<u16>,
}

/// Metadata store
pub struct MetaStore {
    db: DB,
}

impl MetaStore {
    /// Open or create the metadata store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, vec![CF_STATE, CF_LOG, CF_OWNERSHIP])?;

        Ok(Self { db })
    }

    // === Hard state ===

    pub fn load_hard_state(&self) -> Result<HardState> {
        let cf = self.db.cf_handle(CF_STATE).unwrap();
        match self.db.get_cf(cf, KEY_HARD_STATE)? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map_err(|e| crate::Error::MetadataCorrupted(e.to_string())),
            None => Ok(HardState::default()),
        }
    }

    pub fn save_hard_state(&self, state: &HardState) -> Result<()> {
        let cf = self.db.cf_handle(CF_STATE).unwrap();
        let value = bincode::serialize(state)
            .map_err(|e| crate::Error::Internal(format!("Serialize error: {}", e)))?;
        self.db.put_cf(cf, KEY_HARD_STATE, value)?;
        Ok(())
    }

    pub fn commit_index(&self) -> Result<u64> {
        let cf = self.db.cf_handle(CF_STATE).unwrap();
        match self.db.get_cf(cf, KEY_COMMIT_INDEX)? {
            Some(bytes) if bytes.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                Ok(u64::from_be_bytes(buf))
            }
            Some(_) => Err(crate::Error::MetadataCorrupted(
                "commit index has wrong width".into(),
            )),
            None => Ok(0),
        }
    }

    pub fn set_commit_index(&self, index: u64) -> Result<()> {
        let cf = self.db.cf_handle(CF_STATE).unwrap();
        self.db.put_cf(cf, KEY_COMMIT_INDEX, index.to_be_bytes())?;
        Ok(())
    }

    // === Ownership log ===

    /// Append one log entry, keyed by big-endian index for ordered scans.
    pub fn append_entry(&self, entry: &LogEntry) -> Result<()> {
        let cf = self.db.cf_handle(CF_LOG).unwrap();
        let value = bincode::serialize(entry)
            .map_err(|e| crate::Error::Internal(format!("Serialize error: {}", e)))?;
        self.db.put_cf(cf, entry.index.to_be_bytes(), value)?;
        Ok(())
    }

    /// Delete all entries at and above `index`.
    pub fn truncate_log_from(&self, index: u64) -> Result<()> {
        let cf = self.db.cf_handle(CF_LOG).unwrap();
        let from = index.to_be_bytes();
        let iter = self.db.iterator_cf(
            cf,
            rocksdb::IteratorMode::From(&from, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, _) = item?;
            self.db.delete_cf(cf, key)?;
        }
        Ok(())
    }

    /// Load the whole log in index order.
    pub fn load_log(&self) -> Result<Vec<LogEntry>> {
        let cf = self.db.cf_handle(CF_LOG).unwrap();
        let iter = self.db.iterator_cf(cf, rocksdb::IteratorMode::Start);

        let mut entries = Vec::new();
        for item in iter {
            let (_, value) = item?;
            let entry: LogEntry = bincode::deserialize(&value)
                .map_err(|e| crate::Error::MetadataCorrupted(e.to_string()))?;
            entries.push(entry);
        }

        Ok(entries)
    }

    // === Committed ownership ===

    pub fn put_ownership(&self, record: &OwnershipRecord) -> Result<()> {
        let cf = self.db.cf_handle(CF_OWNERSHIP).unwrap();
        let value = bincode::serialize(record)
            .map_err(|e| crate::Error::Internal(format!("Serialize error: {}", e)))?;
        self.db.put_cf(cf, record.counter_id.as_bytes(), value)?;
        Ok(())
    }

    pub fn load_ownership(&self) -> Result<Vec<OwnershipRecord>> {
        let cf = self.db.cf_handle(CF_OWNERSHIP).unwrap();
        let iter = self.db.iterator_cf(cf, rocksdb::IteratorMode::Start);

        let mut records = Vec::new();
        for item in iter {
            let (_, value) = item?;
            let record: OwnershipRecord = bincode::deserialize(&value)
                .map_err(|e| crate::Error::MetadataCorrupted(e.to_string()))?;
            records.push(record);
        }

        Ok(records)
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(index: u64, term: u64, id: &str, node: u16, owner_term: u64) -> LogEntry {
        LogEntry {
            index,
            term,
            record: OwnershipRecord {
                counter_id: id.to_string(),
                owner_node: node,
                term: owner_term,
            },
        }
    }

    #[test]
    fn test_hard_state_roundtrip() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("meta")).unwrap();

        assert_eq!(store.load_hard_state().unwrap(), HardState::default());

        let state = HardState {
            term: 7,
            voted_for: Some(2),
        };
        store.save_hard_state(&state).unwrap();
        assert_eq!(store.load_hard_state().unwrap(), state);
    }

    #[test]
    fn test_log_append_and_truncate() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("meta")).unwrap();

        for i in 1..=5 {
            store.append_entry(&entry(i, 1, "c", 1, i)).unwrap();
        }

        let log = store.load_log().unwrap();
        assert_eq!(log.len(), 5);
        assert_eq!(log[0].index, 1);
        assert_eq!(log[4].index, 5);

        store.truncate_log_from(3).unwrap();
        let log = store.load_log().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log.last().unwrap().index, 2);
    }

    #[test]
    fn test_log_order_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta");
        {
            let store = MetaStore::open(&path).unwrap();
            // Indices straddling a byte boundary must stay ordered.
            for i in [1u64, 2, 255, 256, 300] {
                store.append_entry(&entry(i, 1, "c", 1, i)).unwrap();
            }
        }

        let store = MetaStore::open(&path).unwrap();
        let indices: Vec<u64> = store.load_log().unwrap().iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![1, 2, 255, 256, 300]);
    }

    #[test]
    fn test_ownership_roundtrip() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("meta")).unwrap();

        let rec = OwnershipRecord {
            counter_id: "epoch/p0".into(),
            owner_node: 3,
            term: 2,
        };
        store.put_ownership(&rec).unwrap();
        store.set_commit_index(9).unwrap();

        let records = store.load_ownership().unwrap();
        assert_eq!(records, vec![rec]);
        assert_eq!(store.commit_index().unwrap(), 9);
    }
}
