//! Counter ownership records and the committed ownership table
//!
//! Ownership is the only state replicated through consensus: counter
//! values never travel through the log. A committed OwnershipRecord is a
//! grant: `counter_id` is served by `owner_node` under fencing term
//! `term`, and any request presented under an older term must be
//! rejected.

use crate::proto;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One ownership grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipRecord {
    pub counter_id: String,
    pub owner_node: u16,
    /// Fencing term, bumped on every ownership change.
    pub term: u64,
}

/// One entry of the replicated ownership log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// 1-based log index.
    pub index: u64,
    /// Consensus term under which the entry was appended.
    pub term: u64,
    pub record: OwnershipRecord,
}

impl From<&LogEntry> for proto::OwnershipEntry {
    fn from(entry: &LogEntry) -> Self {
        proto::OwnershipEntry {
            index: entry.index,
            term: entry.term,
            counter_id: entry.record.counter_id.clone(),
            owner_node: u32::from(entry.record.owner_node),
            owner_term: entry.record.term,
        }
    }
}

impl From<&proto::OwnershipEntry> for LogEntry {
    fn from(entry: &proto::OwnershipEntry) -> Self {
        LogEntry {
            index: entry.index,
            term: entry.term,
            record: OwnershipRecord {
                counter_id: entry.counter_id.clone(),
                owner_node: entry.owner_node as u16,
                term: entry.owner_term,
            },
        }
    }
}

/// Why a fencing check failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnershipViolation {
    /// No grant has been committed for the counter.
    Unowned,
    /// The presented term is older than the committed one.
    Stale { held: u64, committed: u64 },
    /// The counter is committed to another node.
    OwnedBy(u16),
}

/// The committed ownership table, applied from the log in index order.
#[derive(Debug, Default)]
pub struct OwnershipTable {
    records: HashMap<String, OwnershipRecord>,
}

impl OwnershipTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<OwnershipRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|r| (r.counter_id.clone(), r))
                .collect(),
        }
    }

    pub fn get(&self, counter_id: &str) -> Option<&OwnershipRecord> {
        self.records.get(counter_id)
    }

    /// Apply a committed record. Records arrive in log order, so a later
    /// record simply supersedes the grant it replaces.
    pub fn apply(&mut self, record: OwnershipRecord) {
        self.records.insert(record.counter_id.clone(), record);
    }

    /// Fencing check: does `node` hold `counter_id` under `held_term`
    /// according to the committed table?
    pub fn validate(
        &self,
        counter_id: &str,
        node: u16,
        held_term: u64,
    ) -> std::result::Result<(), OwnershipViolation> {
        match self.records.get(counter_id) {
            None => Err(OwnershipViolation::Unowned),
            Some(rec) if rec.term > held_term => Err(OwnershipViolation::Stale {
                held: held_term,
                committed: rec.term,
            }),
            Some(rec) if rec.owner_node != node => Err(OwnershipViolation::OwnedBy(rec.owner_node)),
            Some(_) => Ok(()),
        }
    }

    /// All grants held by one node.
    pub fn owned_by(&self, node: u16) -> Vec<OwnershipRecord> {
        let mut owned: Vec<_> = self
            .records
            .values()
            .filter(|r| r.owner_node == node)
            .cloned()
            .collect();
        owned.sort_by(|a, b| a.counter_id.cmp(&b.counter_id));
        owned
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, node: u16, term: u64) -> OwnershipRecord {
        OwnershipRecord {
            counter_id: id.to_string(),
            owner_node: node,
            term,
        }
    }

    #[test]
    fn test_apply_supersedes() {
        let mut table = OwnershipTable::new();
        table.apply(record("c", 1, 1));
        table.apply(record("c", 2, 2));

        let rec = table.get("c").unwrap();
        assert_eq!(rec.owner_node, 2);
        assert_eq!(rec.term, 2);
    }

    #[test]
    fn test_validate_fencing() {
        let mut table = OwnershipTable::new();
        assert_eq!(
            table.validate("c", 1, 1),
            Err(OwnershipViolation::Unowned)
        );

        table.apply(record("c", 1, 1));
        assert_eq!(table.validate("c", 1, 1), Ok(()));
        assert_eq!(
            table.validate("c", 2, 1),
            Err(OwnershipViolation::OwnedBy(1))
        );

        // A newer committed term fences the old grant, regardless of who
        // presents it.
        table.apply(record("c", 2, 2));
        assert_eq!(
            table.validate("c", 1, 1),
            Err(OwnershipViolation::Stale {
                held: 1,
                committed: 2
            })
        );
        assert_eq!(table.validate("c", 2, 2), Ok(()));
    }

    #[test]
    fn test_owned_by() {
        let mut table = OwnershipTable::new();
        table.apply(record("a", 1, 1));
        table.apply(record("b", 2, 1));
        table.apply(record("c", 1, 3));

        let owned = table.owned_by(1);
        assert_eq!(owned.len(), 2);
        assert_eq!(owned[0].counter_id, "a");
        assert_eq!(owned[1].counter_id, "c");
    }

    #[test]
    fn test_proto_roundtrip() {
        let entry = LogEntry {
            index: 7,
            term: 2,
            record: record("epoch/p0", 3, 4),
        };
        let wire: proto::OwnershipEntry = (&entry).into();
        let back: LogEntry = (&wire).into();
        assert_eq!(back, entry);
    }
}
