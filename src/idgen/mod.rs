//! Time-ordered identifier generation
//!
//! A ScarabId is a packed 64-bit value: 41 bits of milliseconds since the
//! scarab epoch, 10 bits of node id, 13 bits of per-millisecond sequence
//! (8192 identifiers per millisecond per node).
//!
//! Each node keeps one durable "clock" counter in the Sparse Counter Store
//! holding the packed `(timestamp << 13) | sequence` pair it last issued.
//! Every new identifier must strictly exceed that value, so a restarted
//! node can never reissue an identifier, a regressing wall clock is
//! clamped to the last-emitted timestamp, and the sequence resets to zero
//! on every fresh millisecond by construction.

use crate::common::{Error, Result};
use crate::store::SparseCounterFile;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds between the Unix epoch and 2024-01-01T00:00:00Z.
pub const SCARAB_EPOCH_MS: u64 = 1_704_067_200_000;

pub const TIMESTAMP_BITS: u32 = 41;
pub const NODE_BITS: u32 = 10;
pub const SEQUENCE_BITS: u32 = 13;

pub const NODE_SHIFT: u32 = SEQUENCE_BITS;
pub const TIMESTAMP_SHIFT: u32 = NODE_BITS + SEQUENCE_BITS;

pub const TIMESTAMP_MASK: u64 = (1 << TIMESTAMP_BITS) - 1;
pub const NODE_MASK: u64 = (1 << NODE_BITS) - 1;
pub const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// Name of the durable clock counter for a node.
pub fn clock_counter_id(node_id: u16) -> String {
    format!("sys/node-{}/idgen", node_id)
}

/// A packed, globally unique, time-ordered identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScarabId(pub u64);

impl ScarabId {
    /// Pack the three fields into an identifier.
    pub fn compose(timestamp_ms: u64, node_id: u16, sequence: u16) -> Self {
        let raw = ((timestamp_ms & TIMESTAMP_MASK) << TIMESTAMP_SHIFT)
            | ((u64::from(node_id) & NODE_MASK) << NODE_SHIFT)
            | (u64::from(sequence) & SEQUENCE_MASK);
        Self(raw)
    }

    /// Milliseconds since the scarab epoch.
    pub fn timestamp_ms(&self) -> u64 {
        self.0 >> TIMESTAMP_SHIFT
    }

    pub fn node_id(&self) -> u16 {
        ((self.0 >> NODE_SHIFT) & NODE_MASK) as u16
    }

    pub fn sequence(&self) -> u16 {
        (self.0 & SEQUENCE_MASK) as u16
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ScarabId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-node identifier generator.
///
/// Strictly increasing per node; globally unique via the node-id field;
/// cross-node ordering only at millisecond granularity under bounded
/// clock skew. Sequence overflow and clock regression are absorbed here
/// and never surfaced to callers.
pub struct IdGenerator {
    node_id: u16,
    clock: Arc<SparseCounterFile>,
}

impl IdGenerator {
    pub fn new(node_id: u16, clock: Arc<SparseCounterFile>) -> Result<Self> {
        if u64::from(node_id) > NODE_MASK {
            return Err(Error::InvalidConfig(format!(
                "node_id {} exceeds the {}-bit node field",
                node_id, NODE_BITS
            )));
        }
        Ok(Self { node_id, clock })
    }

    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    /// Generate the next identifier.
    pub async fn generate(&self) -> Result<ScarabId> {
        loop {
            let now = Self::now_ms();
            let last = self.clock.value();
            let last_ts = last >> SEQUENCE_BITS;

            let candidate = if last_ts > now {
                // Clock went backwards: clamp to the last-emitted timestamp
                // and advance only the sequence.
                last + 1
            } else if last_ts == now {
                let next = last + 1;
                if next >> SEQUENCE_BITS != now {
                    // Sequence exhausted for this millisecond: wait out the
                    // tick, then retry with a fresh sequence.
                    tokio::time::sleep(Duration::from_micros(100)).await;
                    continue;
                }
                next
            } else {
                now << SEQUENCE_BITS
            };

            if candidate >> SEQUENCE_BITS > TIMESTAMP_MASK {
                return Err(Error::ResourceExhausted(
                    "identifier timestamp field exhausted".into(),
                ));
            }

            // Publish through the durable clock. Losing a race with a
            // concurrent caller on this node just means retrying.
            let prev = self.clock.advance_to(candidate)?;
            if prev >= candidate {
                continue;
            }

            let timestamp = candidate >> SEQUENCE_BITS;
            let sequence = (candidate & SEQUENCE_MASK) as u16;
            return Ok(ScarabId::compose(timestamp, self.node_id, sequence));
        }
    }

    fn now_ms() -> u64 {
        let unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        unix_ms.saturating_sub(SCARAB_EPOCH_MS)
    }
}
