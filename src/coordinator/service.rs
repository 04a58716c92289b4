//! Coordination service operations
//!
//! The request-facing core consumed by external storage/compute nodes:
//! identifier generation, named counter increments, and partition epoch
//! allocation. Each operation routes to the counter's committed owner,
//! acquires ownership lazily on first touch, and validates the fencing
//! term before every write. Requests landing on a non-owner return
//! NotLeader with an owner hint for mechanical client-side redirect.

use crate::common::{validate_counter_id, Error, Result};
use crate::coordinator::ownership::OwnershipViolation;
use crate::coordinator::raft_node::ConsensusNode;
use crate::idgen::{clock_counter_id, IdGenerator, ScarabId};
use crate::proto;
use crate::store::{CounterStore, SparseCounterFile};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Counter state returned by GetCounter.
#[derive(Debug, Clone, Serialize)]
pub struct CounterInfo {
    pub value: u64,
    pub term: u64,
    pub owning_node: u16,
}

/// Node status for the operational surface.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node_id: u16,
    pub role: String,
    pub term: u64,
    pub leader_hint: Option<String>,
    pub owned_counters: Vec<OwnedCounter>,
    pub peers: Vec<PeerStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OwnedCounter {
    pub counter_id: String,
    pub term: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    pub node_id: u16,
    pub state: String,
}

/// The coordination service core.
pub struct CoordService {
    node_id: u16,
    public_addr: String,
    node: Arc<ConsensusNode>,
    store: Arc<CounterStore>,
    /// Grants this node holds: counter id → fencing term. Always
    /// re-validated against the committed ownership table before a write.
    grants: RwLock<HashMap<String, u64>>,
    idgen: OnceCell<IdGenerator>,
}

impl CoordService {
    pub fn new(
        node_id: u16,
        public_addr: String,
        node: Arc<ConsensusNode>,
        store: Arc<CounterStore>,
    ) -> Self {
        Self {
            node_id,
            public_addr,
            node,
            store,
            grants: RwLock::new(HashMap::new()),
            idgen: OnceCell::new(),
        }
    }

    pub fn node(&self) -> &Arc<ConsensusNode> {
        &self.node
    }

    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    /// Fencing term this node holds for a counter, if any.
    pub fn held_term(&self, counter_id: &str) -> Option<u64> {
        self.grants.read().unwrap().get(counter_id).copied()
    }

    fn node_hint(&self, node: u16) -> String {
        if node == self.node_id {
            self.public_addr.clone()
        } else {
            self.node
                .peer_http_addr(node)
                .unwrap_or_else(|| format!("node-{}", node))
        }
    }

    fn violation_to_error(&self, counter_id: &str, violation: OwnershipViolation) -> Error {
        match violation {
            OwnershipViolation::Unowned => {
                Error::Unavailable(format!("counter {} has no committed owner", counter_id))
            }
            OwnershipViolation::Stale { held, committed } => Error::StaleTerm { held, committed },
            OwnershipViolation::OwnedBy(node) => Error::NotLeader {
                owner_hint: self.node_hint(node),
            },
        }
    }

    /// Ensure this node holds the committed grant for `counter_id`,
    /// acquiring ownership lazily on first touch. Returns the counter
    /// handle and the held fencing term.
    async fn ensure_owner(&self, counter_id: &str) -> Result<(Arc<SparseCounterFile>, u64)> {
        validate_counter_id(counter_id)?;

        // Fast path: we hold a grant; validate it against the committed
        // table before every use.
        if let Some(held) = self.held_term(counter_id) {
            match self.node.validate_owner(counter_id, self.node_id, held) {
                Ok(()) => return Ok((self.store.open_counter(counter_id)?, held)),
                Err(violation) => {
                    // Fenced: drop the stale grant and surface the rejection.
                    self.grants.write().unwrap().remove(counter_id);
                    self.store.evict(counter_id);
                    return Err(self.violation_to_error(counter_id, violation));
                }
            }
        }

        // No local grant. If a committed owner exists, either redirect or
        // (if it is us, e.g. after a restart) adopt the committed term.
        if let Some(rec) = self.node.ownership(counter_id) {
            if rec.owner_node != self.node_id {
                return Err(Error::NotLeader {
                    owner_hint: self.node_hint(rec.owner_node),
                });
            }
            // Recover the durable value before serving under the grant.
            let handle = self.store.recover_counter(counter_id)?;
            handle.set_term(rec.term)?;
            self.grants
                .write()
                .unwrap()
                .insert(counter_id.to_string(), rec.term);
            return Ok((handle, rec.term));
        }

        // Unowned: ask the consensus leader for a grant.
        let resp = self
            .node
            .forward_acquire(proto::AcquireRequest {
                counter_id: counter_id.to_string(),
                candidate_id: u32::from(self.node_id),
            })
            .await?;
        if !resp.granted {
            return Err(Error::NotLeader {
                owner_hint: self.node_hint(resp.owner_node as u16),
            });
        }

        // A first grant creates the backing file; a re-grant after
        // failover must recover the existing one.
        let handle = if resp.term > 1 {
            self.store.recover_counter(counter_id)?
        } else {
            self.store.open_counter(counter_id)?
        };
        handle.set_term(resp.term)?;
        self.grants
            .write()
            .unwrap()
            .insert(counter_id.to_string(), resp.term);
        Ok((handle, resp.term))
    }

    /// Generate the next identifier for this node.
    pub async fn generate_id(&self) -> Result<ScarabId> {
        let counter_id = clock_counter_id(self.node_id);
        let (handle, _term) = self.ensure_owner(&counter_id).await?;

        let generator = self
            .idgen
            .get_or_try_init(|| IdGenerator::new(self.node_id, handle.clone()))?;
        generator.generate().await
    }

    /// Increment a named counter. Fully serialized per counter at the
    /// owner through a single atomic op; independent across counters.
    pub async fn increment_counter(&self, counter_id: &str, delta: u64) -> Result<(u64, u64)> {
        if delta == 0 {
            return Err(Error::InvalidConfig("delta must be positive".into()));
        }

        let (handle, term) = self.ensure_owner(counter_id).await?;
        // Fencing: re-validate right before the write becomes visible.
        self.node
            .validate_owner(counter_id, self.node_id, term)
            .map_err(|v| self.violation_to_error(counter_id, v))?;

        let value = handle.increment(delta)?;
        Ok((value, term))
    }

    /// Read a counter at its owner.
    pub async fn get_counter(&self, counter_id: &str) -> Result<CounterInfo> {
        validate_counter_id(counter_id)?;

        let rec = self
            .node
            .ownership(counter_id)
            .ok_or_else(|| Error::CounterNotFound(counter_id.to_string()))?;
        if rec.owner_node != self.node_id {
            return Err(Error::NotLeader {
                owner_hint: self.node_hint(rec.owner_node),
            });
        }

        let (handle, term) = self.ensure_owner(counter_id).await?;
        Ok(CounterInfo {
            value: handle.value(),
            term,
            owning_node: rec.owner_node,
        })
    }

    /// Allocate the next leadership epoch for a partition.
    pub async fn allocate_epoch(&self, partition_id: &str) -> Result<(u64, u64)> {
        if partition_id.is_empty() || partition_id.contains('/') {
            return Err(Error::InvalidConfig(format!(
                "invalid partition id: {}",
                partition_id
            )));
        }
        self.increment_counter(&format!("epoch/{}", partition_id), 1)
            .await
    }

    /// Operational status snapshot.
    pub fn status(&self) -> NodeStatus {
        let leader_hint = self.node.leader_id().map(|id| self.node_hint(id));
        let owned_counters = self
            .node
            .owned_by(self.node_id)
            .into_iter()
            .map(|r| OwnedCounter {
                counter_id: r.counter_id,
                term: r.term,
            })
            .collect();
        let peers = self
            .node
            .peer_states()
            .into_iter()
            .map(|(node_id, state)| PeerStatus {
                node_id,
                state: state.to_string(),
            })
            .collect();

        NodeStatus {
            node_id: self.node_id,
            role: self.node.role().to_string(),
            term: self.node.term(),
            leader_hint,
            owned_counters,
            peers,
        }
    }
}
