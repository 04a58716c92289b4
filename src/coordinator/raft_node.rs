//! Ownership consensus node
//!
//! A small Raft-style group purpose-built for counter allocation: the
//! replicated log carries OwnershipRecords only, never counter values.
//! Election and heartbeat timers are aggressive relative to
//! general-purpose consensus (sub-100ms failover target) since the
//! replicated payload is tiny. Steady-state counter increments never
//! touch this module; it is exercised only on leadership change and on
//! ownership grants.

use crate::common::{CoordinatorConfig, Error, NodeState, PeerConfig, Result};
use crate::coordinator::meta::{HardState, MetaStore};
use crate::coordinator::ownership::{
    LogEntry, OwnershipRecord, OwnershipTable, OwnershipViolation,
};
use crate::coordinator::peer_client::PeerClient;
use crate::proto;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Consensus role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// Mutable consensus state, guarded by one lock.
struct Inner {
    role: Role,
    term: u64,
    voted_for: Option<u16>,
    leader_id: Option<u16>,
    log: Vec<LogEntry>,
    commit_index: u64,
    table: OwnershipTable,
    /// Last valid contact from a leader (or granted vote); drives the
    /// election timeout.
    last_leader_contact: Instant,
    /// Leader only: highest log index known replicated per peer.
    match_index: HashMap<u16, u64>,
    /// Leader only: last successful ack per peer, drives failover grants.
    last_ack: HashMap<u16, Instant>,
}

/// Consensus node state
pub struct ConsensusNode {
    node_id: u16,
    peers: Vec<PeerConfig>,
    clients: HashMap<u16, PeerClient>,
    meta: MetaStore,
    election_timeout: Duration,
    heartbeat_interval: Duration,
    failover_timeout: Duration,
    inner: Mutex<Inner>,
    /// Serializes grant decisions so two concurrent acquires cannot
    /// commit conflicting records under the same term.
    acquire_gate: tokio::sync::Mutex<()>,
}

impl ConsensusNode {
    /// Restore consensus state from the metadata store and join the group.
    ///
    /// A singleton group (empty peer list) holds its majority locally and
    /// elects itself immediately.
    pub fn new(config: &CoordinatorConfig, meta: MetaStore) -> Result<Arc<Self>> {
        let hard = meta.load_hard_state()?;
        let log = meta.load_log()?;
        let commit_index = meta.commit_index()?;
        let table = OwnershipTable::from_records(meta.load_ownership()?);

        let rpc_timeout = Duration::from_millis(config.election_timeout_ms);
        let clients = config
            .peers
            .iter()
            .map(|p| (p.node_id, PeerClient::new(p.grpc_addr.clone(), rpc_timeout)))
            .collect();

        let node = Arc::new(Self {
            node_id: config.node_id,
            peers: config.peers.clone(),
            clients,
            meta,
            election_timeout: Duration::from_millis(config.election_timeout_ms),
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            failover_timeout: Duration::from_millis(config.failover_timeout_ms),
            inner: Mutex::new(Inner {
                role: Role::Follower,
                term: hard.term,
                voted_for: hard.voted_for,
                leader_id: None,
                log,
                commit_index,
                table,
                last_leader_contact: Instant::now(),
                match_index: HashMap::new(),
                last_ack: HashMap::new(),
            }),
            acquire_gate: tokio::sync::Mutex::new(()),
        });

        if node.peers.is_empty() {
            node.become_leader()?;
        }

        Ok(node)
    }

    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    pub fn is_leader(&self) -> bool {
        self.inner.lock().unwrap().role == Role::Leader
    }

    pub fn role(&self) -> Role {
        self.inner.lock().unwrap().role
    }

    pub fn term(&self) -> u64 {
        self.inner.lock().unwrap().term
    }

    pub fn leader_id(&self) -> Option<u16> {
        self.inner.lock().unwrap().leader_id
    }

    /// Public HTTP address of a peer, for redirect hints.
    pub fn peer_http_addr(&self, node: u16) -> Option<String> {
        self.peers
            .iter()
            .find(|p| p.node_id == node)
            .map(|p| p.http_addr.clone())
    }

    /// Committed grant for a counter, if any.
    pub fn ownership(&self, counter_id: &str) -> Option<OwnershipRecord> {
        self.inner.lock().unwrap().table.get(counter_id).cloned()
    }

    /// Index and consensus term of the last log entry.
    pub fn last_log(&self) -> (u64, u64) {
        last_log_info(&self.inner.lock().unwrap().log)
    }

    /// Fencing check against the committed ownership table.
    pub fn validate_owner(
        &self,
        counter_id: &str,
        node: u16,
        held_term: u64,
    ) -> std::result::Result<(), OwnershipViolation> {
        self.inner
            .lock()
            .unwrap()
            .table
            .validate(counter_id, node, held_term)
    }

    /// All committed grants held by one node.
    pub fn owned_by(&self, node: u16) -> Vec<OwnershipRecord> {
        self.inner.lock().unwrap().table.owned_by(node)
    }

    /// Peer liveness as seen from this node's ack history (meaningful on
    /// the leader).
    pub fn peer_states(&self) -> Vec<(u16, NodeState)> {
        let inner = self.inner.lock().unwrap();
        self.peers
            .iter()
            .map(|p| {
                let state = match inner.last_ack.get(&p.node_id) {
                    Some(t) if t.elapsed() < self.failover_timeout => NodeState::Alive,
                    Some(t) if t.elapsed() < self.failover_timeout * 3 => NodeState::Suspect,
                    _ => NodeState::Dead,
                };
                (p.node_id, state)
            })
            .collect()
    }

    fn majority(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    pub(crate) fn jittered_election_timeout(&self) -> Duration {
        let base = self.election_timeout.as_millis() as u64;
        Duration::from_millis(base + rand::random::<u64>() % base)
    }

    pub(crate) fn leader_contact_elapsed(&self) -> Duration {
        self.inner.lock().unwrap().last_leader_contact.elapsed()
    }

    pub(crate) fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub(crate) fn has_peers(&self) -> bool {
        !self.peers.is_empty()
    }

    fn not_leader_locked(&self, inner: &Inner) -> Error {
        let owner_hint = inner
            .leader_id
            .and_then(|id| self.peer_http_addr(id))
            .unwrap_or_else(|| "unknown".to_string());
        Error::NotLeader { owner_hint }
    }

    /// Force leadership at a fresh term. Used by singleton groups, which
    /// hold their majority locally, and by tests.
    pub fn become_leader(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.term += 1;
        inner.role = Role::Leader;
        inner.leader_id = Some(self.node_id);
        inner.voted_for = Some(self.node_id);
        for p in &self.peers {
            inner.match_index.insert(p.node_id, 0);
            inner.last_ack.insert(p.node_id, Instant::now());
        }
        self.meta.save_hard_state(&HardState {
            term: inner.term,
            voted_for: inner.voted_for,
        })
    }

    /// Step down to follower
    fn step_down_locked(
        &self,
        inner: &mut MutexGuard<'_, Inner>,
        new_term: u64,
        leader_id: Option<u16>,
    ) -> Result<()> {
        if new_term > inner.term {
            inner.voted_for = None;
        }
        inner.role = Role::Follower;
        inner.term = new_term;
        inner.leader_id = leader_id;
        self.meta.save_hard_state(&HardState {
            term: inner.term,
            voted_for: inner.voted_for,
        })
    }

    /// Apply committed log entries up to `new_commit` to the ownership
    /// table and persist them.
    fn apply_committed_locked(
        &self,
        inner: &mut MutexGuard<'_, Inner>,
        new_commit: u64,
    ) -> Result<()> {
        let start = inner.commit_index;
        for index in start + 1..=new_commit {
            let record = inner.log[index as usize - 1].record.clone();
            tracing::debug!(
                counter = %record.counter_id,
                owner = record.owner_node,
                term = record.term,
                "ownership committed"
            );
            self.meta.put_ownership(&record)?;
            inner.table.apply(record);
        }
        inner.commit_index = new_commit;
        self.meta.set_commit_index(new_commit)
    }

    /// Leader: advance the commit index from replication progress.
    fn advance_leader_commit_locked(&self, inner: &mut MutexGuard<'_, Inner>) -> Result<()> {
        let majority = self.majority();
        let mut n = inner.log.len() as u64;
        while n > inner.commit_index {
            // Only entries of the current term commit by counting.
            if inner.log[n as usize - 1].term == inner.term {
                let replicas = 1 + self
                    .peers
                    .iter()
                    .filter(|p| inner.match_index.get(&p.node_id).copied().unwrap_or(0) >= n)
                    .count();
                if replicas >= majority {
                    return self.apply_committed_locked(inner, n);
                }
            }
            n -= 1;
        }
        Ok(())
    }

    /// Handle a RequestVote RPC from a candidate.
    pub fn handle_request_vote(&self, req: proto::VoteRequest) -> Result<proto::VoteResponse> {
        let mut inner = self.inner.lock().unwrap();
        let candidate = req.candidate_id as u16;

        if req.term > inner.term {
            self.step_down_locked(&mut inner, req.term, None)?;
        }

        let (last_index, last_term) = last_log_info(&inner.log);
        let log_up_to_date = req.last_log_term > last_term
            || (req.last_log_term == last_term && req.last_log_index >= last_index);

        let vote_granted = req.term == inner.term
            && log_up_to_date
            && (inner.voted_for.is_none() || inner.voted_for == Some(candidate));

        if vote_granted {
            inner.voted_for = Some(candidate);
            inner.last_leader_contact = Instant::now();
            self.meta.save_hard_state(&HardState {
                term: inner.term,
                voted_for: inner.voted_for,
            })?;
        }

        Ok(proto::VoteResponse {
            term: inner.term,
            vote_granted,
        })
    }

    /// Handle an AppendOwnership RPC (heartbeat + log replication).
    pub fn handle_append(&self, req: proto::AppendRequest) -> Result<proto::AppendResponse> {
        let mut inner = self.inner.lock().unwrap();

        if req.term < inner.term {
            return Ok(proto::AppendResponse {
                term: inner.term,
                success: false,
                conflict_index: inner.log.len() as u64,
            });
        }
        if req.term > inner.term || inner.role != Role::Follower {
            self.step_down_locked(&mut inner, req.term, Some(req.leader_id as u16))?;
        }
        inner.leader_id = Some(req.leader_id as u16);
        inner.last_leader_contact = Instant::now();

        // Log consistency check.
        if req.prev_log_index > inner.log.len() as u64 {
            return Ok(proto::AppendResponse {
                term: inner.term,
                success: false,
                conflict_index: inner.log.len() as u64,
            });
        }
        if req.prev_log_index > 0 {
            let local_term = inner.log[req.prev_log_index as usize - 1].term;
            if local_term != req.prev_log_term {
                self.meta.truncate_log_from(req.prev_log_index)?;
                inner.log.truncate(req.prev_log_index as usize - 1);
                return Ok(proto::AppendResponse {
                    term: inner.term,
                    success: false,
                    conflict_index: inner.log.len() as u64,
                });
            }
        }

        // Append new entries, truncating local conflicts.
        for entry in req.entries.iter().map(LogEntry::from) {
            let pos = entry.index as usize;
            if pos <= inner.log.len() {
                if inner.log[pos - 1].term == entry.term {
                    continue;
                }
                self.meta.truncate_log_from(entry.index)?;
                inner.log.truncate(pos - 1);
            }
            if pos != inner.log.len() + 1 {
                return Ok(proto::AppendResponse {
                    term: inner.term,
                    success: false,
                    conflict_index: inner.log.len() as u64,
                });
            }
            self.meta.append_entry(&entry)?;
            inner.log.push(entry);
        }

        // Advance our commit point to the leader's.
        let new_commit = req.leader_commit.min(inner.log.len() as u64);
        if new_commit > inner.commit_index {
            self.apply_committed_locked(&mut inner, new_commit)?;
        }

        Ok(proto::AppendResponse {
            term: inner.term,
            success: true,
            conflict_index: 0,
        })
    }

    /// Start an election and collect votes. Returns true if this node won.
    pub async fn start_election(&self) -> bool {
        let (req, term) = {
            let mut inner = self.inner.lock().unwrap();
            inner.role = Role::Candidate;
            inner.term += 1;
            inner.voted_for = Some(self.node_id);
            inner.leader_id = None;
            inner.last_leader_contact = Instant::now();
            if let Err(e) = self.meta.save_hard_state(&HardState {
                term: inner.term,
                voted_for: inner.voted_for,
            }) {
                tracing::warn!("failed to persist vote: {}", e);
                inner.role = Role::Follower;
                return false;
            }
            let (last_log_index, last_log_term) = last_log_info(&inner.log);
            (
                proto::VoteRequest {
                    term: inner.term,
                    candidate_id: u32::from(self.node_id),
                    last_log_index,
                    last_log_term,
                },
                inner.term,
            )
        };

        tracing::info!(term, "node {} starting election", self.node_id);

        let majority = self.majority();
        let mut votes = 1usize; // our own
        let mut max_term = term;

        let responses = futures_util::future::join_all(self.peers.iter().map(|peer| {
            let req = req.clone();
            async move {
                match self.clients.get(&peer.node_id) {
                    Some(client) => client.request_vote(req).await.ok(),
                    None => None,
                }
            }
        }))
        .await;
        for resp in responses.into_iter().flatten() {
            max_term = max_term.max(resp.term);
            if resp.vote_granted {
                votes += 1;
            }
        }

        let mut inner = self.inner.lock().unwrap();
        if max_term > inner.term {
            let _ = self.step_down_locked(&mut inner, max_term, None);
            return false;
        }
        if inner.term != term || inner.role != Role::Candidate {
            // Superseded while votes were in flight.
            return false;
        }
        if votes >= majority {
            inner.role = Role::Leader;
            inner.leader_id = Some(self.node_id);
            for p in &self.peers {
                inner.match_index.insert(p.node_id, 0);
                inner.last_ack.insert(p.node_id, Instant::now());
            }
            tracing::info!(term, votes, "node {} won election", self.node_id);
            true
        } else {
            inner.role = Role::Follower;
            false
        }
    }

    /// Leader: send heartbeats carrying whatever entries each follower is
    /// missing, then advance the commit index from the acks.
    pub async fn send_heartbeats(&self) {
        let batches: Vec<(u16, u64, proto::AppendRequest)> = {
            let inner = self.inner.lock().unwrap();
            if inner.role != Role::Leader {
                return;
            }
            self.peers
                .iter()
                .map(|p| {
                    let matched = inner.match_index.get(&p.node_id).copied().unwrap_or(0);
                    let prev_log_term = if matched == 0 {
                        0
                    } else {
                        inner.log[matched as usize - 1].term
                    };
                    let entries: Vec<proto::OwnershipEntry> = inner.log[matched as usize..]
                        .iter()
                        .map(Into::into)
                        .collect();
                    let sent_up_to = matched + entries.len() as u64;
                    let req = proto::AppendRequest {
                        term: inner.term,
                        leader_id: u32::from(self.node_id),
                        prev_log_index: matched,
                        prev_log_term,
                        entries,
                        leader_commit: inner.commit_index,
                    };
                    (p.node_id, sent_up_to, req)
                })
                .collect()
        };

        let acks = futures_util::future::join_all(batches.into_iter().map(
            |(peer_id, sent_up_to, req)| async move {
                match self.clients.get(&peer_id) {
                    Some(client) => (peer_id, sent_up_to, client.append_ownership(req).await.ok()),
                    None => (peer_id, sent_up_to, None),
                }
            },
        ))
        .await;

        let mut inner = self.inner.lock().unwrap();
        for (peer_id, sent_up_to, resp) in acks {
            let Some(resp) = resp else { continue };
            if resp.term > inner.term {
                tracing::info!(
                    "node {} stepping down: peer {} has term {}",
                    self.node_id,
                    peer_id,
                    resp.term
                );
                let _ = self.step_down_locked(&mut inner, resp.term, None);
                return;
            }
            if inner.role != Role::Leader {
                return;
            }
            inner.last_ack.insert(peer_id, Instant::now());
            if resp.success {
                let matched = inner.match_index.entry(peer_id).or_insert(0);
                *matched = (*matched).max(sent_up_to);
            } else {
                // Back up to what the follower reports having.
                inner
                    .match_index
                    .insert(peer_id, resp.conflict_index.min(sent_up_to));
            }
        }
        if let Err(e) = self.advance_leader_commit_locked(&mut inner) {
            tracing::warn!("failed to apply committed ownership: {}", e);
        }
    }

    /// Leader: append an ownership record and wait for a quorum.
    async fn replicate_record(&self, record: OwnershipRecord) -> Result<u64> {
        let (index, append_term) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.role != Role::Leader {
                return Err(self.not_leader_locked(&inner));
            }
            let index = inner.log.len() as u64 + 1;
            let entry = LogEntry {
                index,
                term: inner.term,
                record,
            };
            self.meta.append_entry(&entry)?;
            let term = entry.term;
            inner.log.push(entry);
            if self.peers.is_empty() {
                self.apply_committed_locked(&mut inner, index)?;
                return Ok(index);
            }
            (index, term)
        };

        for _ in 0..2 {
            self.send_heartbeats().await;
            let inner = self.inner.lock().unwrap();
            if inner.commit_index >= index
                && inner
                    .log
                    .get(index as usize - 1)
                    .map(|e| e.term == append_term)
                    .unwrap_or(false)
            {
                return Ok(index);
            }
            if inner.role != Role::Leader {
                return Err(self.not_leader_locked(&inner));
            }
        }

        Err(Error::Unavailable(
            "ownership record not acknowledged by a quorum".into(),
        ))
    }

    /// Handle an ownership acquisition request. Leader only.
    ///
    /// Grants are idempotent for the current owner; a counter whose owner
    /// is dead (no acks within the failover window) is re-granted under a
    /// fresh term, fencing the old owner.
    pub async fn handle_acquire(
        &self,
        req: proto::AcquireRequest,
    ) -> Result<proto::AcquireResponse> {
        let _gate = self.acquire_gate.lock().await;
        let candidate = req.candidate_id as u16;

        let new_term = {
            let inner = self.inner.lock().unwrap();
            if inner.role != Role::Leader {
                return Err(self.not_leader_locked(&inner));
            }
            match inner.table.get(&req.counter_id) {
                Some(rec) if rec.owner_node == candidate => {
                    return Ok(proto::AcquireResponse {
                        granted: true,
                        term: rec.term,
                        owner_node: u32::from(rec.owner_node),
                        message: String::new(),
                    });
                }
                Some(rec) => {
                    let owner_alive = rec.owner_node == self.node_id
                        || inner
                            .last_ack
                            .get(&rec.owner_node)
                            .map(|t| t.elapsed() < self.failover_timeout)
                            .unwrap_or(false);
                    if owner_alive {
                        return Ok(proto::AcquireResponse {
                            granted: false,
                            term: rec.term,
                            owner_node: u32::from(rec.owner_node),
                            message: format!(
                                "counter is owned by node {} (term {})",
                                rec.owner_node, rec.term
                            ),
                        });
                    }
                    rec.term + 1
                }
                None => 1,
            }
        };

        let record = OwnershipRecord {
            counter_id: req.counter_id.clone(),
            owner_node: candidate,
            term: new_term,
        };
        self.replicate_record(record).await?;
        tracing::info!(
            counter = %req.counter_id,
            owner = candidate,
            term = new_term,
            "ownership granted"
        );

        Ok(proto::AcquireResponse {
            granted: true,
            term: new_term,
            owner_node: req.candidate_id,
            message: String::new(),
        })
    }

    /// Route an acquisition to the consensus leader, local or remote.
    pub async fn forward_acquire(
        &self,
        req: proto::AcquireRequest,
    ) -> Result<proto::AcquireResponse> {
        if self.is_leader() {
            return self.handle_acquire(req).await;
        }
        let leader = {
            let inner = self.inner.lock().unwrap();
            match inner.leader_id {
                Some(id) if id != self.node_id => id,
                _ => return Err(Error::Unavailable("no consensus leader".into())),
            }
        };
        match self.clients.get(&leader) {
            Some(client) => client.acquire_ownership(req).await.map_err(Error::from),
            None => Err(Error::Unavailable(format!(
                "leader {} is not a configured peer",
                leader
            ))),
        }
    }
}

fn last_log_info(log: &[LogEntry]) -> (u64, u64) {
    log.last().map(|e| (e.index, e.term)).unwrap_or((0, 0))
}

/// Start consensus background tasks (elections, heartbeats)
pub fn start_consensus_tasks(node: Arc<ConsensusNode>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut election_timeout = node.jittered_election_timeout();
        let mut last_heartbeat_sent = Instant::now() - node.heartbeat_interval();

        loop {
            tokio::time::sleep(Duration::from_millis(5)).await;

            if node.is_leader() {
                if last_heartbeat_sent.elapsed() >= node.heartbeat_interval() {
                    last_heartbeat_sent = Instant::now();
                    node.send_heartbeats().await;
                }
            } else if node.has_peers() && node.leader_contact_elapsed() > election_timeout {
                if node.start_election().await {
                    last_heartbeat_sent = Instant::now();
                    node.send_heartbeats().await;
                }
                election_timeout = node.jittered_election_timeout();
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(node_id: u16, peers: Vec<PeerConfig>) -> CoordinatorConfig {
        CoordinatorConfig {
            node_id,
            peers,
            ..Default::default()
        }
    }

    fn peer(node_id: u16) -> PeerConfig {
        PeerConfig {
            node_id,
            grpc_addr: format!("http://127.0.0.1:{}", 17000 + node_id),
            http_addr: format!("http://127.0.0.1:{}", 18000 + node_id),
        }
    }

    fn singleton(dir: &std::path::Path, node_id: u16) -> Arc<ConsensusNode> {
        let meta = MetaStore::open(dir.join(format!("meta-{}", node_id))).unwrap();
        ConsensusNode::new(&test_config(node_id, Vec::new()), meta).unwrap()
    }

    fn follower(dir: &std::path::Path, node_id: u16, peers: Vec<PeerConfig>) -> Arc<ConsensusNode> {
        let meta = MetaStore::open(dir.join(format!("meta-{}", node_id))).unwrap();
        ConsensusNode::new(&test_config(node_id, peers), meta).unwrap()
    }

    #[test]
    fn test_singleton_elects_itself() {
        let dir = tempdir().unwrap();
        let node = singleton(dir.path(), 1);

        assert!(node.is_leader());
        assert_eq!(node.role(), Role::Leader);
        assert_eq!(node.term(), 1);
        assert_eq!(node.leader_id(), Some(1));
    }

    #[test]
    fn test_vote_rejected_for_stale_term() {
        let dir = tempdir().unwrap();
        let node = follower(dir.path(), 1, vec![peer(2)]);

        // Move to term 5 via an incoming vote.
        let resp = node
            .handle_request_vote(proto::VoteRequest {
                term: 5,
                candidate_id: 2,
                last_log_index: 0,
                last_log_term: 0,
            })
            .unwrap();
        assert!(resp.vote_granted);
        assert_eq!(node.term(), 5);

        // A candidate from an older term gets nothing.
        let resp = node
            .handle_request_vote(proto::VoteRequest {
                term: 3,
                candidate_id: 2,
                last_log_index: 0,
                last_log_term: 0,
            })
            .unwrap();
        assert!(!resp.vote_granted);
        assert_eq!(resp.term, 5);
    }

    #[test]
    fn test_single_vote_per_term() {
        let dir = tempdir().unwrap();
        let node = follower(dir.path(), 1, vec![peer(2), peer(3)]);

        let first = node
            .handle_request_vote(proto::VoteRequest {
                term: 2,
                candidate_id: 2,
                last_log_index: 0,
                last_log_term: 0,
            })
            .unwrap();
        assert!(first.vote_granted);

        let second = node
            .handle_request_vote(proto::VoteRequest {
                term: 2,
                candidate_id: 3,
                last_log_index: 0,
                last_log_term: 0,
            })
            .unwrap();
        assert!(!second.vote_granted);
    }

    #[test]
    fn test_vote_rejects_shorter_log() {
        let dir = tempdir().unwrap();
        let node = follower(dir.path(), 1, vec![peer(2)]);

        // Give the follower one committed entry via an append.
        node.handle_append(proto::AppendRequest {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![proto::OwnershipEntry {
                index: 1,
                term: 1,
                counter_id: "c".into(),
                owner_node: 2,
                owner_term: 1,
            }],
            leader_commit: 1,
        })
        .unwrap();

        // A candidate with an empty log must not win this node's vote.
        let resp = node
            .handle_request_vote(proto::VoteRequest {
                term: 2,
                candidate_id: 3,
                last_log_index: 0,
                last_log_term: 0,
            })
            .unwrap();
        assert!(!resp.vote_granted);
    }

    #[test]
    fn test_append_applies_committed_ownership() {
        let dir = tempdir().unwrap();
        let node = follower(dir.path(), 1, vec![peer(2)]);

        let resp = node
            .handle_append(proto::AppendRequest {
                term: 1,
                leader_id: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![proto::OwnershipEntry {
                    index: 1,
                    term: 1,
                    counter_id: "epoch/p0".into(),
                    owner_node: 2,
                    owner_term: 1,
                }],
                leader_commit: 1,
            })
            .unwrap();
        assert!(resp.success);

        let rec = node.ownership("epoch/p0").unwrap();
        assert_eq!(rec.owner_node, 2);
        assert_eq!(rec.term, 1);
        assert_eq!(node.leader_id(), Some(2));
    }

    #[test]
    fn test_stale_leader_append_rejected() {
        let dir = tempdir().unwrap();
        let node = follower(dir.path(), 1, vec![peer(2), peer(3)]);

        // Current leader is node 2 at term 2.
        node.handle_append(proto::AppendRequest {
            term: 2,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        })
        .unwrap();

        // A partitioned leader still at term 1 is refused.
        let resp = node
            .handle_append(proto::AppendRequest {
                term: 1,
                leader_id: 3,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: 0,
            })
            .unwrap();
        assert!(!resp.success);
        assert_eq!(resp.term, 2);
        assert_eq!(node.leader_id(), Some(2));
    }

    #[test]
    fn test_append_detects_log_gap() {
        let dir = tempdir().unwrap();
        let node = follower(dir.path(), 1, vec![peer(2)]);

        let resp = node
            .handle_append(proto::AppendRequest {
                term: 1,
                leader_id: 2,
                prev_log_index: 5,
                prev_log_term: 1,
                entries: vec![],
                leader_commit: 0,
            })
            .unwrap();
        assert!(!resp.success);
        assert_eq!(resp.conflict_index, 0);
    }

    #[tokio::test]
    async fn test_acquire_grants_and_is_idempotent() {
        let dir = tempdir().unwrap();
        let node = singleton(dir.path(), 1);

        let resp = node
            .handle_acquire(proto::AcquireRequest {
                counter_id: "tx".into(),
                candidate_id: 1,
            })
            .await
            .unwrap();
        assert!(resp.granted);
        assert_eq!(resp.term, 1);

        // Re-acquiring by the same owner returns the existing grant.
        let resp = node
            .handle_acquire(proto::AcquireRequest {
                counter_id: "tx".into(),
                candidate_id: 1,
            })
            .await
            .unwrap();
        assert!(resp.granted);
        assert_eq!(resp.term, 1);

        let rec = node.ownership("tx").unwrap();
        assert_eq!(rec.owner_node, 1);
        assert_eq!(rec.term, 1);
    }

    #[tokio::test]
    async fn test_acquire_rejected_while_owner_alive() {
        let dir = tempdir().unwrap();
        let node = singleton(dir.path(), 1);

        node.handle_acquire(proto::AcquireRequest {
            counter_id: "tx".into(),
            candidate_id: 1,
        })
        .await
        .unwrap();

        // Node 1 (the leader itself) is alive, so node 2 is refused.
        let resp = node
            .handle_acquire(proto::AcquireRequest {
                counter_id: "tx".into(),
                candidate_id: 2,
            })
            .await
            .unwrap();
        assert!(!resp.granted);
        assert_eq!(resp.owner_node, 1);
        assert_eq!(resp.term, 1);
    }

    #[tokio::test]
    async fn test_acquire_on_follower_redirects() {
        let dir = tempdir().unwrap();
        let node = follower(dir.path(), 1, vec![peer(2)]);

        let err = node
            .handle_acquire(proto::AcquireRequest {
                counter_id: "tx".into(),
                candidate_id: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotLeader { .. }));
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempdir().unwrap();

        {
            let node = follower(dir.path(), 1, vec![peer(2)]);
            node.handle_append(proto::AppendRequest {
                term: 3,
                leader_id: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![proto::OwnershipEntry {
                    index: 1,
                    term: 3,
                    counter_id: "tx".into(),
                    owner_node: 2,
                    owner_term: 1,
                }],
                leader_commit: 1,
            })
            .unwrap();
        }

        let node = follower(dir.path(), 1, vec![peer(2)]);
        assert_eq!(node.term(), 3);
        let rec = node.ownership("tx").unwrap();
        assert_eq!(rec.owner_node, 2);
        assert_eq!(rec.term, 1);
    }

    #[test]
    fn test_higher_term_record_fences_old_grant() {
        let dir = tempdir().unwrap();
        let node = follower(dir.path(), 1, vec![peer(2)]);

        // Term-1 grant to node 1, then a term-2 re-grant to node 2 after
        // node 1 was partitioned away.
        node.handle_append(proto::AppendRequest {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![
                proto::OwnershipEntry {
                    index: 1,
                    term: 1,
                    counter_id: "tx".into(),
                    owner_node: 1,
                    owner_term: 1,
                },
                proto::OwnershipEntry {
                    index: 2,
                    term: 1,
                    counter_id: "tx".into(),
                    owner_node: 2,
                    owner_term: 2,
                },
            ],
            leader_commit: 2,
        })
        .unwrap();

        // The old grant no longer validates.
        assert_eq!(
            node.validate_owner("tx", 1, 1),
            Err(OwnershipViolation::Stale {
                held: 1,
                committed: 2
            })
        );
        assert_eq!(node.validate_owner("tx", 2, 2), Ok(()));
    }
}
