//! The engine facade wrapped by the database coordinator.
//!
//! Owns the raft instance and its storage, exposes membership and
//! leadership views, and routes write batches to the leader,
//! forwarding over the injected dialer when this member is not it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{ClientWriteError, RaftError};
use openraft::{BasicNode, ChangeMembers};
use redb::Database;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::command::{ApplyOutcome, Batch, Row, StratusRaft, TypeConfig};
use crate::log::LogStore;
use crate::machine::{self, StateMachine};
use crate::transport::{forward_propose, Dialer, NetworkFactory, ProposeReply, StreamServer};

/// How many leader hints a forwarded proposal will chase before
/// giving up; covers a hand-off happening mid-election.
const MAX_FORWARD_HOPS: usize = 3;

/// Replication role as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineRole {
    Voter,
    Standby,
    Spare,
}

/// One member of the engine's current configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineMember {
    pub id: u64,
    pub addr: String,
    pub role: EngineRole,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("replication engine unavailable: {0}")]
    Unavailable(String),

    #[error("engine storage: {0}")]
    Storage(String),

    #[error("raft: {0}")]
    Raft(String),
}

/// Derive the engine node id from a member name.
///
/// Deterministic so the admitting leader and the joiner agree without
/// coordination: the first eight bytes of SHA-256 over the name.
pub fn node_id(name: &str) -> u64 {
    let digest = Sha256::digest(name.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().unwrap())
}

/// The replicated store facade.
#[derive(Clone)]
pub struct Engine {
    id: u64,
    addr: String,
    raft: StratusRaft,
    db: Arc<Database>,
    dialer: Arc<dyn Dialer>,
}

impl Engine {
    /// Open the engine's storage under `data_dir` and start the raft
    /// instance. Returns the engine and the server half that the
    /// endpoint layer feeds inbound streams to.
    pub async fn open(
        data_dir: &Path,
        name: &str,
        addr: &str,
        dialer: Arc<dyn Dialer>,
    ) -> Result<(Self, StreamServer), EngineError> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| EngineError::Storage(format!("create {}: {e}", data_dir.display())))?;
        let db = Arc::new(
            Database::create(data_dir.join("engine.redb"))
                .map_err(|e| EngineError::Storage(e.to_string()))?,
        );

        Self::open_with_db(db, name, addr, dialer).await
    }

    /// Start the engine on an existing database (in-memory in tests).
    pub async fn open_with_db(
        db: Arc<Database>,
        name: &str,
        addr: &str,
        dialer: Arc<dyn Dialer>,
    ) -> Result<(Self, StreamServer), EngineError> {
        let id = node_id(name);
        let log_store = LogStore::new(Arc::clone(&db)).map_err(|e| EngineError::Storage(e.to_string()))?;
        let state_machine =
            StateMachine::new(Arc::clone(&db)).map_err(|e| EngineError::Storage(e.to_string()))?;
        let network = NetworkFactory::new(Arc::clone(&dialer));

        let config = Arc::new(
            openraft::Config {
                heartbeat_interval: 500,
                election_timeout_min: 1500,
                election_timeout_max: 3000,
                ..Default::default()
            }
            .validate()
            .map_err(|e| EngineError::Raft(e.to_string()))?,
        );

        let raft = openraft::Raft::new(id, config, network, log_store, state_machine)
            .await
            .map_err(|e| EngineError::Raft(e.to_string()))?;

        info!(%name, id, %addr, "replication engine started");

        let server = StreamServer::new(raft.clone());
        Ok((
            Self {
                id,
                addr: addr.to_string(),
                raft,
                db,
                dialer,
            },
            server,
        ))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Form a new single-member cluster with this node as voter.
    pub async fn bootstrap(&self) -> Result<(), EngineError> {
        let mut members = BTreeMap::new();
        members.insert(self.id, BasicNode::new(&self.addr));
        self.raft
            .initialize(members)
            .await
            .map_err(|e| EngineError::Raft(e.to_string()))?;
        info!(id = self.id, "bootstrapped replication engine");
        Ok(())
    }

    /// Wait until a leader is known, bounded by `timeout`.
    pub async fn ready(&self, timeout: Duration) -> Result<(), EngineError> {
        self.raft
            .wait(Some(timeout))
            .metrics(|m| m.current_leader.is_some(), "leader known")
            .await
            .map(|_| ())
            .map_err(|e| EngineError::Unavailable(e.to_string()))
    }

    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.id)
    }

    /// Address of the current leader, when one is known.
    pub fn leader_addr(&self) -> Option<String> {
        let metrics = self.raft.metrics().borrow().clone();
        let leader = metrics.current_leader?;
        if leader == self.id {
            return Some(self.addr.clone());
        }
        metrics
            .membership_config
            .membership()
            .get_node(&leader)
            .map(|n| n.addr.clone())
    }

    /// The engine's current member configuration with roles.
    pub fn members(&self) -> Vec<EngineMember> {
        let metrics = self.raft.metrics().borrow().clone();
        let membership = metrics.membership_config.membership().clone();
        let voters: BTreeSet<u64> = membership.voter_ids().collect();

        membership
            .nodes()
            .map(|(id, node)| EngineMember {
                id: *id,
                addr: node.addr.clone(),
                role: if voters.contains(id) {
                    EngineRole::Voter
                } else {
                    EngineRole::Standby
                },
            })
            .collect()
    }

    /// Whether the engine configuration knows this node at all.
    pub fn has_member(&self, id: u64) -> bool {
        self.members().iter().any(|m| m.id == id)
    }

    /// Add a node to the configuration as a learner (standby).
    /// Non-blocking: the log streams to it as it becomes reachable.
    /// Leader only.
    pub async fn add_member(&self, id: u64, addr: &str) -> Result<(), EngineError> {
        debug!(id, %addr, "adding engine member");
        self.raft
            .add_learner(id, BasicNode::new(addr), false)
            .await
            .map(|_| ())
            .map_err(map_write_err)
    }

    /// Promote eligible learners to voters until `target` voters
    /// exist, in id order for determinism. Only `eligible` ids are
    /// considered, so an unreachable member cannot be voted into a
    /// configuration it would stall. Leader only.
    pub async fn promote_voters(
        &self,
        target: usize,
        eligible: &BTreeSet<u64>,
    ) -> Result<(), EngineError> {
        let members = self.members();
        let voters: BTreeSet<u64> = members
            .iter()
            .filter(|m| m.role == EngineRole::Voter)
            .map(|m| m.id)
            .collect();
        if voters.len() >= target {
            return Ok(());
        }

        let promote: BTreeSet<u64> = members
            .iter()
            .filter(|m| m.role != EngineRole::Voter && eligible.contains(&m.id))
            .map(|m| m.id)
            .take(target - voters.len())
            .collect();
        if promote.is_empty() {
            return Ok(());
        }

        info!(?promote, "promoting engine members to voter");
        self.raft
            .change_membership(ChangeMembers::AddVoterIds(promote), false)
            .await
            .map(|_| ())
            .map_err(map_write_err)
    }

    /// Remove a node from the configuration entirely. Leader only.
    pub async fn remove_member(&self, id: u64) -> Result<(), EngineError> {
        let is_voter = self
            .members()
            .iter()
            .any(|m| m.id == id && m.role == EngineRole::Voter);

        let mut set = BTreeSet::new();
        set.insert(id);

        if is_voter {
            self.raft
                .change_membership(ChangeMembers::RemoveVoters(set.clone()), false)
                .await
                .map_err(map_write_err)?;
        }

        self.raft
            .change_membership(ChangeMembers::RemoveNodes(set), false)
            .await
            .map(|_| ())
            .map_err(map_write_err)?;

        info!(id, "removed engine member");
        Ok(())
    }

    /// Submit a batch, forwarding to the leader when necessary.
    pub async fn propose(&self, batch: Batch) -> Result<ApplyOutcome, EngineError> {
        let mut hint = match self.raft.client_write(batch.clone()).await {
            Ok(resp) => return Ok(resp.data),
            Err(RaftError::APIError(ClientWriteError::ForwardToLeader(forward))) => {
                forward.leader_node.map(|n| n.addr)
            }
            Err(e) => return Err(EngineError::Raft(e.to_string())),
        };

        for _ in 0..MAX_FORWARD_HOPS {
            let addr = match hint.take().or_else(|| self.leader_addr()) {
                Some(addr) if addr != self.addr => addr,
                _ => return Err(EngineError::Unavailable("no known leader".to_string())),
            };

            debug!(%addr, "forwarding proposal to leader");
            match forward_propose(self.dialer.as_ref(), &addr, batch.clone()).await {
                Ok(ProposeReply::Applied(outcome)) => return Ok(outcome),
                Ok(ProposeReply::NotLeader { leader_addr, .. }) => {
                    hint = leader_addr;
                }
                Ok(ProposeReply::Failed(message)) => return Err(EngineError::Raft(message)),
                Err(e) => return Err(EngineError::Unavailable(e.to_string())),
            }
        }

        Err(EngineError::Unavailable(
            "leader moved too many times".to_string(),
        ))
    }

    /// Relaxed read of one key from the local state machine.
    pub fn get(&self, table: &str, key: &str) -> Result<Option<Row>, EngineError> {
        machine::local_get(&self.db, table, key).map_err(|e| EngineError::Storage(e.to_string()))
    }

    /// Relaxed scan of one logical table from the local state machine.
    pub fn scan(&self, table: &str) -> Result<Vec<Row>, EngineError> {
        machine::local_scan(&self.db, table).map_err(|e| EngineError::Storage(e.to_string()))
    }

    /// Quiesce the raft instance. Idempotent.
    pub async fn shutdown(&self) {
        if let Err(e) = self.raft.shutdown().await {
            debug!(error = %e, "engine shutdown");
        }
    }
}

fn map_write_err(err: RaftError<u64, ClientWriteError<u64, BasicNode>>) -> EngineError {
    EngineError::Raft(err.to_string())
}
