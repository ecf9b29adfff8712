//! The leader-driven heartbeat loop.
//!
//! Every member reconciles its trust store against the replicated
//! table each tick; only the current replication leader runs the
//! active sweep: parallel ready probes, the heartbeat-column batch,
//! role promotion, token expiry, and the `on_heartbeat` hook.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, warn};

use stratus_core::hooks::RoleStatusMap;
use stratus_core::types::{unix_now, Member, MemberState};
use stratus_core::{Result, Role};
use stratus_db::{Coordinator, Status};
use stratus_engine::{node_id, EngineRole};
use stratus_trust::Remote;

use crate::state::ClusterState;

/// Default sweep period.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Per-peer probe deadline inside a tick.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Voters the leader maintains while enough members exist.
const TARGET_VOTERS: usize = 3;

/// The periodic sweep task.
pub struct HeartbeatLoop {
    state: Arc<ClusterState>,
    interval: Duration,
}

impl HeartbeatLoop {
    pub fn new(state: Arc<ClusterState>, interval: Duration) -> Self {
        Self { state, interval }
    }

    /// Run until the shutdown token fires.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(true) => {}
                        Ok(false) => debug!("heartbeat tick skipped: not the leader"),
                        Err(e) => warn!(error = %e, "heartbeat tick failed"),
                    }
                }
                _ = shutdown.changed() => {
                    debug!("heartbeat loop stopping");
                    return;
                }
            }
        }
    }

    /// One sweep. Returns `Ok(false)` when this member is not the
    /// leader and only did the local trust reconciliation.
    pub async fn tick(&self) -> Result<bool> {
        let db = match self.state.db() {
            Ok(db) => db,
            Err(_) => return Ok(false),
        };
        if db.status() != Status::Ready && db.status() != Status::Waiting {
            return Ok(false);
        }

        // Trust follows the replicated table on every member, leader
        // or not; this is what lets a rebooted member catch up on
        // admissions it missed.
        self.reconcile_trust(&db);

        if !db.engine().is_leader() {
            return Ok(false);
        }

        let members = db.members()?;
        let self_name = self.state.name()?;

        let statuses: RoleStatusMap = join_all(members.iter().map(|member| {
            let self_name = self_name.clone();
            async move {
                let status = if member.name == self_name {
                    MemberState::Online
                } else {
                    self.state.probe_member(member, PROBE_TIMEOUT).await
                };
                (member.name.clone(), status)
            }
        }))
        .await
        .into_iter()
        .collect();

        // Only members the probe reached get a fresh timestamp.
        let now = unix_now();
        let reached: Vec<(String, u64)> = statuses
            .iter()
            .filter(|(_, status)| **status == MemberState::Online)
            .map(|(name, _)| (name.clone(), now))
            .collect();
        db.transaction(|| db.update_heartbeats(&reached)).await?;

        self.reconcile_roles(&db, &members, &statuses).await;

        if let Err(e) = db.sweep_expired_tokens().await {
            warn!(error = %e, "token sweep failed");
        }

        if let Err(e) = self.state.hooks().on_heartbeat(&statuses).await {
            warn!(error = %e, "on-heartbeat hook failed");
        }

        Ok(true)
    }

    /// Add trust entries for replicated members we do not know yet
    /// and drop entries whose member row is gone.
    fn reconcile_trust(&self, db: &Coordinator) {
        let members = match db.members() {
            Ok(members) => members,
            Err(e) => {
                warn!(error = %e, "trust reconciliation skipped");
                return;
            }
        };
        let trust = self.state.trust();

        let mut names = HashSet::new();
        for member in &members {
            names.insert(member.name.clone());
            if trust.by_name(&member.name).is_none() {
                let added = trust.add(&[Remote {
                    name: member.name.clone(),
                    address: member.address.clone(),
                    certificate: member.certificate.clone(),
                }]);
                match added {
                    Ok(()) => debug!(name = %member.name, "trust entry reconciled from table"),
                    Err(e) => warn!(name = %member.name, error = %e, "trust reconciliation failed"),
                }
            }
        }

        for stale in trust
            .names()
            .into_iter()
            .filter(|name| !names.contains(name))
        {
            if let Err(e) = trust.remove(&stale) {
                warn!(name = %stale, error = %e, "stale trust entry not removed");
            }
        }
    }

    /// Keep the engine configuration and the replicated role column
    /// converged: every member becomes a learner, reachable learners
    /// are promoted up to the voter target, and rows pick up the
    /// engine-assigned role.
    async fn reconcile_roles(&self, db: &Coordinator, members: &[Member], statuses: &RoleStatusMap) {
        let engine = db.engine();

        for member in members {
            let id = node_id(&member.name);
            if !engine.has_member(id) {
                if let Err(e) = engine.add_member(id, &member.address).await {
                    warn!(name = %member.name, error = %e, "engine member not added");
                }
            }
        }

        let eligible = members
            .iter()
            .filter(|m| statuses.get(&m.name) == Some(&MemberState::Online))
            .map(|m| node_id(&m.name))
            .collect();
        if let Err(e) = engine.promote_voters(TARGET_VOTERS, &eligible).await {
            warn!(error = %e, "voter promotion failed");
        }

        let engine_members = engine.members();
        for member in members {
            let id = node_id(&member.name);
            let engine_role = engine_members.iter().find(|em| em.id == id).map(|em| em.role);
            let role = match engine_role {
                Some(EngineRole::Voter) => Role::Voter,
                Some(EngineRole::Standby) => Role::Standby,
                Some(EngineRole::Spare) => Role::Spare,
                None => continue,
            };

            if member.role != role {
                let name = member.name.clone();
                let result = db
                    .transaction(|| {
                        db.update_member(&name, |mut m| {
                            m.role = role;
                            m
                        })
                    })
                    .await;
                match result {
                    Ok(_) => debug!(name = %member.name, %role, "member role reconciled"),
                    Err(e) => warn!(name = %member.name, error = %e, "role update failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::bootstrapped_state;

    #[tokio::test]
    async fn tick_promotes_bootstrap_member_and_stamps_heartbeat() {
        let state = bootstrapped_state("c1.example.com", "127.0.0.1:9001").await;
        let db = state.db().unwrap();
        assert_eq!(db.member("c1.example.com").unwrap().role, Role::Pending);

        let hb = HeartbeatLoop::new(state.shared(), Duration::from_secs(10));
        assert!(hb.tick().await.unwrap());

        let member = db.member("c1.example.com").unwrap();
        // The engine bootstrapped us as voter; the row caught up.
        assert_eq!(member.role, Role::Voter);
        assert!(member.heartbeat > 0);
    }

    #[tokio::test]
    async fn tick_reconciles_trust_from_table() {
        let state = bootstrapped_state("c1.example.com", "127.0.0.1:9001").await;
        let db = state.db().unwrap();

        // Admit a member; no trust entry exists yet for it.
        let encoded = state.issue_token("c2.example.com", None).await.unwrap();
        let token = stratus_core::messages::Token::decode(&encoded).unwrap();
        state
            .admission(stratus_core::messages::JoinRequest {
                name: "c2.example.com".to_string(),
                address: "127.0.0.1:9002".to_string(),
                certificate: stratus_trust::certs::generate_server_keypair("c2.example.com", &[])
                    .unwrap()
                    .cert_pem,
                schema_internal: state.schema_version().0,
                schema_external: state.schema_version().1,
                api_extensions: vec![],
                secret: token.secret,
            })
            .await
            .unwrap();
        assert!(state.trust().by_name("c2.example.com").is_none());

        // The tick fills the missing entry in from the table.
        let hb = HeartbeatLoop::new(state.shared(), Duration::from_secs(10));
        let _ = hb.tick().await;
        assert!(state.trust().by_name("c2.example.com").is_some());

        // Once the row is gone, the stale entry goes with it.
        db.transaction(|| db.delete_member("c2.example.com"))
            .await
            .unwrap();
        let _ = hb.tick().await;
        assert!(state.trust().by_name("c2.example.com").is_none());
    }

    #[tokio::test]
    async fn tick_sweeps_expired_tokens() {
        let state = bootstrapped_state("c1.example.com", "127.0.0.1:9001").await;
        let db = state.db().unwrap();
        db.create_token("old.example.com", "secret", 1).await.unwrap();

        let hb = HeartbeatLoop::new(state.shared(), Duration::from_secs(10));
        assert!(hb.tick().await.unwrap());
        assert!(db.token("old.example.com").unwrap().is_none());
    }
}
