//! Quorum-safe member removal.

use futures::future::join_all;
use tracing::{info, warn};

use stratus_core::messages::HookKind;
use stratus_core::{Error, Result, Role};
use stratus_engine::node_id;

use crate::state::ClusterState;

impl ClusterState {
    /// Remove `name` from the cluster.
    ///
    /// Refused when it would leave the cluster without a non-PENDING
    /// voter. Runs PreRemove on the target, removes the member from
    /// the replicated table, the engine configuration, and every live
    /// peer's trust store, instructs the target to reset, and runs
    /// PostRemove on the remaining peers.
    pub async fn remove_member(&self, name: &str, force: bool) -> Result<()> {
        let db = self.db()?;
        let self_name = self.name()?;
        let member = db.member(name)?;

        let voters = db
            .members()?
            .iter()
            .filter(|m| m.role == Role::Voter)
            .count();
        if member.role == Role::Voter && voters < 2 {
            return Err(Error::failed_precondition(
                "insufficient voters to remove a cluster member",
            ));
        }

        // Reconfiguration runs on the leader; everyone else proxies
        // the whole operation there.
        let engine = db.engine();
        if !engine.is_leader() {
            let leader_addr = engine
                .leader_addr()
                .ok_or_else(|| Error::unavailable("no replication leader"))?;
            let leader = self
                .trust()
                .by_address(&leader_addr)
                .ok_or_else(|| Error::unavailable("replication leader is not trusted"))?;
            info!(%name, leader = %leader.name, "proxying removal to leader");
            return self.peer_client(&leader)?.remove_cluster_member(name, force).await;
        }

        let target_is_self = name == self_name;
        let target_remote = self.trust().by_name(name);

        // PreRemove on the target; only force may skip its failure.
        let pre_remove = if target_is_self {
            self.hooks().pre_remove(force).await
        } else {
            match &target_remote {
                Some(remote) => {
                    let client = self.peer_client(remote)?;
                    client.run_remove_hook(HookKind::PreRemove, force).await
                }
                None => Err(Error::not_found(format!("no trust entry for {name:?}"))),
            }
        };
        if let Err(e) = pre_remove {
            if !force {
                return Err(Error::new(
                    e.kind(),
                    format!("pre-remove hook on {name:?} failed: {e}"),
                ));
            }
            warn!(%name, error = %e, "pre-remove hook skipped by force");
        }

        // Drop the member from the engine configuration. A PENDING
        // member may never have been added.
        if let Err(e) = engine.remove_member(node_id(name)).await {
            warn!(%name, error = %e, "engine removal incomplete");
        }

        db.transaction(|| db.delete_member(name)).await?;
        self.trust().remove(name)?;

        // Fan the trust removal out to every remaining peer.
        let peers = self.peer_clients()?;
        join_all(peers.iter().filter(|(remote, _)| remote.name != name).map(
            |(remote, client)| async move {
                if let Err(e) = client.remove_trust(name).await {
                    warn!(peer = %remote.name, error = %e, "trust removal failed");
                }
            },
        ))
        .await;

        // Instruct the target to wipe its state and restart.
        if target_is_self {
            (self.callbacks.reset)(force).await?;
        } else if let Some(remote) = &target_remote {
            let reset = self.peer_client(remote)?.reset_member(name, force).await;
            match reset {
                Ok(()) => {}
                Err(e) if force => {
                    warn!(%name, error = %e, "reset of removed member swallowed by force")
                }
                Err(e) => {
                    return Err(Error::new(
                        e.kind(),
                        format!("removed member {name:?} could not be reset: {e}"),
                    ))
                }
            }
        }

        // PostRemove everywhere that remains; failures only log.
        if let Err(e) = self.hooks().post_remove(force).await {
            warn!(error = %e, "post-remove hook failed");
        }
        let peers = self.peer_clients()?;
        join_all(peers.iter().map(|(remote, client)| async move {
            if let Err(e) = client.run_remove_hook(HookKind::PostRemove, force).await {
                warn!(peer = %remote.name, error = %e, "post-remove hook failed");
            }
        }))
        .await;

        info!(%name, force, "cluster member removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::bootstrapped_state;

    #[tokio::test]
    async fn removing_the_last_voter_is_refused() {
        let state = bootstrapped_state("c1.example.com", "127.0.0.1:9001").await;
        let db = state.db().unwrap();

        // The bootstrap member has been promoted by the first tick.
        db.update_member("c1.example.com", |mut m| {
            m.role = Role::Voter;
            m
        })
        .await
        .unwrap();

        let err = state
            .remove_member("c1.example.com", false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), stratus_core::ErrorKind::FailedPrecondition);
        assert!(err.message().contains("insufficient voters"));

        // Nothing changed.
        assert!(db.member("c1.example.com").is_ok());
    }

    #[tokio::test]
    async fn removing_unknown_member_is_not_found() {
        let state = bootstrapped_state("c1.example.com", "127.0.0.1:9001").await;
        let err = state.remove_member("ghost.example.com", false).await.unwrap_err();
        assert_eq!(err.kind(), stratus_core::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn removing_a_pending_member_succeeds_with_one_voter() {
        let state = bootstrapped_state("c1.example.com", "127.0.0.1:9001").await;
        let db = state.db().unwrap();

        db.update_member("c1.example.com", |mut m| {
            m.role = Role::Voter;
            m
        })
        .await
        .unwrap();

        // Admit a second member; it stays PENDING.
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

        // No trust entry and no listener for c2, so the reset cannot
        // be delivered; force swallows that.
        state.remove_member("c2.example.com", true).await.unwrap();
        assert!(db.member("c2.example.com").is_err());
    }
}
