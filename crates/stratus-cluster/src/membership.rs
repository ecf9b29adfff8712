//! Derived member state for cluster listings.

use std::time::Duration;

use futures::future::join_all;

use stratus_core::types::{Member, MemberInfo, MemberState};
use stratus_core::Result;

use crate::state::ClusterState;

/// Per-probe deadline when deriving member state.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// How a member's published versions relate to ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VersionDelta {
    Equal,
    Ahead,
    Behind,
}

fn version_delta(own: (u64, u64, usize), member: &Member) -> VersionDelta {
    let (internal, external, extensions) = own;
    let theirs = (
        member.schema_internal,
        member.schema_external,
        member.api_extensions.len() as u64,
    );
    let ours = (internal, external, extensions as u64);

    if theirs.0 > ours.0 || theirs.1 > ours.1 || theirs.2 > ours.2 {
        VersionDelta::Ahead
    } else if theirs.0 < ours.0 || theirs.1 < ours.1 || theirs.2 < ours.2 {
        VersionDelta::Behind
    } else {
        VersionDelta::Equal
    }
}

impl ClusterState {
    /// Live state of one member: trust check first, then a ready
    /// probe under `timeout`. A member whose row is gone from the
    /// replicated table (a removal racing the probe) reports
    /// NOT FOUND instead of a trust or transport failure.
    pub async fn probe_member(&self, member: &Member, timeout: Duration) -> MemberState {
        let remote = match self.trust().by_name(&member.name) {
            Some(remote) if remote.certificate == member.certificate => remote,
            _ => {
                return if self.member_vanished(&member.name) {
                    MemberState::NotFound
                } else {
                    MemberState::NotTrusted
                }
            }
        };

        let client = match self.peer_client(&remote) {
            Ok(client) => client.with_timeout(timeout),
            Err(_) => return MemberState::NotTrusted,
        };

        match client.ready().await {
            Ok(()) => MemberState::Online,
            Err(_) => {
                if self.member_vanished(&member.name) {
                    MemberState::NotFound
                } else {
                    MemberState::Unreachable
                }
            }
        }
    }

    /// Whether the member row disappeared from the replicated table.
    fn member_vanished(&self, name: &str) -> bool {
        self.db().map(|db| db.member(name).is_err()).unwrap_or(false)
    }

    /// The member table joined with derived state, as served by
    /// `GET /core/1.0/cluster`. Never fails on peer trouble: probe
    /// results land in the per-member state instead.
    pub async fn member_infos(&self) -> Result<Vec<MemberInfo>> {
        let db = self.db()?;
        let members = db.members()?;
        let self_name = self.name()?;
        let (internal, external) = self.schema_version();
        let own = (internal, external, self.extensions().len());

        let infos = join_all(members.into_iter().map(|member| {
            let self_name = self_name.clone();
            async move {
                let status = if member.name == self_name {
                    MemberState::Online
                } else {
                    match version_delta(own, &member) {
                        VersionDelta::Ahead => MemberState::Upgrading,
                        VersionDelta::Behind => MemberState::NeedsUpgrade,
                        VersionDelta::Equal => self.probe_member(&member, PROBE_TIMEOUT).await,
                    }
                };
                MemberInfo { member, status }
            }
        }))
        .await;

        Ok(infos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::bootstrapped_state;
    use stratus_core::Role;

    fn member(name: &str, internal: u64, external: u64, extensions: usize) -> Member {
        Member {
            id: 9,
            name: name.to_string(),
            address: "127.0.0.1:9009".to_string(),
            certificate: "cert".to_string(),
            schema_internal: internal,
            schema_external: external,
            api_extensions: (0..extensions).map(|i| format!("ext{i}")).collect(),
            heartbeat: 0,
            role: Role::Pending,
        }
    }

    #[test]
    fn version_delta_compares_all_axes() {
        let own = (1, 2, 1);
        assert_eq!(version_delta(own, &member("m", 1, 2, 1)), VersionDelta::Equal);
        assert_eq!(version_delta(own, &member("m", 2, 2, 1)), VersionDelta::Ahead);
        assert_eq!(version_delta(own, &member("m", 1, 3, 1)), VersionDelta::Ahead);
        assert_eq!(version_delta(own, &member("m", 1, 2, 2)), VersionDelta::Ahead);
        assert_eq!(version_delta(own, &member("m", 1, 1, 1)), VersionDelta::Behind);
        assert_eq!(version_delta(own, &member("m", 0, 2, 0)), VersionDelta::Behind);
    }

    #[tokio::test]
    async fn self_is_always_online() {
        let state = bootstrapped_state("c1.example.com", "127.0.0.1:9001").await;
        let infos = state.member_infos().await.unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].status, MemberState::Online);
    }

    #[tokio::test]
    async fn untrusted_member_is_marked() {
        let state = bootstrapped_state("c1.example.com", "127.0.0.1:9001").await;

        // A member row with no matching trust entry.
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

        let row = state.db().unwrap().member("c2.example.com").unwrap();
        let status = state.probe_member(&row, Duration::from_millis(200)).await;
        assert_eq!(status, MemberState::NotTrusted);
    }

    #[tokio::test]
    async fn vanished_member_is_marked_not_found() {
        let state = bootstrapped_state("c1.example.com", "127.0.0.1:9001").await;
        // A member that is not (or no longer) in the replicated table.
        let gone = member("c9.example.com", 1, 0, 0);
        let status = state.probe_member(&gone, Duration::from_millis(200)).await;
        assert_eq!(status, MemberState::NotFound);
    }

    #[tokio::test]
    async fn member_ahead_of_us_is_upgrading() {
        let state = bootstrapped_state("c1.example.com", "127.0.0.1:9001").await;
        let db = state.db().unwrap();

        // Pretend the other member restarted with one more migration.
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
                schema_external: state.schema_version().1 + 1,
                api_extensions: vec![],
                secret: token.secret,
            })
            .await
            .unwrap();

        let infos = state.member_infos().await.unwrap();
        let c2 = infos
            .iter()
            .find(|i| i.member.name == "c2.example.com")
            .unwrap();
        assert_eq!(c2.status, MemberState::Upgrading);

        // And from the other direction: a member behind us.
        db.update_member("c2.example.com", |mut m| {
            m.schema_external = 0;
            m.schema_internal = 0;
            m
        })
        .await
        .unwrap();
        let infos = state.member_infos().await.unwrap();
        let c2 = infos
            .iter()
            .find(|i| i.member.name == "c2.example.com")
            .unwrap();
        assert_eq!(c2.status, MemberState::NeedsUpgrade);
    }
}
