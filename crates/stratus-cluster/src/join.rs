//! The join protocol: candidate loop on the joiner, admission on the
//! peer, and the post-join fanout.

use futures::future::join_all;
use tracing::{error, info, warn};

use stratus_client::{fetch_peer_certificate, PeerClient};
use stratus_core::messages::{JoinRequest, JoinResponse, Token, TrustEntry};
use stratus_core::types::{validate_address, validate_fqdn};
use stratus_core::{Error, MemberLocation, Result};
use stratus_engine::node_id;
use stratus_trust::certs::{cert_matches_name, fingerprint};

use crate::state::ClusterState;

impl ClusterState {
    /// The joiner's candidate loop (no local state is written here).
    ///
    /// For each address in the token, fetch the peer's leaf
    /// certificate and check it against the token's pinned
    /// fingerprint; a mismatch fails hard, since it means the token
    /// was tampered with. The first peer that accepts our member
    /// record wins; peer errors move on to the next candidate.
    pub async fn request_admission(
        &self,
        token: &Token,
        name: &str,
        address: &str,
    ) -> Result<JoinResponse> {
        let identity = self.server_keypair()?;
        let (schema_internal, schema_external) = self.schema_version();

        let request = JoinRequest {
            name: name.to_string(),
            address: address.to_string(),
            certificate: identity.cert_pem.clone(),
            schema_internal,
            schema_external,
            api_extensions: self.extensions().to_vec(),
            secret: token.secret.clone(),
        };

        let mut last_err = Error::unavailable("no join addresses in token");
        for candidate in &token.join_addresses {
            let leaf = match fetch_peer_certificate(candidate).await {
                Ok(leaf) => leaf,
                Err(e) => {
                    warn!(address = %candidate, error = %e, "could not fetch candidate certificate");
                    last_err = e;
                    continue;
                }
            };

            if fingerprint(&leaf) != token.fingerprint {
                return Err(Error::unauthorized(format!(
                    "certificate of {candidate} does not match the token fingerprint"
                )));
            }

            let client = PeerClient::pinned_der(candidate, &identity, leaf)?;
            match client.add_cluster_member(&request).await {
                Ok(response) => {
                    info!(peer = %candidate, "join request accepted");
                    return Ok(response);
                }
                Err(e) => {
                    error!(address = %candidate, error = %e, "join request failed");
                    last_err = e;
                }
            }
        }

        Err(Error::new(
            last_err.kind(),
            format!(
                "{} join attempts were unsuccessful, last error: {last_err}",
                token.join_addresses.len()
            ),
        ))
    }

    /// Peer side of `POST /core/internal/cluster`: redeem the token
    /// and insert the joiner in one replicated transaction, then hand
    /// back the cluster identity and member list.
    pub async fn admission(&self, request: JoinRequest) -> Result<JoinResponse> {
        validate_fqdn(&request.name)?;
        validate_address(&request.address)?;

        // The token authorizes a name; the certificate that every
        // peer will trust under that name must actually carry it in
        // its subject alternative names.
        if !cert_matches_name(&request.certificate, &request.name)? {
            return Err(Error::unauthorized(format!(
                "certificate subject names do not cover {:?}",
                request.name
            )));
        }

        let db = self.db()?;
        let cluster = self
            .cluster_keypair()
            .ok_or_else(|| Error::failed_precondition("this member is not yet initialized"))?;

        let (member, members) = db
            .transaction(|| {
                db.admit_member(
                    &request.secret,
                    &request.name,
                    &request.address,
                    &request.certificate,
                    request.schema_internal,
                    request.schema_external,
                    request.api_extensions.clone(),
                )
            })
            .await?;

        // Give the new member a replication stream right away when we
        // happen to be the leader; the heartbeat loop converges this
        // otherwise.
        let engine = db.engine();
        if engine.is_leader() {
            if let Err(e) = engine.add_member(node_id(&member.name), &member.address).await {
                warn!(name = %member.name, error = %e, "could not add engine member yet");
            }
        }

        info!(name = %member.name, address = %member.address, "admitted new cluster member");

        Ok(JoinResponse {
            cluster_cert: cluster.cert_pem.clone(),
            cluster_key: cluster.key_pem.clone(),
            cluster_additional_certs: self.additional_certs(),
            trusted_member: MemberLocation {
                name: self.name()?,
                address: self.address()?,
            },
            cluster_members: members,
        })
    }

    /// The joiner's post-join fanout: propagate our trust entry to
    /// every reachable peer, wake their upgrade fences, and announce
    /// the new member. Individual peer failures are logged and left
    /// to the heartbeat loop to converge, but at least one peer must
    /// confirm our trust entry or the join is considered failed.
    pub async fn finalize_join(&self, new_member: &MemberLocation) -> Result<()> {
        let identity = self.server_keypair()?;
        let entry = TrustEntry {
            name: new_member.name.clone(),
            address: new_member.address.clone(),
            certificate: identity.cert_pem.clone(),
        };

        let clients = self.peer_clients()?;
        if clients.is_empty() {
            return Err(Error::internal("no trusted peers to confirm the join"));
        }

        let outcomes = join_all(clients.iter().map(|(remote, client)| {
            let entry = entry.clone();
            async move {
                let trusted = match client.add_trust(&entry).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(peer = %remote.name, error = %e, "trust propagation failed");
                        false
                    }
                };

                if let Err(e) = client.notify_upgraded().await {
                    warn!(peer = %remote.name, error = %e, "upgrade notification failed");
                }
                if let Err(e) = client.run_new_member_hook(new_member).await {
                    warn!(peer = %remote.name, error = %e, "on-new-member hook failed");
                }

                trusted
            }
        }))
        .await;

        let confirmed = outcomes.iter().filter(|ok| **ok).count();
        if confirmed == 0 {
            return Err(Error::unavailable(
                "no cluster member confirmed our trust entry",
            ));
        }

        info!(confirmed, peers = clients.len(), "join propagated to cluster");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::bootstrapped_state;
    use std::time::Duration;
    use stratus_trust::certs::generate_server_keypair;

    fn join_request(state: &ClusterState, secret: &str, name: &str, address: &str) -> JoinRequest {
        let (schema_internal, schema_external) = state.schema_version();
        let keypair = generate_server_keypair(name, &[]).unwrap();
        JoinRequest {
            name: name.to_string(),
            address: address.to_string(),
            certificate: keypair.cert_pem,
            schema_internal,
            schema_external,
            api_extensions: state.extensions().to_vec(),
            secret: secret.to_string(),
        }
    }

    #[tokio::test]
    async fn admission_returns_cluster_identity_and_members() {
        let state = bootstrapped_state("c1.example.com", "127.0.0.1:9001").await;
        let encoded = state
            .issue_token("c2.example.com", Some(Duration::from_secs(60)))
            .await
            .unwrap();
        let token = Token::decode(&encoded).unwrap();

        let response = state
            .admission(join_request(&state, &token.secret, "c2.example.com", "127.0.0.1:9002"))
            .await
            .unwrap();

        let cluster = state.cluster_keypair().unwrap();
        assert_eq!(response.cluster_cert, cluster.cert_pem);
        assert_eq!(response.trusted_member.name, "c1.example.com");
        assert_eq!(response.cluster_members.len(), 2);

        // The joiner is in the table at PENDING with a zero heartbeat.
        let joiner = state.db().unwrap().member("c2.example.com").unwrap();
        assert_eq!(joiner.role, stratus_core::Role::Pending);
        assert_eq!(joiner.heartbeat, 0);
    }

    #[tokio::test]
    async fn admission_with_bad_secret_is_not_found() {
        let state = bootstrapped_state("c1.example.com", "127.0.0.1:9001").await;
        state
            .issue_token("c2.example.com", Some(Duration::from_secs(60)))
            .await
            .unwrap();

        let err = state
            .admission(join_request(&state, "wrong", "c2.example.com", "127.0.0.1:9002"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), stratus_core::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn admission_rejects_bad_names_and_addresses() {
        let state = bootstrapped_state("c1.example.com", "127.0.0.1:9001").await;

        let err = state
            .admission(join_request(&state, "s", "Bad Name", "127.0.0.1:9002"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), stratus_core::ErrorKind::InvalidArgument);

        let err = state
            .admission(join_request(&state, "s", "c2.example.com", "nowhere"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), stratus_core::ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn admission_rejects_certificate_for_another_name() {
        let state = bootstrapped_state("c1.example.com", "127.0.0.1:9001").await;
        let encoded = state
            .issue_token("c2.example.com", Some(Duration::from_secs(60)))
            .await
            .unwrap();
        let token = Token::decode(&encoded).unwrap();

        // A valid token secret, but a certificate issued to someone else.
        let mut request =
            join_request(&state, &token.secret, "c2.example.com", "127.0.0.1:9002");
        request.certificate = generate_server_keypair("mallory.example.com", &[])
            .unwrap()
            .cert_pem;

        let err = state.admission(request).await.unwrap_err();
        assert_eq!(err.kind(), stratus_core::ErrorKind::Unauthorized);

        // The token is not consumed and no row was inserted.
        let db = state.db().unwrap();
        assert!(db.token("c2.example.com").unwrap().is_some());
        assert!(db.member("c2.example.com").is_err());
    }

    #[tokio::test]
    async fn admission_rejects_unparseable_certificate() {
        let state = bootstrapped_state("c1.example.com", "127.0.0.1:9001").await;
        let encoded = state
            .issue_token("c2.example.com", Some(Duration::from_secs(60)))
            .await
            .unwrap();
        let token = Token::decode(&encoded).unwrap();

        let mut request =
            join_request(&state, &token.secret, "c2.example.com", "127.0.0.1:9002");
        request.certificate = "not a certificate".to_string();

        let err = state.admission(request).await.unwrap_err();
        assert_eq!(err.kind(), stratus_core::ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn request_admission_fails_when_no_candidate_is_reachable() {
        let state = bootstrapped_state("c1.example.com", "127.0.0.1:9001").await;
        let token = Token {
            secret: "s".to_string(),
            name: "c2.example.com".to_string(),
            fingerprint: "00".repeat(32),
            // Nothing listens here.
            join_addresses: vec!["127.0.0.1:1".to_string()],
        };

        let err = state
            .request_admission(&token, "c2.example.com", "127.0.0.1:9002")
            .await
            .unwrap_err();
        assert!(err.message().contains("join attempts were unsuccessful"));
    }
}
