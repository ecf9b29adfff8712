//! Join-token issuance.

use std::time::Duration;

use rand::RngCore;
use tracing::info;

use stratus_core::messages::Token;
use stratus_core::types::{unix_now, validate_fqdn};
use stratus_core::{Error, Result};

use crate::state::ClusterState;

/// Default token lifetime when the issuer does not pick one.
pub const DEFAULT_TOKEN_EXPIRY: Duration = Duration::from_secs(3 * 60 * 60);

fn random_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

impl ClusterState {
    /// Issue a join token for `name` and return the base64 bundle the
    /// joiner presents: secret, name, cluster certificate
    /// fingerprint, and the current member addresses.
    pub async fn issue_token(&self, name: &str, expire_after: Option<Duration>) -> Result<String> {
        validate_fqdn(name)?;
        let db = self.db()?;

        if db.member(name).is_ok() {
            return Err(Error::conflict(format!(
                "cluster member {name:?} already exists"
            )));
        }

        let cluster = self
            .cluster_keypair()
            .ok_or_else(|| Error::failed_precondition("daemon is not yet initialized"))?;
        let fingerprint = cluster.fingerprint()?;

        let expiry =
            unix_now() + expire_after.unwrap_or(DEFAULT_TOKEN_EXPIRY).as_secs();
        let secret = random_secret();

        let record = db
            .transaction(|| db.create_token(name, &secret, expiry))
            .await?;

        let join_addresses = db.members()?.iter().map(|m| m.address.clone()).collect();
        let token = Token {
            secret: record.secret,
            name: name.to_string(),
            fingerprint,
            join_addresses,
        };

        info!(%name, "join token issued");
        token.encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::bootstrapped_state;

    #[tokio::test]
    async fn issued_token_carries_fingerprint_and_addresses() {
        let state = bootstrapped_state("c1.example.com", "127.0.0.1:9001").await;

        let encoded = state
            .issue_token("c2.example.com", Some(Duration::from_secs(60)))
            .await
            .unwrap();
        let token = Token::decode(&encoded).unwrap();

        assert_eq!(token.name, "c2.example.com");
        assert_eq!(token.secret.len(), 64);
        assert_eq!(
            token.fingerprint,
            state.cluster_keypair().unwrap().fingerprint().unwrap()
        );
        assert_eq!(token.join_addresses, vec!["127.0.0.1:9001".to_string()]);
    }

    #[tokio::test]
    async fn token_for_existing_member_is_refused() {
        let state = bootstrapped_state("c1.example.com", "127.0.0.1:9001").await;
        let err = state.issue_token("c1.example.com", None).await.unwrap_err();
        assert_eq!(err.kind(), stratus_core::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn token_requires_fqdn() {
        let state = bootstrapped_state("c1.example.com", "127.0.0.1:9001").await;
        let err = state.issue_token("NOT VALID", None).await.unwrap_err();
        assert_eq!(err.kind(), stratus_core::ErrorKind::InvalidArgument);
    }
}
