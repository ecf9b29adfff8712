//! Typed accessors for the replicated membership table.
//!
//! Mutations are conditional batches: uniqueness of names and
//! addresses is enforced by `Absent` preconditions against the member
//! table and its address index, and row updates are compare-and-swap
//! against the previously read JSON value.

use tracing::{debug, info};

use stratus_core::types::unix_now;
use stratus_core::{Error, Member, Result, Role};
use stratus_engine::{Batch, Precondition};

use crate::coordinator::{Coordinator, MEMBERS, MEMBER_ADDRS, META, NEXT_ID_KEY};

/// How often a compare-and-swap mutation retries before giving up.
const CAS_ATTEMPTS: usize = 10;

impl Coordinator {
    /// All member rows, sorted by name. Served from the local state
    /// machine, which may lag the leader by a replication round.
    pub fn members(&self) -> Result<Vec<Member>> {
        let rows = self
            .engine
            .scan(MEMBERS)
            .map_err(crate::coordinator::map_engine_err)?;
        let mut members: Vec<Member> = rows
            .iter()
            .map(|r| serde_json::from_str(&r.value))
            .collect::<std::result::Result<_, _>>()?;
        members.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(members)
    }

    pub fn member(&self, name: &str) -> Result<Member> {
        match self
            .engine
            .get(MEMBERS, name)
            .map_err(crate::coordinator::map_engine_err)?
        {
            Some(row) => Ok(serde_json::from_str(&row.value)?),
            None => Err(Error::not_found(format!("cluster member {name:?}"))),
        }
    }

    /// Redeem a token and insert the joiner, atomically.
    ///
    /// The batch requires the token row to still hold the secret we
    /// read, so of two concurrent redemptions exactly one applies and
    /// the other observes NotFound. Returns the new row and the full
    /// member list from the same batch.
    pub async fn admit_member(
        &self,
        secret: &str,
        name: &str,
        address: &str,
        certificate: &str,
        schema_internal: u64,
        schema_external: u64,
        api_extensions: Vec<String>,
    ) -> Result<(Member, Vec<Member>)> {
        for _ in 0..CAS_ATTEMPTS {
            let token_row = self
                .engine
                .get(crate::coordinator::TOKENS, name)
                .map_err(crate::coordinator::map_engine_err)?
                .ok_or_else(|| Error::not_found(format!("join token for {name:?}")))?;
            let token: stratus_core::TokenRecord = serde_json::from_str(&token_row.value)?;

            if token.secret != secret {
                return Err(Error::not_found(format!("join token for {name:?}")));
            }
            if token.is_expired(unix_now()) {
                // Opportunistic sweep; the lost race is fine.
                let _ = self.delete_token(name).await;
                return Err(Error::not_found(format!("join token for {name:?} expired")));
            }

            let (id, id_precondition) = self.next_id()?;
            let member = Member {
                id,
                name: name.to_string(),
                address: address.to_string(),
                certificate: certificate.to_string(),
                schema_internal,
                schema_external,
                api_extensions: api_extensions.clone(),
                heartbeat: 0,
                role: Role::Pending,
            };

            let batch = Batch::new()
                .require(Precondition::Equals {
                    table: crate::coordinator::TOKENS.to_string(),
                    key: name.to_string(),
                    value: token_row.value.clone(),
                })
                .require(id_precondition)
                .require(Precondition::Absent {
                    table: MEMBERS.to_string(),
                    key: name.to_string(),
                })
                .require(Precondition::Absent {
                    table: MEMBER_ADDRS.to_string(),
                    key: address.to_string(),
                })
                .put(META, NEXT_ID_KEY, (id + 1).to_string())
                .put(MEMBERS, name, serde_json::to_string(&member)?)
                .put(MEMBER_ADDRS, address, name.to_string())
                .delete(crate::coordinator::TOKENS, name)
                .scan(MEMBERS);

            let outcome = self.propose(batch).await?;
            if outcome.applied {
                info!(%name, %address, id, "cluster member admitted");
                let members: Vec<Member> = outcome.rows[0]
                    .iter()
                    .map(|r| serde_json::from_str(&r.value))
                    .collect::<std::result::Result<_, _>>()?;
                return Ok((member, members));
            }

            match outcome.failed_precondition {
                // Token consumed or rewritten since we read it.
                Some(0) => {
                    return Err(Error::not_found(format!("join token for {name:?}")));
                }
                // Row-id race; allocate again.
                Some(1) => continue,
                Some(2) => {
                    return Err(Error::conflict(format!(
                        "cluster member {name:?} already exists"
                    )))
                }
                Some(3) => {
                    return Err(Error::conflict(format!(
                        "cluster member address {address:?} already in use"
                    )))
                }
                _ => return Err(Error::internal("admission batch rejected unexpectedly")),
            }
        }

        Err(Error::unavailable("admission kept losing id allocation"))
    }

    /// Compare-and-swap update of one member row.
    pub async fn update_member<F>(&self, name: &str, mutate: F) -> Result<Member>
    where
        F: Fn(Member) -> Member,
    {
        for _ in 0..CAS_ATTEMPTS {
            let row = self
                .engine
                .get(MEMBERS, name)
                .map_err(crate::coordinator::map_engine_err)?
                .ok_or_else(|| Error::not_found(format!("cluster member {name:?}")))?;

            let current: Member = serde_json::from_str(&row.value)?;
            let updated = mutate(current);
            let batch = Batch::new()
                .require(Precondition::Equals {
                    table: MEMBERS.to_string(),
                    key: name.to_string(),
                    value: row.value.clone(),
                })
                .put(MEMBERS, name, serde_json::to_string(&updated)?);

            let outcome = self.propose(batch).await?;
            if outcome.applied {
                return Ok(updated);
            }
        }

        Err(Error::unavailable(format!(
            "update of member {name:?} kept losing races"
        )))
    }

    /// Delete a member row and its address index entry.
    pub async fn delete_member(&self, name: &str) -> Result<()> {
        for _ in 0..CAS_ATTEMPTS {
            let row = self
                .engine
                .get(MEMBERS, name)
                .map_err(crate::coordinator::map_engine_err)?
                .ok_or_else(|| Error::not_found(format!("cluster member {name:?}")))?;
            let member: Member = serde_json::from_str(&row.value)?;

            let batch = Batch::new()
                .require(Precondition::Equals {
                    table: MEMBERS.to_string(),
                    key: name.to_string(),
                    value: row.value.clone(),
                })
                .delete(MEMBERS, name)
                .delete(MEMBER_ADDRS, &member.address);

            let outcome = self.propose(batch).await?;
            if outcome.applied {
                info!(%name, "cluster member deleted");
                return Ok(());
            }
        }

        Err(Error::unavailable(format!(
            "delete of member {name:?} kept losing races"
        )))
    }

    /// Update the heartbeat column of every member the leader reached,
    /// in one batch. Timestamps never move backward, and members that
    /// vanished mid-sweep are skipped. Returns the names written.
    pub async fn update_heartbeats(&self, observed: &[(String, u64)]) -> Result<Vec<String>> {
        for _ in 0..3 {
            let mut batch = Batch::new();
            let mut written = Vec::new();

            for (name, timestamp) in observed {
                let row = match self
                    .engine
                    .get(MEMBERS, name)
                    .map_err(crate::coordinator::map_engine_err)?
                {
                    Some(row) => row,
                    None => continue,
                };
                let mut member: Member = serde_json::from_str(&row.value)?;
                if member.heartbeat >= *timestamp {
                    continue;
                }
                member.heartbeat = *timestamp;

                batch = batch
                    .require(Precondition::Equals {
                        table: MEMBERS.to_string(),
                        key: name.clone(),
                        value: row.value.clone(),
                    })
                    .put(MEMBERS, name, serde_json::to_string(&member)?);
                written.push(name.clone());
            }

            if batch.writes.is_empty() {
                return Ok(Vec::new());
            }

            let outcome = self.propose(batch).await?;
            if outcome.applied {
                debug!(count = written.len(), "heartbeat timestamps updated");
                return Ok(written);
            }
        }

        Err(Error::unavailable("heartbeat update kept losing races"))
    }

    /// Allocate the next row id. Returns the id and the precondition
    /// that guards it in the caller's batch.
    pub(crate) fn next_id(&self) -> Result<(u64, Precondition)> {
        let row = self
            .engine
            .get(META, NEXT_ID_KEY)
            .map_err(crate::coordinator::map_engine_err)?
            .ok_or_else(|| Error::internal("row-id counter missing"))?;
        let id: u64 = row
            .value
            .parse()
            .map_err(|e| Error::internal(format!("corrupt row-id counter: {e}")))?;

        Ok((
            id,
            Precondition::Equals {
                table: META.to_string(),
                key: NEXT_ID_KEY.to_string(),
                value: row.value,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::single_node;

    #[tokio::test]
    async fn admit_and_list() {
        let db = single_node("c1.example.com", "127.0.0.1:9001").await;
        db.create_token("c2.example.com", "secret-2", unix_now() + 600)
            .await
            .unwrap();

        let (member, members) = db
            .admit_member(
                "secret-2",
                "c2.example.com",
                "127.0.0.1:9002",
                "cert-2",
                1,
                0,
                vec![],
            )
            .await
            .unwrap();

        // Bootstrap took id 1 and the token id 2.
        assert_eq!(member.id, 3);
        assert_eq!(member.role, Role::Pending);
        assert_eq!(member.heartbeat, 0);
        assert_eq!(members.len(), 2);

        // The token is consumed.
        assert!(db.token("c2.example.com").unwrap().is_none());
    }

    #[tokio::test]
    async fn admit_with_wrong_secret_is_not_found() {
        let db = single_node("c1.example.com", "127.0.0.1:9001").await;
        db.create_token("c2.example.com", "secret-2", unix_now() + 600)
            .await
            .unwrap();

        let err = db
            .admit_member("wrong", "c2.example.com", "127.0.0.1:9002", "c", 1, 0, vec![])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), stratus_core::ErrorKind::NotFound);

        // A failed admission must not consume the token.
        assert!(db.token("c2.example.com").unwrap().is_some());
    }

    #[tokio::test]
    async fn admit_with_expired_token_is_not_found_and_sweeps() {
        let db = single_node("c1.example.com", "127.0.0.1:9001").await;
        db.create_token("c2.example.com", "secret-2", unix_now() - 1)
            .await
            .unwrap();

        let err = db
            .admit_member("secret-2", "c2.example.com", "127.0.0.1:9002", "c", 1, 0, vec![])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), stratus_core::ErrorKind::NotFound);
        assert!(db.token("c2.example.com").unwrap().is_none());
        assert!(db.member("c2.example.com").is_err());
    }

    #[tokio::test]
    async fn token_redeems_at_most_once() {
        let db = single_node("c1.example.com", "127.0.0.1:9001").await;
        db.create_token("c2.example.com", "secret-2", unix_now() + 600)
            .await
            .unwrap();

        let first = db
            .admit_member("secret-2", "c2.example.com", "127.0.0.1:9002", "c", 1, 0, vec![])
            .await;
        assert!(first.is_ok());

        let second = db
            .admit_member("secret-2", "c2.example.com", "127.0.0.1:9003", "c", 1, 0, vec![])
            .await;
        assert_eq!(
            second.unwrap_err().kind(),
            stratus_core::ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn duplicate_address_is_conflict() {
        let db = single_node("c1.example.com", "127.0.0.1:9001").await;
        db.create_token("c2.example.com", "secret-2", unix_now() + 600)
            .await
            .unwrap();

        let err = db
            .admit_member("secret-2", "c2.example.com", "127.0.0.1:9001", "c", 1, 0, vec![])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), stratus_core::ErrorKind::Conflict);
        assert!(err.message().contains("address"));
    }

    #[tokio::test]
    async fn update_member_applies_mutation() {
        let db = single_node("c1.example.com", "127.0.0.1:9001").await;
        let updated = db
            .update_member("c1.example.com", |mut m| {
                m.role = Role::Voter;
                m
            })
            .await
            .unwrap();
        assert_eq!(updated.role, Role::Voter);
        assert_eq!(db.member("c1.example.com").unwrap().role, Role::Voter);
    }

    #[tokio::test]
    async fn delete_member_removes_row_and_address() {
        let db = single_node("c1.example.com", "127.0.0.1:9001").await;
        db.delete_member("c1.example.com").await.unwrap();

        assert!(db.member("c1.example.com").is_err());
        let err = db.delete_member("c1.example.com").await.unwrap_err();
        assert_eq!(err.kind(), stratus_core::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn heartbeats_never_move_backward() {
        let db = single_node("c1.example.com", "127.0.0.1:9001").await;
        let now = unix_now();

        let written = db
            .update_heartbeats(&[("c1.example.com".to_string(), now + 10)])
            .await
            .unwrap();
        assert_eq!(written.len(), 1);

        // An older observation writes nothing.
        let written = db
            .update_heartbeats(&[("c1.example.com".to_string(), now + 5)])
            .await
            .unwrap();
        assert!(written.is_empty());
        assert_eq!(db.member("c1.example.com").unwrap().heartbeat, now + 10);
    }

    #[tokio::test]
    async fn heartbeat_for_vanished_member_is_skipped() {
        let db = single_node("c1.example.com", "127.0.0.1:9001").await;
        let written = db
            .update_heartbeats(&[("ghost.example.com".to_string(), unix_now())])
            .await
            .unwrap();
        assert!(written.is_empty());
    }
}
