//! Typed accessors for the replicated join-token table.

use tracing::{debug, info};

use stratus_core::types::unix_now;
use stratus_core::{Error, Result, TokenRecord};
use stratus_engine::{Batch, Precondition};

use crate::coordinator::{Coordinator, TOKENS};

impl Coordinator {
    /// Persist a new token for `name`. One outstanding token per
    /// joiner name.
    pub async fn create_token(&self, name: &str, secret: &str, expiry: u64) -> Result<TokenRecord> {
        for _ in 0..10 {
            let (id, id_precondition) = self.next_id()?;
            let token = TokenRecord {
                id,
                secret: secret.to_string(),
                name: name.to_string(),
                expiry,
            };

            let batch = Batch::new()
                .require(id_precondition)
                .require(Precondition::Absent {
                    table: TOKENS.to_string(),
                    key: name.to_string(),
                })
                .put(
                    crate::coordinator::META,
                    crate::coordinator::NEXT_ID_KEY,
                    (id + 1).to_string(),
                )
                .put(TOKENS, name, serde_json::to_string(&token)?);

            let outcome = self.propose(batch).await?;
            if outcome.applied {
                info!(%name, expiry, "join token issued");
                return Ok(token);
            }

            match outcome.failed_precondition {
                Some(0) => continue,
                Some(1) => {
                    return Err(Error::conflict(format!(
                        "a join token for {name:?} already exists"
                    )))
                }
                _ => return Err(Error::internal("token batch rejected unexpectedly")),
            }
        }

        Err(Error::unavailable("token creation kept losing id allocation"))
    }

    /// The token issued for `name`, if any.
    pub fn token(&self, name: &str) -> Result<Option<TokenRecord>> {
        match self
            .engine
            .get(TOKENS, name)
            .map_err(crate::coordinator::map_engine_err)?
        {
            Some(row) => Ok(Some(serde_json::from_str(&row.value)?)),
            None => Ok(None),
        }
    }

    /// All outstanding tokens.
    pub fn tokens(&self) -> Result<Vec<TokenRecord>> {
        let rows = self
            .engine
            .scan(TOKENS)
            .map_err(crate::coordinator::map_engine_err)?;
        let mut tokens: Vec<TokenRecord> = rows
            .iter()
            .map(|r| serde_json::from_str(&r.value))
            .collect::<std::result::Result<_, _>>()?;
        tokens.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tokens)
    }

    /// Delete the token for `name`. Missing tokens are fine.
    pub async fn delete_token(&self, name: &str) -> Result<()> {
        let batch = Batch::new()
            .require(Precondition::Exists {
                table: TOKENS.to_string(),
                key: name.to_string(),
            })
            .delete(TOKENS, name);

        let _ = self.propose(batch).await?;
        Ok(())
    }

    /// Drop every token past its expiry. Lost races are ignored.
    pub async fn sweep_expired_tokens(&self) -> Result<usize> {
        let now = unix_now();
        let mut swept = 0;

        for token in self.tokens()? {
            if !token.is_expired(now) {
                continue;
            }

            let batch = Batch::new()
                .require(Precondition::Equals {
                    table: TOKENS.to_string(),
                    key: token.name.clone(),
                    value: serde_json::to_string(&token)?,
                })
                .delete(TOKENS, &token.name);

            if self.propose(batch).await?.applied {
                debug!(name = %token.name, "expired join token swept");
                swept += 1;
            }
        }

        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::single_node;

    #[tokio::test]
    async fn create_and_lookup() {
        let db = single_node("c1.example.com", "127.0.0.1:9001").await;
        let token = db
            .create_token("c2.example.com", "secret-2", unix_now() + 600)
            .await
            .unwrap();
        assert_eq!(token.id, 2);

        let found = db.token("c2.example.com").unwrap().unwrap();
        assert_eq!(found, token);
        assert!(db.token("c3.example.com").unwrap().is_none());
    }

    #[tokio::test]
    async fn second_token_for_same_name_conflicts() {
        let db = single_node("c1.example.com", "127.0.0.1:9001").await;
        db.create_token("c2.example.com", "a", unix_now() + 600)
            .await
            .unwrap();

        let err = db
            .create_token("c2.example.com", "b", unix_now() + 600)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), stratus_core::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn sweep_removes_only_expired() {
        let db = single_node("c1.example.com", "127.0.0.1:9001").await;
        let now = unix_now();
        db.create_token("old.example.com", "a", now - 10).await.unwrap();
        db.create_token("new.example.com", "b", now + 600).await.unwrap();

        let swept = db.sweep_expired_tokens().await.unwrap();
        assert_eq!(swept, 1);
        assert!(db.token("old.example.com").unwrap().is_none());
        assert!(db.token("new.example.com").unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_missing_token_is_fine() {
        let db = single_node("c1.example.com", "127.0.0.1:9001").await;
        db.delete_token("ghost.example.com").await.unwrap();
    }
}
