//! Schema migrations and the cluster-wide upgrade fence.
//!
//! Bring-up is fenced: a member first publishes the schema versions
//! and API extensions it was compiled with on its own row, then reads
//! every member's published versions. It only migrates and declares
//! Ready once nobody is ahead of it and nobody is behind it, so the
//! replicated schema row never advances past the minimum across all
//! members.

use std::time::Duration;

use tracing::{info, warn};

use stratus_core::types::SchemaRow;
use stratus_core::{Error, Member, Result};
use stratus_engine::{Batch, Precondition, WriteOp};

use crate::coordinator::{Coordinator, Status, MEMBERS, META, NEXT_ID_KEY, SCHEMA};

/// How long a Waiting fence sleeps before rechecking when no upgrade
/// notification arrives.
pub(crate) const FENCE_RECHECK_INTERVAL: Duration = Duration::from_secs(30);

/// How often the fence retries reading the self row while a fresh
/// learner catches up with the replicated log.
const SELF_ROW_RETRY: Duration = Duration::from_millis(500);
const SELF_ROW_ATTEMPTS: usize = 60;

/// A schema migration: reads the current state and queues writes.
/// Migrations run in list order inside a single replicated batch
/// together with the schema row advance.
pub type Migration = fn(&mut MigrationContext<'_>) -> Result<()>;

/// Read and write access handed to migration functions.
pub struct MigrationContext<'a> {
    coordinator: &'a Coordinator,
    writes: Vec<WriteOp>,
}

impl MigrationContext<'_> {
    pub fn get(&self, table: &str, key: &str) -> Result<Option<String>> {
        self.coordinator
            .engine
            .get(table, key)
            .map(|row| row.map(|r| r.value))
            .map_err(crate::coordinator::map_engine_err)
    }

    pub fn scan(&self, table: &str) -> Result<Vec<(String, String)>> {
        self.coordinator
            .engine
            .scan(table)
            .map(|rows| rows.into_iter().map(|r| (r.key, r.value)).collect())
            .map_err(crate::coordinator::map_engine_err)
    }

    pub fn put(&mut self, table: &str, key: &str, value: String) {
        self.writes.push(WriteOp::Put {
            table: table.to_string(),
            key: key.to_string(),
            value,
        });
    }

    pub fn delete(&mut self, table: &str, key: &str) {
        self.writes.push(WriteOp::Delete {
            table: table.to_string(),
            key: key.to_string(),
        });
    }
}

/// The library's own migrations, applied before the application's.
pub(crate) fn internal_migrations() -> Vec<Migration> {
    vec![seed_meta]
}

/// The library's own schema version this binary is compiled with.
pub fn internal_schema_version() -> u64 {
    internal_migrations().len() as u64
}

/// Initial layout: the row-id counter.
fn seed_meta(ctx: &mut MigrationContext<'_>) -> Result<()> {
    if ctx.get(META, NEXT_ID_KEY)?.is_none() {
        ctx.put(META, NEXT_ID_KEY, "1".to_string());
    }
    Ok(())
}

/// Outcome of comparing our versions against every member's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FenceVerdict {
    /// All members publish our versions.
    Equal,
    /// At least one member is behind us; wait for it.
    OthersBehind,
}

/// Compare one version column. `Ok(true)` means someone is behind us.
pub(crate) fn check_version_column(own: u64, others: &[u64]) -> Result<bool> {
    let mut others_behind = false;
    for &version in others {
        if version == own {
            continue;
        }
        if version < own {
            // Someone still runs the old build; hold until they are
            // upgraded and restarted.
            others_behind = true;
            continue;
        }
        return Err(Error::failed_precondition(
            "this node's version is behind, please upgrade",
        ));
    }

    Ok(others_behind)
}

/// Compare API extension lists by ordered prefix.
pub(crate) fn check_extensions(own: &[String], others: &[Vec<String>]) -> Result<bool> {
    let mut others_behind = false;
    for other in others {
        let shared = own.len().min(other.len());
        if own[..shared] != other[..shared] {
            return Err(Error::failed_precondition(format!(
                "api extension mismatch: {:?} and {:?} diverge",
                own, other
            )));
        }

        if other.len() < own.len() {
            others_behind = true;
        } else if other.len() > own.len() {
            return Err(Error::failed_precondition(
                "this node's api extensions are behind, please upgrade",
            ));
        }
    }

    Ok(others_behind)
}

impl Coordinator {
    pub fn schema_row(&self) -> Result<SchemaRow> {
        match self
            .engine
            .get(SCHEMA, "row")
            .map_err(crate::coordinator::map_engine_err)?
        {
            Some(row) => Ok(serde_json::from_str(&row.value)?),
            None => Ok(SchemaRow::default()),
        }
    }

    /// The upgrade fence. Loops until every member publishes our
    /// versions, then migrates; errors out if we are the stale one.
    pub(crate) async fn wait_upgrade(&self) -> Result<()> {
        loop {
            let (members, self_row) = self.publish_own_versions().await?;

            let verdict = self.compare_versions(&self_row, &members)?;
            match verdict {
                FenceVerdict::Equal => {
                    self.run_migrations().await?;
                    return Ok(());
                }
                FenceVerdict::OthersBehind => {
                    self.set_status(Status::Waiting);
                    warn!("waiting for other cluster members to upgrade their versions");
                    self.wait_for_upgrade_notification().await;
                }
            }
        }
    }

    /// Write our compiled versions onto the self row and read every
    /// member's row, atomically. CAS-retried, and patient while a
    /// fresh learner waits for its own row to replicate.
    async fn publish_own_versions(&self) -> Result<(Vec<Member>, Member)> {
        let (internal, external) = self.schema_version();

        for _ in 0..SELF_ROW_ATTEMPTS {
            let current = match self
                .engine
                .get(MEMBERS, &self.name)
                .map_err(crate::coordinator::map_engine_err)?
            {
                Some(row) => row.value,
                None => {
                    tokio::time::sleep(SELF_ROW_RETRY).await;
                    continue;
                }
            };

            let mut row: Member = serde_json::from_str(&current)?;
            row.schema_internal = internal;
            row.schema_external = external;
            row.api_extensions = self.api_extensions.clone();
            let updated = serde_json::to_string(&row)?;

            let batch = Batch::new()
                .require(Precondition::Equals {
                    table: MEMBERS.to_string(),
                    key: self.name.clone(),
                    value: current,
                })
                .put(MEMBERS, &self.name, updated)
                .scan(MEMBERS);

            let outcome = self.propose(batch).await?;
            if !outcome.applied {
                // Lost a CAS race (e.g. the leader touched our
                // heartbeat column); reload and retry.
                continue;
            }

            let members: Vec<Member> = outcome.rows[0]
                .iter()
                .map(|r| serde_json::from_str(&r.value))
                .collect::<std::result::Result<_, _>>()?;
            return Ok((members, row));
        }

        Err(Error::unavailable(
            "timed out waiting for the local member row to replicate",
        ))
    }

    fn compare_versions(&self, own: &Member, members: &[Member]) -> Result<FenceVerdict> {
        let internals: Vec<u64> = members.iter().map(|m| m.schema_internal).collect();
        let externals: Vec<u64> = members.iter().map(|m| m.schema_external).collect();
        let extensions: Vec<Vec<String>> =
            members.iter().map(|m| m.api_extensions.clone()).collect();

        // Evaluate every axis before deciding, so two nodes cannot end
        // up waiting on each other across an awkward upgrade.
        let internal_behind = check_version_column(own.schema_internal, &internals)?;
        let external_behind = check_version_column(own.schema_external, &externals)?;
        let extensions_behind = check_extensions(&own.api_extensions, &extensions)?;

        if internal_behind || external_behind || extensions_behind {
            Ok(FenceVerdict::OthersBehind)
        } else {
            Ok(FenceVerdict::Equal)
        }
    }

    /// Run every migration past the committed schema row and advance
    /// it, in one batch gated on the row not having moved. A lost race
    /// means another member migrated first, which is success.
    async fn run_migrations(&self) -> Result<()> {
        let committed = self.schema_row()?;
        let (internal, external) = self.schema_version();
        if committed.internal == internal && committed.external == external {
            return Ok(());
        }

        let mut ctx = MigrationContext {
            coordinator: self,
            writes: Vec::new(),
        };

        let internal_list = internal_migrations();
        for migration in internal_list.iter().skip(committed.internal as usize) {
            migration(&mut ctx)?;
        }
        for migration in self.migrations.iter().skip(committed.external as usize) {
            migration(&mut ctx)?;
        }

        let old = serde_json::to_string(&committed)?;
        let new = serde_json::to_string(&SchemaRow { internal, external })?;
        let mut batch = Batch::new().put(SCHEMA, "row", new);
        // Only gate on the old row actually existing; a fresh store
        // has no row and the default is the zero version.
        if self.engine.get(SCHEMA, "row").map_err(crate::coordinator::map_engine_err)?.is_some() {
            batch = batch.require(Precondition::Equals {
                table: SCHEMA.to_string(),
                key: "row".to_string(),
                value: old,
            });
        }
        batch.writes.splice(0..0, std::mem::take(&mut ctx.writes));

        let outcome = self.propose(batch).await?;
        if outcome.applied {
            info!(internal, external, "schema migrated");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_versions_are_equal() {
        assert!(!check_version_column(3, &[3, 3, 3]).unwrap());
    }

    #[test]
    fn stale_peer_means_others_behind() {
        assert!(check_version_column(3, &[3, 2, 3]).unwrap());
    }

    #[test]
    fn newer_peer_means_self_behind() {
        let err = check_version_column(3, &[3, 4]).unwrap_err();
        assert_eq!(err.kind(), stratus_core::ErrorKind::FailedPrecondition);
    }

    #[test]
    fn newer_peer_wins_even_with_stale_peer_present() {
        // One behind and one ahead: behind must not mask ahead.
        assert!(check_version_column(3, &[2, 4]).is_err());
    }

    #[test]
    fn extension_prefix_is_behind() {
        let own = vec!["a".to_string(), "b".to_string()];
        let others = vec![vec!["a".to_string()]];
        assert!(check_extensions(&own, &others).unwrap());
    }

    #[test]
    fn extension_superset_is_self_behind() {
        let own = vec!["a".to_string()];
        let others = vec![vec!["a".to_string(), "b".to_string()]];
        assert!(check_extensions(&own, &others).is_err());
    }

    #[test]
    fn extension_positional_mismatch_is_hard_error() {
        let own = vec!["a".to_string(), "b".to_string()];
        let others = vec![vec!["a".to_string(), "c".to_string()]];
        let err = check_extensions(&own, &others).unwrap_err();
        assert!(err.message().contains("mismatch"));
    }

    #[test]
    fn equal_extensions_are_equal() {
        let own = vec!["a".to_string()];
        assert!(!check_extensions(&own, &[own.clone()]).unwrap());
    }

    #[tokio::test]
    async fn migrations_advance_schema_row() {
        let db = crate::test_support::single_node("c1.example.com", "127.0.0.1:9001").await;

        // Bootstrap installed version-max, so migrations are a no-op.
        let before = db.schema_row().unwrap();
        db.run_migrations().await.unwrap();
        assert_eq!(db.schema_row().unwrap(), before);
    }
}
