//! The state machine: applies committed batches to typed tables.
//!
//! All replicated data lives in one redb table under composite
//! `"{table}/{key}"` keys with JSON string values. Preconditions are
//! evaluated inside the same write transaction as the batch's writes,
//! and batch reads observe the batch's own writes.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;

use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine};
use openraft::{
    Entry, EntryPayload, ErrorSubject, ErrorVerb, LogId, Snapshot, SnapshotMeta, StorageError,
    StoredMembership,
};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use crate::command::{ApplyOutcome, Batch, Precondition, ReadOp, Row, TypeConfig, WriteOp};

/// Replicated data under composite `"{table}/{key}"` keys.
const DATA: TableDefinition<&str, &[u8]> = TableDefinition::new("engine_data");

/// Last applied log id and stored membership.
const SM_META: TableDefinition<&str, &[u8]> = TableDefinition::new("engine_sm_meta");

const APPLIED_KEY: &str = "last_applied";
const MEMBERSHIP_KEY: &str = "membership";

fn read_err(e: impl std::fmt::Display) -> StorageError<u64> {
    StorageError::from_io_error(
        ErrorSubject::StateMachine,
        ErrorVerb::Read,
        std::io::Error::other(e.to_string()),
    )
}

fn write_err(e: impl std::fmt::Display) -> StorageError<u64> {
    StorageError::from_io_error(
        ErrorSubject::StateMachine,
        ErrorVerb::Write,
        std::io::Error::other(e.to_string()),
    )
}

fn data_key(table: &str, key: &str) -> String {
    format!("{table}/{key}")
}

/// Range covering every key of one logical table. `'0'` is the byte
/// after `'/'`, so the half-open range ends exactly at the prefix.
fn table_range(table: &str) -> (String, String) {
    (format!("{table}/"), format!("{table}0"))
}

/// State machine sharing the engine's redb database.
pub struct StateMachine {
    db: Arc<Database>,
}

/// Snapshot builder reading the current data table.
pub struct SnapshotBuilder {
    db: Arc<Database>,
}

impl StateMachine {
    pub fn new(db: Arc<Database>) -> Result<Self, StorageError<u64>> {
        let txn = db.begin_write().map_err(write_err)?;
        txn.open_table(DATA).map_err(write_err)?;
        txn.open_table(SM_META).map_err(write_err)?;
        txn.commit().map_err(write_err)?;

        Ok(Self { db })
    }

    fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError<u64>> {
        let txn = self.db.begin_read().map_err(read_err)?;
        let table = txn.open_table(SM_META).map_err(read_err)?;
        Ok(table
            .get(key)
            .map_err(read_err)?
            .map(|guard| guard.value().to_vec()))
    }

    /// Apply one batch and persist the applied log id in the same
    /// transaction, so a crash cannot double-apply.
    fn apply_batch(
        &self,
        log_id: &LogId<u64>,
        batch: &Batch,
    ) -> Result<ApplyOutcome, StorageError<u64>> {
        let txn = self.db.begin_write().map_err(write_err)?;
        let outcome;
        {
            let mut table = txn.open_table(DATA).map_err(write_err)?;

            let mut failed = None;
            for (index, precondition) in batch.preconditions.iter().enumerate() {
                let holds = match precondition {
                    Precondition::Exists { table: t, key } => table
                        .get(data_key(t, key).as_str())
                        .map_err(read_err)?
                        .is_some(),
                    Precondition::Absent { table: t, key } => table
                        .get(data_key(t, key).as_str())
                        .map_err(read_err)?
                        .is_none(),
                    Precondition::Equals { table: t, key, value } => table
                        .get(data_key(t, key).as_str())
                        .map_err(read_err)?
                        .is_some_and(|guard| guard.value() == value.as_bytes()),
                };

                if !holds {
                    failed = Some(index);
                    break;
                }
            }

            if let Some(index) = failed {
                outcome = ApplyOutcome::rejected(index);
            } else {
                for write in &batch.writes {
                    match write {
                        WriteOp::Put { table: t, key, value } => {
                            table
                                .insert(data_key(t, key).as_str(), value.as_bytes())
                                .map_err(write_err)?;
                        }
                        WriteOp::Delete { table: t, key } => {
                            table.remove(data_key(t, key).as_str()).map_err(write_err)?;
                        }
                    }
                }

                let mut rows = Vec::with_capacity(batch.reads.len());
                for read in &batch.reads {
                    rows.push(read_rows(&table, read)?);
                }

                outcome = ApplyOutcome {
                    applied: true,
                    failed_precondition: None,
                    rows,
                };
            }
        }
        {
            let mut meta = txn.open_table(SM_META).map_err(write_err)?;
            let raw = serde_json::to_vec(log_id).map_err(write_err)?;
            meta.insert(APPLIED_KEY, raw.as_slice()).map_err(write_err)?;
        }
        txn.commit().map_err(write_err)?;

        Ok(outcome)
    }

    fn save_meta(&self, key: &str, raw: &[u8]) -> Result<(), StorageError<u64>> {
        let txn = self.db.begin_write().map_err(write_err)?;
        {
            let mut table = txn.open_table(SM_META).map_err(write_err)?;
            table.insert(key, raw).map_err(write_err)?;
        }
        txn.commit().map_err(write_err)?;
        Ok(())
    }
}

fn read_rows<T: ReadableTable<&'static str, &'static [u8]>>(
    table: &T,
    read: &ReadOp,
) -> Result<Vec<Row>, StorageError<u64>> {
    match read {
        ReadOp::Get { table: t, key } => {
            let row = table
                .get(data_key(t, key).as_str())
                .map_err(read_err)?
                .map(|guard| Row {
                    key: key.clone(),
                    value: String::from_utf8_lossy(guard.value()).to_string(),
                });
            Ok(row.into_iter().collect())
        }
        ReadOp::Scan { table: t } => {
            let (start, end) = table_range(t);
            let prefix_len = start.len();
            let mut rows = Vec::new();
            for item in table
                .range(start.as_str()..end.as_str())
                .map_err(read_err)?
            {
                let (key, value) = item.map_err(read_err)?;
                rows.push(Row {
                    key: key.value()[prefix_len..].to_string(),
                    value: String::from_utf8_lossy(value.value()).to_string(),
                });
            }
            Ok(rows)
        }
    }
}

/// Read one key from the local state machine, outside the raft log.
///
/// Relaxed: the local state machine may lag the leader.
pub fn local_get(db: &Database, table: &str, key: &str) -> Result<Option<Row>, StorageError<u64>> {
    let txn = db.begin_read().map_err(read_err)?;
    let data = txn.open_table(DATA).map_err(read_err)?;
    read_rows(&data, &ReadOp::Get {
        table: table.to_string(),
        key: key.to_string(),
    })
    .map(|mut rows| rows.pop())
}

/// Scan one logical table from the local state machine.
pub fn local_scan(db: &Database, table: &str) -> Result<Vec<Row>, StorageError<u64>> {
    let txn = db.begin_read().map_err(read_err)?;
    let data = txn.open_table(DATA).map_err(read_err)?;
    read_rows(&data, &ReadOp::Scan {
        table: table.to_string(),
    })
}

impl RaftStateMachine<TypeConfig> for StateMachine {
    type SnapshotBuilder = SnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<u64>>, StoredMembership<u64, openraft::BasicNode>), StorageError<u64>>
    {
        let applied = match self.get_meta(APPLIED_KEY)? {
            Some(raw) => Some(serde_json::from_slice(&raw).map_err(read_err)?),
            None => None,
        };
        let membership = match self.get_meta(MEMBERSHIP_KEY)? {
            Some(raw) => serde_json::from_slice(&raw).map_err(read_err)?,
            None => StoredMembership::default(),
        };

        Ok((applied, membership))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<ApplyOutcome>, StorageError<u64>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
        I::IntoIter: Send,
    {
        let mut outcomes = Vec::new();

        for entry in entries {
            let log_id = entry.log_id;
            match entry.payload {
                EntryPayload::Blank => {
                    let raw = serde_json::to_vec(&log_id).map_err(write_err)?;
                    self.save_meta(APPLIED_KEY, &raw)?;
                    outcomes.push(ApplyOutcome {
                        applied: true,
                        ..Default::default()
                    });
                }
                EntryPayload::Normal(batch) => {
                    let outcome = self.apply_batch(&log_id, &batch)?;
                    debug!(
                        index = log_id.index,
                        applied = outcome.applied,
                        "applied batch"
                    );
                    outcomes.push(outcome);
                }
                EntryPayload::Membership(membership) => {
                    let stored = StoredMembership::new(Some(log_id), membership);
                    let raw = serde_json::to_vec(&stored).map_err(write_err)?;
                    self.save_meta(MEMBERSHIP_KEY, &raw)?;
                    let raw = serde_json::to_vec(&log_id).map_err(write_err)?;
                    self.save_meta(APPLIED_KEY, &raw)?;
                    outcomes.push(ApplyOutcome {
                        applied: true,
                        ..Default::default()
                    });
                }
            }
        }

        Ok(outcomes)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        SnapshotBuilder {
            db: Arc::clone(&self.db),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<u64>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<u64, openraft::BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<u64>> {
        let contents: BTreeMap<String, String> =
            serde_json::from_slice(&snapshot.into_inner()).map_err(read_err)?;

        let txn = self.db.begin_write().map_err(write_err)?;
        {
            let mut table = txn.open_table(DATA).map_err(write_err)?;

            let keys: Vec<String> = table
                .iter()
                .map_err(write_err)?
                .map(|item| item.map(|(k, _)| k.value().to_string()))
                .collect::<Result<_, _>>()
                .map_err(write_err)?;
            for key in &keys {
                table.remove(key.as_str()).map_err(write_err)?;
            }

            for (key, value) in &contents {
                table
                    .insert(key.as_str(), value.as_bytes())
                    .map_err(write_err)?;
            }
        }
        txn.commit().map_err(write_err)?;

        let raw = serde_json::to_vec(&meta.last_log_id).map_err(write_err)?;
        self.save_meta(APPLIED_KEY, &raw)?;
        let raw = serde_json::to_vec(&meta.last_membership).map_err(write_err)?;
        self.save_meta(MEMBERSHIP_KEY, &raw)?;

        debug!(snapshot_id = %meta.snapshot_id, "installed snapshot");
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<u64>> {
        if self.get_meta(APPLIED_KEY)?.is_none() {
            return Ok(None);
        }

        let mut builder = SnapshotBuilder {
            db: Arc::clone(&self.db),
        };
        Ok(Some(builder.build_snapshot().await?))
    }
}

impl RaftSnapshotBuilder<TypeConfig> for SnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<u64>> {
        let txn = self.db.begin_read().map_err(read_err)?;

        let table = txn.open_table(DATA).map_err(read_err)?;
        let mut contents = BTreeMap::new();
        for item in table.iter().map_err(read_err)? {
            let (key, value) = item.map_err(read_err)?;
            contents.insert(
                key.value().to_string(),
                String::from_utf8_lossy(value.value()).to_string(),
            );
        }

        let meta_table = txn.open_table(SM_META).map_err(read_err)?;
        let last_applied: Option<LogId<u64>> = match meta_table.get(APPLIED_KEY).map_err(read_err)? {
            Some(raw) => Some(serde_json::from_slice(raw.value()).map_err(read_err)?),
            None => None,
        };
        let membership: StoredMembership<u64, openraft::BasicNode> =
            match meta_table.get(MEMBERSHIP_KEY).map_err(read_err)? {
                Some(raw) => serde_json::from_slice(raw.value()).map_err(read_err)?,
                None => StoredMembership::default(),
            };

        drop(meta_table);
        drop(table);
        drop(txn);

        let data = serde_json::to_vec(&contents).map_err(read_err)?;
        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership: membership,
            snapshot_id: format!("snapshot-{}", last_applied.map_or(0, |l| l.index)),
        };

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}
