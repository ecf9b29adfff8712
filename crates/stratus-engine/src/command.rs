//! Write batches, preconditions, and the raft type configuration.

use std::io::Cursor;

use openraft::TokioRuntime;
use serde::{Deserialize, Serialize};

/// A condition that must hold when the batch is applied.
///
/// Preconditions are evaluated in order against the state machine at
/// apply time, after every previously committed batch and before this
/// batch's writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precondition {
    /// The key must be present.
    Exists { table: String, key: String },
    /// The key must be absent.
    Absent { table: String, key: String },
    /// The key must be present with exactly this value.
    Equals {
        table: String,
        key: String,
        value: String,
    },
}

/// A single write in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOp {
    Put {
        table: String,
        key: String,
        value: String,
    },
    Delete { table: String, key: String },
}

/// A read evaluated atomically with the batch, after its writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadOp {
    Get { table: String, key: String },
    Scan { table: String },
}

/// A conditional write batch, the unit of replication.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub preconditions: Vec<Precondition>,
    pub writes: Vec<WriteOp>,
    pub reads: Vec<ReadOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, precondition: Precondition) -> Self {
        self.preconditions.push(precondition);
        self
    }

    pub fn put(mut self, table: &str, key: &str, value: String) -> Self {
        self.writes.push(WriteOp::Put {
            table: table.to_string(),
            key: key.to_string(),
            value,
        });
        self
    }

    pub fn delete(mut self, table: &str, key: &str) -> Self {
        self.writes.push(WriteOp::Delete {
            table: table.to_string(),
            key: key.to_string(),
        });
        self
    }

    pub fn get(mut self, table: &str, key: &str) -> Self {
        self.reads.push(ReadOp::Get {
            table: table.to_string(),
            key: key.to_string(),
        });
        self
    }

    pub fn scan(mut self, table: &str) -> Self {
        self.reads.push(ReadOp::Scan {
            table: table.to_string(),
        });
        self
    }
}

/// One stored row returned from a batch read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub key: String,
    pub value: String,
}

/// The result of applying a batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyOutcome {
    /// Whether the writes were applied.
    pub applied: bool,
    /// Index of the first precondition that failed, when not applied.
    pub failed_precondition: Option<usize>,
    /// One row set per [`ReadOp`], in request order. Empty when the
    /// batch was not applied.
    pub rows: Vec<Vec<Row>>,
}

impl ApplyOutcome {
    pub fn rejected(index: usize) -> Self {
        Self {
            applied: false,
            failed_precondition: Some(index),
            rows: Vec::new(),
        }
    }
}

openraft::declare_raft_types!(
    /// Stratus raft type configuration.
    pub TypeConfig:
        D = Batch,
        R = ApplyOutcome,
        NodeId = u64,
        Node = openraft::BasicNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

/// Convenience alias for the raft instance.
pub type StratusRaft = openraft::Raft<TypeConfig>;
