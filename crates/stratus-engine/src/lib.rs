//! stratus-engine — the replicated store underneath the cluster core.
//!
//! Uses openraft for leader election, log replication, and dynamic
//! reconfiguration, with redb for durable log and state machine
//! storage. Writes are conditional batches: preconditions evaluated
//! at apply time gate the writes, so a batch that lost a race fails
//! deterministically on every member.
//!
//! The transport is injected: the engine dials peers through a
//! [`Dialer`] capability handle and accepts inbound streams handed
//! over by the endpoint layer after an HTTP upgrade, so the engine
//! itself never owns a socket.
//!
//! # Modules
//!
//! - [`command`] — batch/precondition/read types and the raft `TypeConfig`
//! - [`log`] — raft log storage backed by redb
//! - [`machine`] — state machine applying committed batches
//! - [`transport`] — framed RPC transport over dialed streams
//! - [`engine`] — the facade wrapped by the database coordinator

pub mod command;
pub mod engine;
pub mod log;
pub mod machine;
pub mod transport;

pub use command::{ApplyOutcome, Batch, Precondition, ReadOp, Row, StratusRaft, TypeConfig, WriteOp};
pub use engine::{node_id, Engine, EngineError, EngineMember, EngineRole};
pub use log::LogStore;
pub use machine::StateMachine;
pub use transport::{Dialer, RawStream, StreamServer};
