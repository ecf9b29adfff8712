//! stratus-core — shared building blocks for the stratus cluster library.
//!
//! This crate holds everything the other stratus crates agree on:
//! the replicated record types and their wire representations, the
//! daemon configuration file, the error taxonomy with its HTTP
//! mapping, and the lifecycle hook trait that consuming applications
//! implement.

pub mod config;
pub mod error;
pub mod hooks;
pub mod messages;
pub mod types;

pub use config::DaemonConfig;
pub use error::{Error, ErrorKind, Result};
pub use hooks::{Hooks, NoHooks};
pub use types::{Member, MemberLocation, MemberState, Role, SchemaRow, TokenRecord};
