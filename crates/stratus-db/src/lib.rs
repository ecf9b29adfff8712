//! stratus-db — the coordinator between the cluster core and the
//! replicated store.
//!
//! Owns the database status machine, the schema and API-capability
//! upgrade fence that gates bring-up, the transaction retry contract,
//! and the typed accessors for the replicated member, token, and
//! schema records.

pub mod coordinator;
pub mod members;
pub mod schema;
pub mod tokens;

#[cfg(test)]
pub(crate) mod test_support;

pub use coordinator::{Coordinator, Status};
pub use schema::{Migration, MigrationContext};
