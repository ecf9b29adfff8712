//! stratus-client — outbound connections to cluster peers.
//!
//! A [`PeerClient`] speaks JSON-over-HTTPS to one peer with mutual
//! TLS: it presents this member's server keypair and pins the peer's
//! expected certificate byte-exact. The [`dial`] module carries the
//! replication-stream upgrade used by the engine transport, plus the
//! anonymous certificate fetch used before any trust exists.

pub mod client;
pub mod dial;

pub use client::PeerClient;
pub use dial::{dial_database, fetch_peer_certificate};
