//! stratus-cluster — the replicated membership service.
//!
//! Operations over the shared [`ClusterState`]: issuing and redeeming
//! join tokens, the join candidate loop and peer-side admission,
//! quorum-safe removal with peer fanout, derived member state, and
//! the leader-driven heartbeat loop that keeps liveness, trust, and
//! replication roles converged.

pub mod heartbeat;
pub mod join;
pub mod membership;
pub mod remove;
pub mod state;
pub mod tokens;

#[cfg(test)]
pub(crate) mod test_support;

pub use heartbeat::HeartbeatLoop;
pub use state::{Callbacks, ClusterState, StartApiArgs};
