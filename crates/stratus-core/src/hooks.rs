//! Lifecycle hooks invoked by the daemon at defined points.
//!
//! Consuming applications implement [`Hooks`] and override the slots
//! they care about; every unset slot defaults to a no-op. Errors from
//! `pre_init`, `pre_join`, `pre_remove`, and `post_bootstrap` abort
//! the surrounding operation; errors from the remaining slots are
//! logged by the caller and otherwise ignored.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::config::DaemonConfig;
use crate::error::Result;
use crate::types::{MemberLocation, MemberState};

/// Per-member liveness passed to `on_heartbeat`.
pub type RoleStatusMap = HashMap<String, MemberState>;

/// The fixed set of lifecycle callback slots.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// Before any listeners come up for a bootstrap or join.
    async fn pre_init(
        &self,
        _bootstrap: bool,
        _init_config: &HashMap<String, String>,
    ) -> Result<()> {
        Ok(())
    }

    /// After a bootstrap has committed.
    async fn post_bootstrap(&self, _init_config: &HashMap<String, String>) -> Result<()> {
        Ok(())
    }

    /// Before the local side of a join begins mutating state.
    async fn pre_join(&self, _init_config: &HashMap<String, String>) -> Result<()> {
        Ok(())
    }

    /// After a join has fully completed.
    async fn post_join(&self) -> Result<()> {
        Ok(())
    }

    /// On every existing peer after a join admits a new member.
    async fn on_new_member(&self, _member: &MemberLocation) -> Result<()> {
        Ok(())
    }

    /// On the target before it is removed from the cluster.
    async fn pre_remove(&self, _force: bool) -> Result<()> {
        Ok(())
    }

    /// On every remaining peer after a member was removed.
    async fn post_remove(&self, _force: bool) -> Result<()> {
        Ok(())
    }

    /// After the daemon is fully up and ready.
    async fn on_start(&self) -> Result<()> {
        Ok(())
    }

    /// Once per heartbeat tick on the leader, with the derived
    /// per-member state map.
    async fn on_heartbeat(&self, _roles: &RoleStatusMap) -> Result<()> {
        Ok(())
    }

    /// After the local daemon configuration changed.
    async fn on_daemon_config_update(&self, _config: &DaemonConfig) -> Result<()> {
        Ok(())
    }
}

/// The default hook set: every slot is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

#[async_trait]
impl Hooks for NoHooks {}
