//! The application description a consumer hands to the daemon.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;

use stratus_core::{Hooks, NoHooks, Result};
use stratus_db::Migration;

use crate::daemon::Daemon;

/// Everything a consuming application contributes: state directory,
/// schema migrations, API-capability labels, lifecycle hooks,
/// additional listeners, and REST resources.
pub struct App {
    pub(crate) state_dir: PathBuf,
    pub(crate) migrations: Vec<Migration>,
    pub(crate) extensions: Vec<String>,
    pub(crate) hooks: Arc<dyn Hooks>,
    /// Additional listeners: (name, address, router).
    pub(crate) servers: Vec<(String, String, Router)>,
    /// Consumer REST resources: (prefix, router).
    pub(crate) resources: Vec<(String, Router)>,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) drain_timeout: Option<Duration>,
}

impl App {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            migrations: Vec::new(),
            extensions: Vec::new(),
            hooks: Arc::new(NoHooks),
            servers: Vec::new(),
            resources: Vec::new(),
            heartbeat_interval: stratus_cluster::heartbeat::DEFAULT_HEARTBEAT_INTERVAL,
            drain_timeout: Some(Duration::from_secs(5)),
        }
    }

    /// Application schema migrations, in order. The list only ever
    /// grows between releases.
    pub fn with_migrations(mut self, migrations: Vec<Migration>) -> Self {
        self.migrations = migrations;
        self
    }

    /// API-capability labels this build announces, in order.
    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn Hooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// An additional HTTPS listener with its own keypair.
    pub fn with_server(mut self, name: &str, address: &str, router: Router) -> Self {
        self.servers
            .push((name.to_string(), address.to_string(), router));
        self
    }

    /// A consumer resource tree mounted under `prefix` on the core
    /// listeners.
    pub fn with_resource(mut self, prefix: &str, router: Router) -> Self {
        self.resources.push((prefix.to_string(), router));
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Per-listener drain timeout on shutdown; `None` closes
    /// connections immediately.
    pub fn with_drain_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Compose the daemon without running it.
    pub fn into_daemon(self) -> Result<Arc<Daemon>> {
        Daemon::new(self)
    }

    /// Compose and serve until shutdown.
    pub async fn run(self) -> Result<()> {
        let daemon = Daemon::new(self)?;
        daemon.run().await
    }
}
