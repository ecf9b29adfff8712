//! Shared cluster state handed to the REST handlers and the
//! background loops.
//!
//! The daemon constructs the leaves first (trust store, endpoint
//! manager, engine) and injects capability handles here instead of
//! back-pointers: the control driver, the reset path, and the
//! replication-stream hand-off are closures installed at composition
//! time.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use tokio::sync::watch;
use tracing::warn;

use stratus_client::PeerClient;
use stratus_core::messages::CertificateBundle;
use stratus_core::{DaemonConfig, Error, Hooks, Result};
use stratus_db::Coordinator;
use stratus_engine::RawStream;
use stratus_trust::certs::KeyPair;
use stratus_trust::{Remote, TrustStore};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Arguments to the daemon's API-start driver.
pub struct StartApiArgs {
    pub bootstrap: bool,
    pub init_config: HashMap<String, String>,
    /// The encoded join token; `None` on bootstrap.
    pub join_token: Option<String>,
}

/// Capability handles injected by the daemon.
pub struct Callbacks {
    /// Bring the daemon from pre-init to serving: certificates,
    /// engine, fence, heartbeat. Driven by `POST /core/control`.
    pub start_api: Arc<dyn Fn(StartApiArgs) -> BoxFuture<Result<()>> + Send + Sync>,
    /// Wipe the local state directory and stop the daemon so a
    /// supervisor restarts it into the pre-init state.
    pub reset: Arc<dyn Fn(bool) -> BoxFuture<Result<()>> + Send + Sync>,
    /// Hand an upgraded replication stream to the engine's server.
    pub attach_stream: Arc<dyn Fn(Box<dyn RawStream>) -> Result<()> + Send + Sync>,
}

impl Callbacks {
    /// Placeholder set that rejects everything; unit tests that never
    /// exercise the daemon paths use this.
    pub fn unwired() -> Self {
        fn unwired_err<T>() -> Result<T> {
            Err(Error::internal("daemon callback not wired"))
        }

        Self {
            start_api: Arc::new(|_| Box::pin(async { unwired_err() })),
            reset: Arc::new(|_| Box::pin(async { unwired_err() })),
            attach_stream: Arc::new(|_| unwired_err()),
        }
    }
}

/// Everything the membership service operates on.
pub struct ClusterState {
    state_dir: PathBuf,
    /// API extensions this binary is compiled with, in announcement
    /// order.
    extensions: Vec<String>,
    /// Number of application schema migrations compiled in.
    schema_external: u64,
    hooks: Arc<dyn Hooks>,
    trust: Arc<TrustStore>,
    config: RwLock<Option<DaemonConfig>>,
    db: RwLock<Option<Arc<Coordinator>>>,
    server_keypair: RwLock<Option<Arc<KeyPair>>>,
    cluster_keypair: RwLock<Option<Arc<KeyPair>>>,
    additional_certs: RwLock<HashMap<String, CertificateBundle>>,
    ready: watch::Receiver<bool>,
    pub callbacks: Callbacks,
}

impl ClusterState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state_dir: &Path,
        schema_external: u64,
        extensions: Vec<String>,
        hooks: Arc<dyn Hooks>,
        trust: Arc<TrustStore>,
        ready: watch::Receiver<bool>,
        callbacks: Callbacks,
    ) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
            extensions,
            schema_external,
            hooks,
            trust,
            config: RwLock::new(None),
            db: RwLock::new(None),
            server_keypair: RwLock::new(None),
            cluster_keypair: RwLock::new(None),
            additional_certs: RwLock::new(HashMap::new()),
            ready,
            callbacks,
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// (internal, external) schema versions of this binary.
    pub fn schema_version(&self) -> (u64, u64) {
        (stratus_db::schema::internal_schema_version(), self.schema_external)
    }

    pub fn hooks(&self) -> &Arc<dyn Hooks> {
        &self.hooks
    }

    pub fn trust(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    pub fn config(&self) -> Result<DaemonConfig> {
        self.config
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::failed_precondition("daemon is not yet initialized"))
    }

    pub fn set_config(&self, config: DaemonConfig) {
        *self.config.write().unwrap() = Some(config);
    }

    pub fn name(&self) -> Result<String> {
        self.config().map(|c| c.name)
    }

    pub fn address(&self) -> Result<String> {
        self.config().map(|c| c.address)
    }

    pub fn db(&self) -> Result<Arc<Coordinator>> {
        self.db
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::unavailable("database is not available yet"))
    }

    pub fn set_db(&self, db: Arc<Coordinator>) {
        *self.db.write().unwrap() = Some(db);
    }

    pub fn server_keypair(&self) -> Result<Arc<KeyPair>> {
        self.server_keypair
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::failed_precondition("server keypair not loaded"))
    }

    pub fn set_server_keypair(&self, keypair: KeyPair) {
        *self.server_keypair.write().unwrap() = Some(Arc::new(keypair));
    }

    pub fn cluster_keypair(&self) -> Option<Arc<KeyPair>> {
        self.cluster_keypair.read().unwrap().clone()
    }

    pub fn set_cluster_keypair(&self, keypair: KeyPair) {
        *self.cluster_keypair.write().unwrap() = Some(Arc::new(keypair));
    }

    /// DER of the cluster certificate; `None` while pre-init.
    pub fn cluster_cert_der(&self) -> Option<Vec<u8>> {
        self.cluster_keypair()
            .and_then(|kp| kp.cert_der().ok())
    }

    /// Whether the cluster certificate exists, i.e. the daemon is
    /// past bootstrap or join.
    pub fn is_initialized(&self) -> bool {
        self.cluster_keypair.read().unwrap().is_some()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn additional_certs(&self) -> HashMap<String, CertificateBundle> {
        self.additional_certs.read().unwrap().clone()
    }

    pub fn set_additional_certs(&self, certs: HashMap<String, CertificateBundle>) {
        *self.additional_certs.write().unwrap() = certs;
    }

    /// A mutual-TLS client for one trusted peer: we present the
    /// cluster keypair and pin the shared cluster certificate the
    /// peer serves.
    pub fn peer_client(&self, remote: &Remote) -> Result<PeerClient> {
        let cluster = self
            .cluster_keypair()
            .ok_or_else(|| Error::failed_precondition("cluster keypair not available"))?;
        PeerClient::new(&remote.address, &cluster, &cluster.cert_pem)
    }

    /// Clients for every other trusted peer.
    pub fn peer_clients(&self) -> Result<Vec<(Remote, PeerClient)>> {
        let name = self.name()?;
        let mut clients = Vec::new();
        for remote in self.trust.remotes(Some(&name)) {
            match self.peer_client(&remote) {
                Ok(client) => clients.push((remote, client)),
                Err(e) => warn!(peer = %remote.name, error = %e, "skipping peer client"),
            }
        }
        Ok(clients)
    }
}
