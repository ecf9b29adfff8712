//! Single-node cluster state fixtures for unit tests.

use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use redb::backends::InMemoryBackend;
use redb::Database;
use tokio::sync::watch;

use stratus_core::{DaemonConfig, NoHooks};
use stratus_db::Coordinator;
use stratus_engine::{Dialer, Engine, RawStream};
use stratus_trust::certs::{generate_cluster_keypair, generate_server_keypair};
use stratus_trust::{Remote, TrustStore};

use crate::state::{Callbacks, ClusterState};

struct NoDialer;

#[async_trait]
impl Dialer for NoDialer {
    async fn dial(&self, _addr: &str) -> std::io::Result<Box<dyn RawStream>> {
        Err(std::io::Error::other("no transport in tests"))
    }
}

pub(crate) struct TestState {
    _dir: tempfile::TempDir,
    _ready_tx: watch::Sender<bool>,
    state: Arc<ClusterState>,
}

impl Deref for TestState {
    type Target = ClusterState;

    fn deref(&self) -> &ClusterState {
        &self.state
    }
}

impl TestState {
    pub fn shared(&self) -> Arc<ClusterState> {
        Arc::clone(&self.state)
    }
}

/// A fully initialized single-member cluster over an in-memory
/// engine: bootstrapped database, certificates, trust entry for self.
pub(crate) async fn bootstrapped_state(name: &str, addr: &str) -> TestState {
    let dir = tempfile::tempdir().unwrap();
    let trust = Arc::new(TrustStore::open(&dir.path().join("truststore")).unwrap());

    let server_keypair = generate_server_keypair(name, &[addr.to_string()]).unwrap();
    let cluster_keypair = generate_cluster_keypair().unwrap();

    let backing = Arc::new(
        Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .unwrap(),
    );
    let (engine, _server) = Engine::open_with_db(backing, name, addr, Arc::new(NoDialer))
        .await
        .unwrap();
    let db = Coordinator::new(name, engine, Vec::new(), Vec::new());
    db.bootstrap(name, addr, &server_keypair.cert_pem)
        .await
        .unwrap();

    let (ready_tx, ready_rx) = watch::channel(true);
    let state = ClusterState::new(
        dir.path(),
        0,
        Vec::new(),
        Arc::new(NoHooks),
        Arc::clone(&trust),
        ready_rx,
        Callbacks::unwired(),
    );
    state.set_config(DaemonConfig {
        name: name.to_string(),
        address: addr.to_string(),
        servers: Default::default(),
    });
    trust
        .add(&[Remote {
            name: name.to_string(),
            address: addr.to_string(),
            certificate: server_keypair.cert_pem.clone(),
        }])
        .unwrap();
    state.set_server_keypair(server_keypair);
    state.set_cluster_keypair(cluster_keypair);
    state.set_db(Arc::new(db));

    TestState {
        _dir: dir,
        _ready_tx: ready_tx,
        state: Arc::new(state),
    }
}
