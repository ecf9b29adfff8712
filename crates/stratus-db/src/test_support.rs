//! In-process single-node coordinators for unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use redb::backends::InMemoryBackend;
use redb::Database;
use stratus_engine::{Dialer, Engine, RawStream};

use crate::coordinator::Coordinator;

struct NoDialer;

#[async_trait]
impl Dialer for NoDialer {
    async fn dial(&self, _addr: &str) -> std::io::Result<Box<dyn RawStream>> {
        Err(std::io::Error::other("no transport in tests"))
    }
}

/// A coordinator over an in-memory engine, not yet bootstrapped.
pub(crate) async fn unopened(name: &str, addr: &str) -> Coordinator {
    let db = Arc::new(
        Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .unwrap(),
    );
    let (engine, _server) = Engine::open_with_db(db, name, addr, Arc::new(NoDialer))
        .await
        .unwrap();
    Coordinator::new(name, engine, Vec::new(), Vec::new())
}

/// A bootstrapped single-member coordinator.
pub(crate) async fn single_node(name: &str, addr: &str) -> Coordinator {
    let db = unopened(name, addr).await;
    db.bootstrap(name, addr, "test-certificate").await.unwrap();
    db
}
