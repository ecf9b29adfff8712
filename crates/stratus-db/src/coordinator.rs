//! The database coordinator: status machine and transaction contract.

use std::future::Future;
use std::sync::RwLock;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use stratus_core::types::unix_now;
use stratus_core::{Error, Member, Result};
use stratus_engine::{ApplyOutcome, Batch, Engine, EngineError};

use crate::schema::{self, Migration};

/// Logical table names inside the replicated store.
pub(crate) const MEMBERS: &str = "members";
pub(crate) const MEMBER_ADDRS: &str = "member_addrs";
pub(crate) const TOKENS: &str = "tokens";
pub(crate) const SCHEMA: &str = "schema";
pub(crate) const META: &str = "meta";

pub(crate) const NEXT_ID_KEY: &str = "next_id";

/// Per-attempt deadline inside [`Coordinator::transaction`].
const TXN_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Retries on leader-unavailable errors, with doubling backoff.
const TXN_RETRIES: usize = 5;

/// Database status as exposed on the REST surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    NotReady,
    Starting,
    Waiting,
    Ready,
    Offline,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::NotReady => "not ready",
            Status::Starting => "starting",
            Status::Waiting => "waiting",
            Status::Ready => "ready",
            Status::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// Wraps the replication engine with bring-up, the upgrade fence, and
/// typed access to the replicated tables.
pub struct Coordinator {
    pub(crate) name: String,
    pub(crate) engine: Engine,
    status: RwLock<Status>,
    pub(crate) migrations: Vec<Migration>,
    pub(crate) api_extensions: Vec<String>,
    notify_tx: mpsc::Sender<()>,
    notify_rx: Mutex<mpsc::Receiver<()>>,
}

impl Coordinator {
    pub fn new(
        name: &str,
        engine: Engine,
        migrations: Vec<Migration>,
        api_extensions: Vec<String>,
    ) -> Self {
        // Single slot: redundant notifications are dropped by try_send.
        let (notify_tx, notify_rx) = mpsc::channel(1);

        Self {
            name: name.to_string(),
            engine,
            status: RwLock::new(Status::NotReady),
            migrations,
            api_extensions,
            notify_tx,
            notify_rx: Mutex::new(notify_rx),
        }
    }

    pub fn status(&self) -> Status {
        *self.status.read().unwrap()
    }

    pub(crate) fn set_status(&self, status: Status) {
        let mut current = self.status.write().unwrap();
        if *current != status {
            info!(from = %current, to = %status, "database status changed");
            *current = status;
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The schema versions this binary is compiled with.
    pub fn schema_version(&self) -> (u64, u64) {
        (
            schema::internal_migrations().len() as u64,
            self.migrations.len() as u64,
        )
    }

    pub fn api_extensions(&self) -> &[String] {
        &self.api_extensions
    }

    /// Non-blocking wake-up for a fence waiting on peers; duplicate
    /// notifications are dropped.
    pub fn notify_upgraded(&self) {
        let _ = self.notify_tx.try_send(());
    }

    pub(crate) async fn wait_for_upgrade_notification(&self) {
        let mut rx = self.notify_rx.lock().await;
        tokio::select! {
            _ = rx.recv() => {}
            _ = tokio::time::sleep(schema::FENCE_RECHECK_INTERVAL) => {}
        }
    }

    /// Bring up a brand new single-member cluster.
    ///
    /// The upgrade fence is skipped: the schema row is installed at
    /// version-max and the self member row is created at PENDING.
    pub async fn bootstrap(&self, name: &str, address: &str, certificate: &str) -> Result<Member> {
        if self.status() != Status::NotReady {
            return Err(Error::failed_precondition(format!(
                "unable to initialize database: {}",
                self.status()
            )));
        }
        self.set_status(Status::Starting);

        let result = self.bootstrap_inner(name, address, certificate).await;
        match result {
            Ok(member) => {
                self.set_status(Status::Ready);
                Ok(member)
            }
            Err(e) => {
                self.set_status(Status::Offline);
                Err(e)
            }
        }
    }

    async fn bootstrap_inner(
        &self,
        name: &str,
        address: &str,
        certificate: &str,
    ) -> Result<Member> {
        self.engine.bootstrap().await.map_err(map_engine_err)?;
        self.engine
            .ready(Duration::from_secs(30))
            .await
            .map_err(map_engine_err)?;

        let (internal, external) = self.schema_version();
        let member = Member {
            id: 1,
            name: name.to_string(),
            address: address.to_string(),
            certificate: certificate.to_string(),
            schema_internal: internal,
            schema_external: external,
            api_extensions: self.api_extensions.clone(),
            heartbeat: unix_now(),
            role: stratus_core::Role::Pending,
        };

        let schema_row = stratus_core::SchemaRow { internal, external };
        let batch = Batch::new()
            .put(SCHEMA, "row", serde_json::to_string(&schema_row)?)
            .put(META, NEXT_ID_KEY, "2".to_string())
            .put(MEMBERS, name, serde_json::to_string(&member)?)
            .put(MEMBER_ADDRS, address, name.to_string());

        let outcome = self.propose(batch).await?;
        if !outcome.applied {
            return Err(Error::internal("bootstrap write was rejected"));
        }

        info!(%name, %address, "database bootstrapped");
        Ok(member)
    }

    /// Bring up the database as a joining or restarting member: wait
    /// for the engine, then run the upgrade fence.
    pub async fn open(&self) -> Result<()> {
        if self.status() != Status::NotReady {
            return Err(Error::failed_precondition(format!(
                "unable to open database: {}",
                self.status()
            )));
        }
        self.set_status(Status::Starting);

        let result = async {
            self.engine
                .ready(Duration::from_secs(60))
                .await
                .map_err(map_engine_err)?;
            self.wait_upgrade().await
        }
        .await;

        match result {
            Ok(()) => {
                self.set_status(Status::Ready);
                Ok(())
            }
            Err(e) => {
                self.set_status(Status::Offline);
                Err(e)
            }
        }
    }

    /// Run `op` with the transaction contract: accepted only while the
    /// database is Ready or Waiting, retried with bounded exponential
    /// backoff while the leader is unavailable, and granted exactly
    /// one extra retry after a deadline expiry to ride through a
    /// leader election.
    pub async fn transaction<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let status = self.status();
        if status != Status::Ready && status != Status::Waiting {
            return Err(Error::unavailable(format!(
                "database is not ready yet: {status}"
            )));
        }

        let mut deadline_retry = true;
        let mut delay = Duration::from_millis(100);
        let mut attempts = 0;

        loop {
            match tokio::time::timeout(TXN_ATTEMPT_TIMEOUT, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e))
                    if e.kind() == stratus_core::ErrorKind::Unavailable
                        && attempts < TXN_RETRIES =>
                {
                    attempts += 1;
                    warn!(error = %e, attempt = attempts, "transaction retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(2));
                }
                Ok(Err(e)) => return Err(e),
                Err(_) if deadline_retry => {
                    // A timeout usually means the leader went away
                    // mid-request; by now an election has had time to
                    // settle, so try once more.
                    warn!("transaction timed out, retrying once");
                    deadline_retry = false;
                }
                Err(_) => return Err(Error::unavailable("transaction timed out")),
            }
        }
    }

    /// Shut the engine down. Later transactions fail Unavailable.
    pub async fn stop(&self) {
        self.engine.shutdown().await;
        self.set_status(Status::Offline);
    }

    pub(crate) async fn propose(&self, batch: Batch) -> Result<ApplyOutcome> {
        self.engine.propose(batch).await.map_err(map_engine_err)
    }
}

pub(crate) fn map_engine_err(err: EngineError) -> Error {
    match err {
        EngineError::Unavailable(message) => Error::unavailable(message),
        EngineError::Storage(message) | EngineError::Raft(message) => Error::internal(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::single_node;

    #[tokio::test]
    async fn bootstrap_sets_ready_and_seeds_tables() {
        let db = single_node("c1.example.com", "127.0.0.1:9001").await;
        assert_eq!(db.status(), Status::Ready);

        let members = db.members().unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "c1.example.com");
        assert_eq!(members[0].id, 1);
        assert_eq!(members[0].role, stratus_core::Role::Pending);

        let (internal, external) = db.schema_version();
        let row = db.schema_row().unwrap();
        assert_eq!(row.internal, internal);
        assert_eq!(row.external, external);
    }

    #[tokio::test]
    async fn bootstrap_twice_is_refused() {
        let db = single_node("c1.example.com", "127.0.0.1:9001").await;
        let err = db
            .bootstrap("c1.example.com", "127.0.0.1:9001", "cert")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), stratus_core::ErrorKind::FailedPrecondition);
    }

    #[tokio::test]
    async fn transaction_refused_before_open() {
        let db = crate::test_support::unopened("c1.example.com", "127.0.0.1:9001").await;
        let err = db
            .transaction(|| async { Ok(()) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), stratus_core::ErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn transaction_passes_through_other_errors_without_retry() {
        let db = single_node("c1.example.com", "127.0.0.1:9001").await;
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let err = db
            .transaction(|| {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async { Err::<(), _>(Error::conflict("duplicate")) }
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), stratus_core::ErrorKind::Conflict);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn notify_upgraded_drops_duplicates() {
        let db = single_node("c1.example.com", "127.0.0.1:9001").await;
        // Fill the single slot, then some redundant sends.
        db.notify_upgraded();
        db.notify_upgraded();
        db.notify_upgraded();
        // One slot is consumed without waiting for the tick.
        tokio::time::timeout(Duration::from_secs(1), db.wait_for_upgrade_notification())
            .await
            .expect("first notification should be buffered");
    }
}
