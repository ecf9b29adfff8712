//! Daemon composition and the ordered start/stop sequences.
//!
//! Construction is leaf to root: trust store and endpoint manager
//! first, then the shared cluster state with capability handles
//! (start-api driver, reset, replication-stream hand-off) pointing
//! back into the daemon through weak references, so no component
//! holds a strong back-pointer to its parent.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use axum::Router;
use tokio::sync::watch;
use tracing::{error, info, warn};

use stratus_api::build_routers;
use stratus_client::dial_database;
use stratus_cluster::{Callbacks, ClusterState, HeartbeatLoop, StartApiArgs};
use stratus_core::messages::{CertificateBundle, Token};
use stratus_core::{DaemonConfig, Error, MemberLocation, Result};
use stratus_db::{Coordinator, Migration};
use stratus_endpoints::{Endpoint, EndpointManager};
use stratus_engine::{Dialer, Engine, RawStream, StreamServer};
use stratus_trust::certs::{cert_matches_name, generate_cluster_keypair, generate_server_keypair, KeyPair};
use stratus_trust::{Remote, TrustStore};

use crate::app::App;

const CORE_ENDPOINT: &str = "core";
const CONTROL_ENDPOINT: &str = "control";

/// Outbound replication dialer: opens the HTTPS upgrade against a
/// peer's database endpoint under the cluster identity.
struct PeerDialer {
    state: Weak<ClusterState>,
}

#[async_trait::async_trait]
impl Dialer for PeerDialer {
    async fn dial(&self, addr: &str) -> std::io::Result<Box<dyn RawStream>> {
        let state = self
            .state
            .upgrade()
            .ok_or_else(|| std::io::Error::other("daemon is shutting down"))?;
        let identity = state
            .cluster_keypair()
            .ok_or_else(|| std::io::Error::other("no cluster identity yet"))?;

        let stream = dial_database(addr, &identity, &identity.cert_pem)
            .await
            .map_err(std::io::Error::other)?;
        Ok(Box::new(stream))
    }
}

/// The composed daemon.
pub struct Daemon {
    state_dir: PathBuf,
    extensions: Vec<String>,
    migrations: Vec<Migration>,
    heartbeat_interval: Duration,
    drain_timeout: Option<Duration>,
    extra_servers: Vec<(String, String, Router)>,
    extra_resources: Vec<(String, Router)>,

    state: Arc<ClusterState>,
    endpoints: Arc<EndpointManager>,
    stream_server: RwLock<Option<StreamServer>>,
    network_router: RwLock<Option<Router>>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    ready_tx: watch::Sender<bool>,
    heartbeat_started: AtomicBool,
    reset_requested: AtomicBool,
    restart_failed: AtomicBool,
}

impl Daemon {
    /// Compose a daemon from an application description.
    pub fn new(app: App) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&app.state_dir)
            .map_err(|e| Error::internal(format!("create state dir: {e}")))?;
        let trust = Arc::new(TrustStore::open(&app.state_dir.join("truststore"))?);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = watch::channel(false);

        let daemon = Arc::new_cyclic(|weak: &Weak<Daemon>| {
            let callbacks = Callbacks {
                start_api: {
                    let weak = weak.clone();
                    Arc::new(move |args| {
                        let weak = weak.clone();
                        Box::pin(async move {
                            let daemon = weak
                                .upgrade()
                                .ok_or_else(|| Error::internal("daemon is shutting down"))?;
                            daemon.start_api(args).await
                        })
                    })
                },
                reset: {
                    let weak = weak.clone();
                    Arc::new(move |force| {
                        let weak = weak.clone();
                        Box::pin(async move {
                            let daemon = weak
                                .upgrade()
                                .ok_or_else(|| Error::internal("daemon is shutting down"))?;
                            daemon.reset(force).await
                        })
                    })
                },
                attach_stream: {
                    let weak = weak.clone();
                    Arc::new(move |stream| {
                        let daemon = weak
                            .upgrade()
                            .ok_or_else(|| Error::internal("daemon is shutting down"))?;
                        daemon.attach_stream(stream)
                    })
                },
            };

            let state = Arc::new(ClusterState::new(
                &app.state_dir,
                app.migrations.len() as u64,
                app.extensions.clone(),
                Arc::clone(&app.hooks),
                trust,
                ready_rx,
                callbacks,
            ));

            Daemon {
                state_dir: app.state_dir.clone(),
                extensions: app.extensions,
                migrations: app.migrations,
                heartbeat_interval: app.heartbeat_interval,
                drain_timeout: app.drain_timeout,
                extra_servers: app.servers,
                extra_resources: app.resources,
                state,
                endpoints: Arc::new(EndpointManager::new()),
                stream_server: RwLock::new(None),
                network_router: RwLock::new(None),
                shutdown_tx,
                shutdown_rx,
                ready_tx,
                heartbeat_started: AtomicBool::new(false),
                reset_requested: AtomicBool::new(false),
                restart_failed: AtomicBool::new(false),
            }
        });

        Ok(daemon)
    }

    pub fn state(&self) -> &Arc<ClusterState> {
        &self.state
    }

    pub fn endpoints(&self) -> &Arc<EndpointManager> {
        &self.endpoints
    }

    /// Serve until [`Daemon::trigger_shutdown`] fires, then tear down
    /// in order: heartbeat, database, listeners.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let routers = build_routers(Arc::clone(&self.state), self.extra_resources.clone());
        *self.network_router.write().unwrap() = Some(routers.network);

        self.endpoints
            .register(Endpoint::control(
                CONTROL_ENDPOINT,
                self.state_dir.join("control.socket"),
                routers.control,
            ))
            .await;
        self.endpoints.up().await.map_err(Error::from)?;

        // The server keypair doubles as the pre-init serving identity
        // and the member's client identity.
        let server_keypair = if KeyPair::exists(&self.state_dir, "server") {
            KeyPair::load(&self.state_dir, "server")?
        } else {
            generate_server_keypair("stratus", &[])?.save(&self.state_dir, "server")?
        };
        self.state.set_server_keypair(server_keypair);

        // A state directory with a cluster certificate belongs to an
        // initialized member; bring it back up without waiting for a
        // control request.
        if DaemonConfig::exists(&self.state_dir) && KeyPair::exists(&self.state_dir, "cluster") {
            let daemon = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = daemon.start_existing().await {
                    error!(error = %e, "failed to restart initialized member");
                    daemon.restart_failed.store(true, Ordering::SeqCst);
                    daemon.trigger_shutdown();
                }
            });
        }

        info!(state_dir = %self.state_dir.display(), "daemon up");

        let mut shutdown = self.shutdown_rx.clone();
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        // Teardown: heartbeat tasks watch the same token and stop on
        // their own; the engine quiesces before listeners drain.
        if let Ok(db) = self.state.db() {
            db.stop().await;
        }
        self.endpoints.down(true, &[]).await;

        if self.reset_requested.load(Ordering::SeqCst) {
            self.wipe_state_dir();
            info!("state directory cleared, exiting for supervisor restart");
        }

        if self.restart_failed.load(Ordering::SeqCst) {
            return Err(Error::internal("initialization failed, see log"));
        }

        info!("daemon stopped");
        Ok(())
    }

    /// First caller wins; the run loop performs the actual teardown.
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// The API-start driver behind `POST /core/control`.
    async fn start_api(self: &Arc<Self>, args: StartApiArgs) -> Result<()> {
        let hooks = self.state.hooks().clone();
        hooks.pre_init(args.bootstrap, &args.init_config).await.map_err(|e| {
            Error::new(e.kind(), format!("pre-init hook failed: {e}"))
        })?;

        let mut config = self.state.config()?;
        for (name, addr, _) in &self.extra_servers {
            config.servers.insert(
                name.clone(),
                stratus_core::config::ServerConfig {
                    address: addr.clone(),
                },
            );
        }
        self.state.set_config(config.clone());
        config.save(&self.state_dir)?;

        // Regenerate the server keypair when its SANs do not cover
        // the requested member name, and swap it into any listener
        // already serving it.
        let server_keypair = self.state.server_keypair()?;
        if !cert_matches_name(&server_keypair.cert_pem, &config.name)? {
            KeyPair::delete(&self.state_dir, "server");
            let regenerated =
                generate_server_keypair(&config.name, &[config.address.clone()])?
                    .save(&self.state_dir, "server")?;
            self.state.set_server_keypair(regenerated);
            info!(name = %config.name, "server keypair regenerated for new member name");
        }

        if args.bootstrap {
            self.bootstrap(&config, &args).await
        } else {
            self.join(&config, &args).await
        }
    }

    async fn bootstrap(self: &Arc<Self>, config: &DaemonConfig, args: &StartApiArgs) -> Result<()> {
        let result = self.bootstrap_inner(config, args).await;
        if let Err(e) = &result {
            error!(error = %e, "bootstrap failed, clearing state");
            if let Err(reset_err) = self.reset(true).await {
                warn!(error = %reset_err, "bootstrap unwind incomplete");
            }
        }
        result
    }

    async fn bootstrap_inner(
        self: &Arc<Self>,
        config: &DaemonConfig,
        args: &StartApiArgs,
    ) -> Result<()> {
        let server_keypair = self.state.server_keypair()?;

        // Trust ourselves before anything can connect.
        self.state.trust().add(&[Remote {
            name: config.name.clone(),
            address: config.address.clone(),
            certificate: server_keypair.cert_pem.clone(),
        }])?;

        // The core listener comes up pre-init under the server
        // certificate and is swapped to the cluster certificate once
        // that exists.
        self.add_core_endpoint(&config.address, &server_keypair).await?;

        let db = self.start_database(config).await?;
        db.bootstrap(&config.name, &config.address, &server_keypair.cert_pem)
            .await?;

        let cluster_keypair = if KeyPair::exists(&self.state_dir, "cluster") {
            KeyPair::load(&self.state_dir, "cluster")?
        } else {
            generate_cluster_keypair()?.save(&self.state_dir, "cluster")?
        };
        self.state.set_cluster_keypair(cluster_keypair.clone());
        self.endpoints
            .update_tls_by_name(CORE_ENDPOINT, &cluster_keypair)
            .await
            .map_err(Error::from)?;

        self.start_extension_servers(config).await?;
        self.start_heartbeat();

        self.state
            .hooks()
            .post_bootstrap(&args.init_config)
            .await
            .map_err(|e| Error::new(e.kind(), format!("post-bootstrap hook failed: {e}")))?;

        self.mark_ready().await;
        info!(name = %config.name, address = %config.address, "cluster bootstrapped");
        Ok(())
    }

    async fn join(self: &Arc<Self>, config: &DaemonConfig, args: &StartApiArgs) -> Result<()> {
        let encoded = args
            .join_token
            .as_deref()
            .ok_or_else(|| Error::invalid_argument("join requires a token"))?;
        let token = Token::decode(encoded)?;
        if token.name != config.name {
            return Err(Error::invalid_argument(format!(
                "token was issued for {:?}, not {:?}",
                token.name, config.name
            )));
        }

        self.state
            .hooks()
            .pre_join(&args.init_config)
            .await
            .map_err(|e| Error::new(e.kind(), format!("pre-join hook failed: {e}")))?;

        // The candidate loop writes no local state; its failure needs
        // no unwind.
        let response = self
            .state
            .request_admission(&token, &config.name, &config.address)
            .await?;

        let authorizer = response.trusted_member.clone();
        let result = self.join_inner(config, &response).await;
        if let Err(e) = &result {
            error!(error = %e, "join failed after admission, unwinding");
            self.unwind_join(config, &authorizer).await;
        }
        result?;

        if let Err(e) = self.state.hooks().post_join().await {
            warn!(error = %e, "post-join hook failed");
        }
        self.mark_ready().await;
        info!(name = %config.name, address = %config.address, "joined cluster");
        Ok(())
    }

    async fn join_inner(
        self: &Arc<Self>,
        config: &DaemonConfig,
        response: &stratus_core::messages::JoinResponse,
    ) -> Result<()> {
        let server_keypair = self.state.server_keypair()?;

        // Install the cluster identity and any additional listener
        // certificates handed over by the admitting peer.
        let cluster_keypair = KeyPair {
            cert_pem: response.cluster_cert.clone(),
            key_pem: response.cluster_key.clone(),
        }
        .save(&self.state_dir, "cluster")?;
        self.state.set_cluster_keypair(cluster_keypair.clone());

        let certs_dir = self.state_dir.join("certificates");
        for (name, bundle) in &response.cluster_additional_certs {
            KeyPair {
                cert_pem: bundle.cert.clone(),
                key_pem: bundle.key.clone(),
            }
            .save(&certs_dir, name)?;
        }
        self.state
            .set_additional_certs(response.cluster_additional_certs.clone());

        // Seed the trust store with the returned members plus self.
        let mut remotes: Vec<Remote> = response
            .cluster_members
            .iter()
            .filter(|m| m.name != config.name)
            .map(|m| Remote {
                name: m.name.clone(),
                address: m.address.clone(),
                certificate: m.certificate.clone(),
            })
            .collect();
        remotes.push(Remote {
            name: config.name.clone(),
            address: config.address.clone(),
            certificate: server_keypair.cert_pem.clone(),
        });
        self.state.trust().add(&remotes)?;

        // Network listener directly under the cluster certificate,
        // then the engine; the fence runs inside open().
        self.add_core_endpoint(&config.address, &cluster_keypair).await?;
        let db = self.start_database(config).await?;
        db.open().await?;

        self.start_extension_servers(config).await?;

        self.state
            .finalize_join(&MemberLocation {
                name: config.name.clone(),
                address: config.address.clone(),
            })
            .await?;

        self.start_heartbeat();
        Ok(())
    }

    /// Join unwind: best effort, failures are logged and never raised.
    async fn unwind_join(self: &Arc<Self>, config: &DaemonConfig, authorizer: &MemberLocation) {
        if let Err(e) = self.state.hooks().pre_remove(true).await {
            warn!(error = %e, "pre-remove hook failed during unwind");
        }

        // Ask the cluster to forget us; the admitting peer is the one
        // member guaranteed to know about us.
        match self.state.trust().by_address(&authorizer.address) {
            Some(remote) => match self.state.peer_client(&remote) {
                Ok(client) => {
                    if let Err(e) = client.remove_cluster_member(&config.name, true).await {
                        warn!(error = %e, "could not remove ourselves from the cluster");
                    }
                }
                Err(e) => warn!(error = %e, "no client to the admitting peer"),
            },
            None => warn!(peer = %authorizer.address, "admitting peer not in trust store"),
        }

        if let Err(e) = self.reset(true).await {
            warn!(error = %e, "reset during join unwind failed");
        }
    }

    /// Restart path for an already-initialized state directory.
    async fn start_existing(self: &Arc<Self>) -> Result<()> {
        let config = DaemonConfig::load(&self.state_dir)?;
        config.validate()?;
        self.state.set_config(config.clone());

        let cluster_keypair = KeyPair::load(&self.state_dir, "cluster")?;
        self.state.set_cluster_keypair(cluster_keypair.clone());

        let certs_dir = self.state_dir.join("certificates");
        let mut bundles = HashMap::new();
        for name in config.servers.keys() {
            if KeyPair::exists(&certs_dir, name) {
                let pair = KeyPair::load(&certs_dir, name)?;
                bundles.insert(
                    name.clone(),
                    CertificateBundle {
                        cert: pair.cert_pem,
                        key: pair.key_pem,
                        ca: None,
                    },
                );
            }
        }
        self.state.set_additional_certs(bundles);

        self.add_core_endpoint(&config.address, &cluster_keypair).await?;

        // The engine restores its vote and membership from disk; the
        // fence decides whether we are Ready or Waiting.
        let db = self.start_database(&config).await?;
        db.open().await?;

        self.start_extension_servers(&config).await?;
        self.start_heartbeat();
        self.mark_ready().await;

        info!(name = %config.name, "initialized member restarted");
        Ok(())
    }

    async fn add_core_endpoint(&self, address: &str, keypair: &KeyPair) -> Result<()> {
        let router = self
            .network_router
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::internal("network router not built"))?;
        self.endpoints
            .add(Endpoint::network(
                CORE_ENDPOINT,
                address,
                router,
                keypair,
                self.drain_timeout,
            )?)
            .await
            .map_err(Error::from)
    }

    async fn start_database(self: &Arc<Self>, config: &DaemonConfig) -> Result<Arc<Coordinator>> {
        let dialer = Arc::new(PeerDialer {
            state: Arc::downgrade(&self.state),
        });
        let (engine, server) = Engine::open(
            &self.state_dir.join("database"),
            &config.name,
            &config.address,
            dialer,
        )
        .await
        .map_err(|e| Error::internal(format!("engine start: {e}")))?;

        *self.stream_server.write().unwrap() = Some(server);

        let db = Arc::new(Coordinator::new(
            &config.name,
            engine,
            self.migrations.clone(),
            self.extensions.clone(),
        ));
        self.state.set_db(Arc::clone(&db));
        Ok(db)
    }

    /// Dedicated keypairs and listeners for the application's
    /// additional servers.
    async fn start_extension_servers(&self, config: &DaemonConfig) -> Result<()> {
        if self.extra_servers.is_empty() {
            return Ok(());
        }

        let certs_dir = self.state_dir.join("certificates");
        let mut bundles = self.state.additional_certs();

        for (name, address, router) in &self.extra_servers {
            let keypair = if KeyPair::exists(&certs_dir, name) {
                KeyPair::load(&certs_dir, name)?
            } else if let Some(bundle) = bundles.get(name) {
                KeyPair {
                    cert_pem: bundle.cert.clone(),
                    key_pem: bundle.key.clone(),
                }
                .save(&certs_dir, name)?
            } else {
                generate_server_keypair(&config.name, &[address.clone()])?
                    .save(&certs_dir, name)?
            };

            bundles.insert(
                name.clone(),
                CertificateBundle {
                    cert: keypair.cert_pem.clone(),
                    key: keypair.key_pem.clone(),
                    ca: None,
                },
            );

            self.endpoints
                .add(Endpoint::network(
                    name,
                    address,
                    router.clone(),
                    &keypair,
                    self.drain_timeout,
                )?)
                .await
                .map_err(Error::from)?;
        }

        self.state.set_additional_certs(bundles);
        Ok(())
    }

    fn start_heartbeat(self: &Arc<Self>) {
        if self.heartbeat_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let heartbeat = HeartbeatLoop::new(Arc::clone(&self.state), self.heartbeat_interval);
        let shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            heartbeat.run(shutdown).await;
        });
    }

    async fn mark_ready(&self) {
        let _ = self.ready_tx.send(true);
        if let Err(e) = self.state.hooks().on_start().await {
            warn!(error = %e, "on-start hook failed");
        }
    }

    /// Wipe local state and stop, leaving a pre-init directory for
    /// the supervisor to restart into.
    async fn reset(&self, force: bool) -> Result<()> {
        info!(force, "cluster member reset requested");
        self.reset_requested.store(true, Ordering::SeqCst);
        self.trigger_shutdown();
        Ok(())
    }

    fn attach_stream(&self, stream: Box<dyn RawStream>) -> Result<()> {
        let server = self
            .stream_server
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::unavailable("replication engine is not running"))?;
        tokio::spawn(async move {
            server.serve(stream).await;
        });
        Ok(())
    }

    /// Delete everything under the state directory, including the
    /// engine's data. Runs after the listeners closed.
    fn wipe_state_dir(&self) {
        let entries = match std::fs::read_dir(&self.state_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "state directory not readable during wipe");
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let removed = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            if let Err(e) = removed {
                warn!(path = %path.display(), error = %e, "could not remove during wipe");
            }
        }
    }
}
