//! The endpoint manager: named listeners and their lifecycles.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use stratus_trust::auth::RequestIdentity;
use stratus_trust::certs::KeyPair;

use crate::listener::SwappableTls;
use crate::EndpointError;

/// What kind of transport an endpoint serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// Local unix control socket.
    Control,
    /// TLS network listener.
    Network,
}

enum Target {
    Unix(PathBuf),
    Tcp(String),
}

/// A declared endpoint, not yet bound.
pub struct Endpoint {
    name: String,
    kind: EndpointKind,
    router: Router,
    target: Target,
    tls: Option<SwappableTls>,
    drain_timeout: Option<Duration>,
}

impl Endpoint {
    /// The local control socket.
    pub fn control(name: &str, socket_path: PathBuf, router: Router) -> Self {
        Self {
            name: name.to_string(),
            kind: EndpointKind::Control,
            router,
            target: Target::Unix(socket_path),
            tls: None,
            drain_timeout: None,
        }
    }

    /// A TLS network listener.
    pub fn network(
        name: &str,
        address: &str,
        router: Router,
        keypair: &KeyPair,
        drain_timeout: Option<Duration>,
    ) -> Result<Self, EndpointError> {
        let tls = SwappableTls::new(keypair).map_err(|e| EndpointError::Tls(e.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            kind: EndpointKind::Network,
            router,
            target: Target::Tcp(address.to_string()),
            tls: Some(tls),
            drain_timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> EndpointKind {
        self.kind
    }
}

/// Listener lifecycle: accept until told otherwise, then either
/// detach or drain the open connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Run,
    /// Close the listener but leave connections running.
    CloseListener,
    /// Close the listener and shut connections down: gracefully when
    /// a drain timeout is configured, forced otherwise.
    Shutdown,
}

struct Running {
    tls: Option<SwappableTls>,
    local_addr: Option<SocketAddr>,
    mode: watch::Sender<Mode>,
    task: JoinHandle<()>,
}

/// Owns every listener of the daemon.
#[derive(Default)]
pub struct EndpointManager {
    pending: Mutex<Vec<Endpoint>>,
    running: Mutex<HashMap<String, Running>>,
}

impl EndpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an endpoint to be bound by the next [`up`](Self::up).
    /// Names already present are ignored.
    pub async fn register(&self, endpoint: Endpoint) {
        if self.running.lock().await.contains_key(endpoint.name()) {
            return;
        }
        let mut pending = self.pending.lock().await;
        if pending.iter().any(|e| e.name == endpoint.name) {
            return;
        }
        pending.push(endpoint);
    }

    /// Bind and serve every queued endpoint.
    pub async fn up(&self) -> Result<(), EndpointError> {
        let queued: Vec<Endpoint> = self.pending.lock().await.drain(..).collect();
        for endpoint in queued {
            self.spawn(endpoint).await?;
        }
        Ok(())
    }

    /// Bind and serve one endpoint immediately. An already-present
    /// name is ignored.
    pub async fn add(&self, endpoint: Endpoint) -> Result<(), EndpointError> {
        if self.running.lock().await.contains_key(endpoint.name()) {
            return Ok(());
        }
        self.spawn(endpoint).await
    }

    /// Close listeners. With `shutdown_servers`, connections are also
    /// shut down; an empty selection means every endpoint.
    pub async fn down(&self, shutdown_servers: bool, selected: &[&str]) {
        let names: Vec<String> = {
            let running = self.running.lock().await;
            running
                .keys()
                .filter(|name| selected.is_empty() || selected.contains(&name.as_str()))
                .cloned()
                .collect()
        };

        for name in names {
            let entry = self.running.lock().await.remove(&name);
            if let Some(entry) = entry {
                let mode = if shutdown_servers {
                    Mode::Shutdown
                } else {
                    Mode::CloseListener
                };
                let _ = entry.mode.send(mode);
                if let Err(e) = entry.task.await {
                    warn!(endpoint = %name, error = %e, "listener task failed");
                }
                info!(endpoint = %name, "endpoint down");
            }
        }
    }

    /// Swap the TLS configuration used by future accepts on a network
    /// endpoint. In-flight sessions keep their configuration.
    pub async fn update_tls_by_name(
        &self,
        name: &str,
        keypair: &KeyPair,
    ) -> Result<(), EndpointError> {
        let running = self.running.lock().await;
        let entry = running
            .get(name)
            .ok_or_else(|| EndpointError::UnknownEndpoint(name.to_string()))?;
        let tls = entry
            .tls
            .as_ref()
            .ok_or_else(|| EndpointError::Tls(format!("endpoint {name:?} does not serve TLS")))?;
        tls.swap(keypair)
            .map_err(|e| EndpointError::Tls(e.to_string()))?;
        info!(endpoint = %name, "tls configuration swapped");
        Ok(())
    }

    /// The bound address of a network endpoint.
    pub async fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        self.running.lock().await.get(name).and_then(|e| e.local_addr)
    }

    pub async fn is_up(&self, name: &str) -> bool {
        self.running.lock().await.contains_key(name)
    }

    async fn spawn(&self, endpoint: Endpoint) -> Result<(), EndpointError> {
        let (mode_tx, mode_rx) = watch::channel(Mode::Run);
        let name = endpoint.name.clone();

        let running = match endpoint.target {
            Target::Tcp(ref address) => {
                let listener = TcpListener::bind(address).await.map_err(|e| {
                    if e.kind() == std::io::ErrorKind::AddrInUse {
                        EndpointError::AddrInUse(address.clone())
                    } else {
                        EndpointError::Io(e)
                    }
                })?;
                let local_addr = listener.local_addr().ok();
                let tls = endpoint.tls.clone().expect("network endpoint carries tls");

                info!(endpoint = %name, address = %address, "network endpoint up");
                let task = tokio::spawn(run_network(
                    listener,
                    tls.clone(),
                    endpoint.router,
                    mode_rx,
                    endpoint.drain_timeout,
                ));

                Running {
                    tls: Some(tls),
                    local_addr,
                    mode: mode_tx,
                    task,
                }
            }
            Target::Unix(ref path) => {
                // A stale socket from an unclean exit blocks the bind.
                if path.exists() {
                    let _ = std::fs::remove_file(path);
                }
                let listener = UnixListener::bind(path).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::AddrInUse {
                        EndpointError::AddrInUse(path.display().to_string())
                    } else {
                        EndpointError::Io(e)
                    }
                })?;

                info!(endpoint = %name, path = %path.display(), "control endpoint up");
                let task = tokio::spawn(run_unix(
                    listener,
                    endpoint.router,
                    mode_rx,
                    endpoint.drain_timeout,
                ));

                Running {
                    tls: None,
                    local_addr: None,
                    mode: mode_tx,
                    task,
                }
            }
        };

        self.running.lock().await.insert(name, running);
        Ok(())
    }
}

async fn run_network(
    listener: TcpListener,
    tls: SwappableTls,
    router: Router,
    mut mode: watch::Receiver<Mode>,
    drain_timeout: Option<Duration>,
) {
    let mut connections: Vec<JoinHandle<()>> = Vec::new();

    let final_mode = loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        // The configuration is read per accept; a swap
                        // only affects later connections.
                        let config = tls.current();
                        let router = router.clone();
                        connections.push(tokio::spawn(async move {
                            match TlsAcceptor::from(config).accept(stream).await {
                                Ok(tls_stream) => {
                                    let peer_cert_der = tls_stream
                                        .get_ref()
                                        .1
                                        .peer_certificates()
                                        .and_then(|certs| certs.first())
                                        .map(|cert| cert.as_ref().to_vec());
                                    let identity = RequestIdentity {
                                        local: false,
                                        peer_cert_der,
                                    };
                                    serve_connection(tls_stream, router, identity).await;
                                }
                                Err(e) => debug!(%peer, error = %e, "tls handshake failed"),
                            }
                        }));
                        connections.retain(|handle| !handle.is_finished());
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
            _ = mode.changed() => {
                break *mode.borrow();
            }
        }
    };

    drop(listener);
    finish_connections(final_mode, connections, drain_timeout).await;
}

async fn run_unix(
    listener: UnixListener,
    router: Router,
    mut mode: watch::Receiver<Mode>,
    drain_timeout: Option<Duration>,
) {
    let mut connections: Vec<JoinHandle<()>> = Vec::new();

    let final_mode = loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let router = router.clone();
                        let identity = RequestIdentity {
                            local: true,
                            peer_cert_der: None,
                        };
                        connections.push(tokio::spawn(async move {
                            serve_connection(stream, router, identity).await;
                        }));
                        connections.retain(|handle| !handle.is_finished());
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
            _ = mode.changed() => {
                break *mode.borrow();
            }
        }
    };

    drop(listener);
    finish_connections(final_mode, connections, drain_timeout).await;
}

async fn finish_connections(
    mode: Mode,
    mut connections: Vec<JoinHandle<()>>,
    drain_timeout: Option<Duration>,
) {
    match mode {
        // Dropping the handles detaches the connections.
        Mode::Run | Mode::CloseListener => {}
        Mode::Shutdown => match drain_timeout {
            Some(timeout) => {
                let drain = async {
                    for handle in &mut connections {
                        let _ = handle.await;
                    }
                };
                if tokio::time::timeout(timeout, drain).await.is_err() {
                    debug!("drain timeout elapsed, aborting remaining connections");
                    for handle in &connections {
                        handle.abort();
                    }
                }
            }
            None => {
                for handle in &connections {
                    handle.abort();
                }
            }
        },
    }
}

async fn serve_connection<I>(io: I, router: Router, identity: RequestIdentity)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let app = router.layer(axum::Extension(identity));
    let service = TowerToHyperService::new(app);

    if let Err(e) = auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(io), service)
        .await
    {
        debug!(error = %e, "connection closed with error");
    }
}
