//! JSON-over-HTTPS client for one cluster peer.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use stratus_core::error::ErrorBody;
use stratus_core::messages::{
    HookKind, HookNewMemberRequest, HookRemoveRequest, JoinRequest, JoinResponse, TrustEntry,
    DATABASE_PROTOCOL_VERSION, DATABASE_VERSION_HEADER,
};
use stratus_core::types::MemberInfo;
use stratus_core::{Error, MemberLocation, Result};
use stratus_trust::certs::KeyPair;
use stratus_trust::tls::client_config;

/// Default deadline for one peer request when the caller brings none.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A mutual-TLS client for a single peer address.
#[derive(Clone)]
pub struct PeerClient {
    addr: String,
    tls: Arc<rustls::ClientConfig>,
    timeout: Duration,
}

impl PeerClient {
    /// Build a client presenting `identity` and accepting exactly
    /// `peer_cert_pem` from the other side.
    pub fn new(addr: &str, identity: &KeyPair, peer_cert_pem: &str) -> Result<Self> {
        let tls = client_config(identity, peer_cert_pem)?;
        Ok(Self {
            addr: addr.to_string(),
            tls: Arc::new(tls),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// As [`PeerClient::new`], pinning a certificate already in DER
    /// form (the join flow fetches the peer's leaf directly).
    pub fn pinned_der(addr: &str, identity: &KeyPair, peer_cert_der: Vec<u8>) -> Result<Self> {
        let tls = stratus_trust::tls::client_config_der(identity, peer_cert_der)?;
        Ok(Self {
            addr: addr.to_string(),
            tls: Arc::new(tls),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// One JSON request/response exchange under this client's deadline.
    pub async fn request<B, R>(&self, method: Method, path: &str, body: Option<&B>) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload = match body {
            Some(body) => Bytes::from(serde_json::to_vec(body)?),
            None => Bytes::new(),
        };

        let (status, raw) = tokio::time::timeout(
            self.timeout,
            self.exchange(method.clone(), path, payload, &[]),
        )
        .await
        .map_err(|_| Error::unavailable(format!("request to {} timed out", self.addr)))??;

        if status.is_success() {
            return serde_json::from_slice(&raw)
                .map_err(|e| Error::internal(format!("decode response from {}: {e}", self.addr)));
        }

        // Surface the remote error kind and message verbatim.
        if let Ok(body) = serde_json::from_slice::<ErrorBody>(&raw) {
            return Err(Error::from_body(&body));
        }
        Err(Error::new(
            stratus_core::ErrorKind::from_http_status(status.as_u16()),
            format!(
                "peer {} returned {}: {}",
                self.addr,
                status,
                String::from_utf8_lossy(&raw)
            ),
        ))
    }

    async fn exchange(
        &self,
        method: Method,
        path: &str,
        payload: Bytes,
        extra_headers: &[(&str, String)],
    ) -> Result<(StatusCode, Bytes)> {
        let tcp = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| Error::unavailable(format!("connect {}: {e}", self.addr)))?;

        let host = self.addr.rsplit_once(':').map_or(self.addr.as_str(), |(h, _)| h);
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| Error::invalid_argument(format!("invalid host {host:?}: {e}")))?;
        let tls = TlsConnector::from(Arc::clone(&self.tls))
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::unavailable(format!("tls handshake with {}: {e}", self.addr)))?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
            .await
            .map_err(|e| Error::unavailable(format!("http handshake with {}: {e}", self.addr)))?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut request = Request::builder()
            .method(method)
            .uri(path)
            .header(http::header::HOST, &self.addr)
            .header(http::header::CONTENT_TYPE, "application/json");
        for (name, value) in extra_headers {
            request = request.header(*name, value.as_str());
        }
        let request = request
            .body(Full::new(payload))
            .map_err(|e| Error::internal(e.to_string()))?;

        debug!(addr = %self.addr, "sending peer request");
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| Error::unavailable(format!("request to {}: {e}", self.addr)))?;

        let status = response.status();
        let raw = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::unavailable(format!("read response from {}: {e}", self.addr)))?
            .to_bytes();

        Ok((status, raw))
    }

    // ── Typed endpoints ────────────────────────────────────────────

    /// Liveness probe; succeeds once the peer's ready channel closed.
    pub async fn ready(&self) -> Result<()> {
        self.request::<(), serde_json::Value>(Method::GET, "/core/1.0/ready", None)
            .await
            .map(|_| ())
    }

    /// Ask the peer to admit us into the cluster.
    pub async fn add_cluster_member(&self, request: &JoinRequest) -> Result<JoinResponse> {
        self.request(Method::POST, "/core/internal/cluster", Some(request))
            .await
    }

    /// Current member list with derived state.
    pub async fn list_cluster(&self) -> Result<Vec<MemberInfo>> {
        self.request::<(), Vec<MemberInfo>>(Method::GET, "/core/1.0/cluster", None)
            .await
    }

    /// Remove a member from the cluster through this peer.
    pub async fn remove_cluster_member(&self, name: &str, force: bool) -> Result<()> {
        let path = format!("/core/1.0/cluster/{name}?force={}", force as u8);
        self.request::<(), serde_json::Value>(Method::DELETE, &path, None)
            .await
            .map(|_| ())
    }

    /// Instruct the target member to wipe its state and restart.
    pub async fn reset_member(&self, name: &str, force: bool) -> Result<()> {
        let path = format!("/core/internal/cluster/{name}?force={}", force as u8);
        self.request::<(), serde_json::Value>(Method::PUT, &path, None)
            .await
            .map(|_| ())
    }

    /// Idempotently install a trust entry on the peer.
    pub async fn add_trust(&self, entry: &TrustEntry) -> Result<()> {
        self.request::<_, serde_json::Value>(Method::POST, "/core/internal/truststore", Some(entry))
            .await
            .map(|_| ())
    }

    /// Drop a trust entry on the peer.
    pub async fn remove_trust(&self, name: &str) -> Result<()> {
        let path = format!("/core/internal/truststore/{name}");
        self.request::<(), serde_json::Value>(Method::DELETE, &path, None)
            .await
            .map(|_| ())
    }

    /// Run a remove-family lifecycle hook on the peer.
    pub async fn run_remove_hook(&self, kind: HookKind, force: bool) -> Result<()> {
        let path = match kind {
            HookKind::PreRemove => "/core/internal/hooks/pre-remove",
            HookKind::PostRemove => "/core/internal/hooks/post-remove",
            other => {
                return Err(Error::invalid_argument(format!(
                    "hook {other:?} is not a remove hook"
                )))
            }
        };
        self.request::<_, serde_json::Value>(Method::POST, path, Some(&HookRemoveRequest { force }))
            .await
            .map(|_| ())
    }

    /// Announce a newly admitted member to the peer.
    pub async fn run_new_member_hook(&self, member: &MemberLocation) -> Result<()> {
        self.request::<_, serde_json::Value>(
            Method::POST,
            "/core/internal/hooks/on-new-member",
            Some(&HookNewMemberRequest {
                new_member: member.clone(),
            }),
        )
        .await
        .map(|_| ())
    }

    /// Wake the peer's upgrade fence, if it is waiting on one.
    pub async fn notify_upgraded(&self) -> Result<()> {
        let (status, raw) = tokio::time::timeout(
            self.timeout,
            self.exchange(
                Method::PATCH,
                "/core/internal/database",
                Bytes::new(),
                &[(DATABASE_VERSION_HEADER, DATABASE_PROTOCOL_VERSION.to_string())],
            ),
        )
        .await
        .map_err(|_| Error::unavailable(format!("request to {} timed out", self.addr)))??;

        if status.is_success() {
            return Ok(());
        }
        if let Ok(body) = serde_json::from_slice::<ErrorBody>(&raw) {
            return Err(Error::from_body(&body));
        }
        Err(Error::unavailable(format!(
            "peer {} returned {status}",
            self.addr
        )))
    }
}
