//! Replication-stream dialing and the pre-trust certificate fetch.

use std::sync::Arc;

use http::{Method, Request, StatusCode};
use http_body_util::Empty;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use stratus_core::messages::{
    DATABASE_PROTOCOL_VERSION, DATABASE_UPGRADE_PROTOCOL, DATABASE_VERSION_HEADER,
};
use stratus_core::{Error, Result};
use stratus_trust::certs::KeyPair;
use stratus_trust::tls::{client_config, client_config_anonymous};

async fn tls_connect(
    addr: &str,
    config: Arc<rustls::ClientConfig>,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(addr)
        .await
        .map_err(|e| Error::unavailable(format!("connect {addr}: {e}")))?;

    let host = addr.rsplit_once(':').map_or(addr, |(h, _)| h);
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| Error::invalid_argument(format!("invalid host {host:?}: {e}")))?;

    TlsConnector::from(config)
        .connect(server_name, tcp)
        .await
        .map_err(|e| Error::unavailable(format!("tls handshake with {addr}: {e}")))
}

/// Fetch the leaf certificate a peer presents, trusting nothing.
///
/// Used during join to compare the peer against the token's pinned
/// fingerprint before any authenticated request is made.
pub async fn fetch_peer_certificate(addr: &str) -> Result<Vec<u8>> {
    let tls = tls_connect(addr, Arc::new(client_config_anonymous()?)).await?;
    let (_, connection) = tls.get_ref();

    let certs = connection
        .peer_certificates()
        .ok_or_else(|| Error::unavailable(format!("peer {addr} presented no certificate")))?;
    let leaf = certs
        .first()
        .ok_or_else(|| Error::unavailable(format!("peer {addr} presented no certificate")))?;

    Ok(leaf.as_ref().to_vec())
}

/// Open a replication stream to a peer's database endpoint.
///
/// Performs the HTTP/1.1 upgrade handshake: `101 Switching Protocols`
/// hands back the raw connection for the engine; `426 Upgrade
/// Required` means the peer observed our protocol version as stale
/// and is surfaced as such, with any further action left to the
/// caller.
pub async fn dial_database(
    addr: &str,
    identity: &KeyPair,
    peer_cert_pem: &str,
) -> Result<TokioIo<Upgraded>> {
    let config = Arc::new(client_config(identity, peer_cert_pem)?);
    let tls = tls_connect(addr, config).await?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
        .await
        .map_err(|e| Error::unavailable(format!("http handshake with {addr}: {e}")))?;
    tokio::spawn(async move {
        let _ = conn.with_upgrades().await;
    });

    let request = Request::builder()
        .method(Method::POST)
        .uri("/core/internal/database")
        .header(http::header::HOST, addr)
        .header(http::header::UPGRADE, DATABASE_UPGRADE_PROTOCOL)
        .header(http::header::CONNECTION, "Upgrade")
        .header(DATABASE_VERSION_HEADER, DATABASE_PROTOCOL_VERSION.to_string())
        .body(Empty::<bytes::Bytes>::new())
        .map_err(|e| Error::internal(e.to_string()))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| Error::unavailable(format!("database dial to {addr}: {e}")))?;

    match response.status() {
        StatusCode::SWITCHING_PROTOCOLS => {
            let upgrade_header = response
                .headers()
                .get(http::header::UPGRADE)
                .and_then(|v| v.to_str().ok());
            if upgrade_header != Some(DATABASE_UPGRADE_PROTOCOL) {
                return Err(Error::internal(format!(
                    "peer {addr} switched to unexpected protocol {upgrade_header:?}"
                )));
            }

            let upgraded = hyper::upgrade::on(response)
                .await
                .map_err(|e| Error::unavailable(format!("upgrade with {addr}: {e}")))?;
            debug!(%addr, "replication stream established");
            Ok(TokioIo::new(upgraded))
        }
        StatusCode::UPGRADE_REQUIRED => Err(Error::upgrade_required(format!(
            "peer {addr} requires a newer replication protocol"
        ))),
        status => Err(Error::unavailable(format!(
            "database dial to {addr} failed with {status}"
        ))),
    }
}
