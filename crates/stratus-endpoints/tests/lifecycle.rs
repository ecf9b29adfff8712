//! Listener lifecycle tests: bind, serve over mutual TLS, hot swap,
//! and the control socket.

use axum::routing::get;
use axum::{Extension, Json, Router};
use http::Method;

use stratus_client::PeerClient;
use stratus_endpoints::{Endpoint, EndpointError, EndpointManager};
use stratus_trust::auth::RequestIdentity;
use stratus_trust::certs::{generate_cluster_keypair, generate_server_keypair, KeyPair};

fn identity_router() -> Router {
    Router::new().route(
        "/core/1.0/ready",
        get(|Extension(identity): Extension<RequestIdentity>| async move {
            Json(serde_json::json!({
                "local": identity.local,
                "presented_cert": identity.peer_cert_der.is_some(),
            }))
        }),
    )
}

fn client_identity() -> KeyPair {
    generate_server_keypair("probe.example.com", &[]).unwrap()
}

async fn serve_network(manager: &EndpointManager, serving: &KeyPair) -> String {
    let endpoint = Endpoint::network("core", "127.0.0.1:0", identity_router(), serving, None).unwrap();
    manager.add(endpoint).await.unwrap();
    manager.local_addr("core").await.unwrap().to_string()
}

#[tokio::test]
async fn network_round_trip_with_client_cert() {
    let manager = EndpointManager::new();
    let serving = generate_cluster_keypair().unwrap();
    let addr = serve_network(&manager, &serving).await;

    let client = PeerClient::new(&addr, &client_identity(), &serving.cert_pem).unwrap();
    let body: serde_json::Value = client
        .request::<(), _>(Method::GET, "/core/1.0/ready", None)
        .await
        .unwrap();

    assert_eq!(body["local"], false);
    assert_eq!(body["presented_cert"], true);

    manager.down(true, &[]).await;
}

#[tokio::test]
async fn tls_swap_affects_only_new_sessions() {
    let manager = EndpointManager::new();
    let first = generate_cluster_keypair().unwrap();
    let second = generate_cluster_keypair().unwrap();
    let addr = serve_network(&manager, &first).await;

    let pinned_first = PeerClient::new(&addr, &client_identity(), &first.cert_pem).unwrap();
    pinned_first
        .request::<(), serde_json::Value>(Method::GET, "/core/1.0/ready", None)
        .await
        .unwrap();

    manager.update_tls_by_name("core", &second).await.unwrap();

    // A client still pinning the old certificate is refused.
    let err = pinned_first
        .request::<(), serde_json::Value>(Method::GET, "/core/1.0/ready", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), stratus_core::ErrorKind::Unavailable);

    // Pinning the new certificate works.
    let pinned_second = PeerClient::new(&addr, &client_identity(), &second.cert_pem).unwrap();
    pinned_second
        .request::<(), serde_json::Value>(Method::GET, "/core/1.0/ready", None)
        .await
        .unwrap();

    manager.down(true, &[]).await;
}

#[tokio::test]
async fn rebinding_held_address_is_distinguished() {
    let manager = EndpointManager::new();
    let serving = generate_cluster_keypair().unwrap();
    let addr = serve_network(&manager, &serving).await;

    let duplicate =
        Endpoint::network("other", &addr, identity_router(), &serving, None).unwrap();
    let err = manager.add(duplicate).await.unwrap_err();
    assert!(matches!(err, EndpointError::AddrInUse(_)));

    manager.down(true, &[]).await;
}

#[tokio::test]
async fn add_with_existing_name_is_ignored() {
    let manager = EndpointManager::new();
    let serving = generate_cluster_keypair().unwrap();
    let addr = serve_network(&manager, &serving).await;

    // Same name, different address: ignored, original keeps serving.
    let other =
        Endpoint::network("core", "127.0.0.1:0", identity_router(), &serving, None).unwrap();
    manager.add(other).await.unwrap();
    assert_eq!(manager.local_addr("core").await.unwrap().to_string(), addr);

    manager.down(true, &[]).await;
}

#[tokio::test]
async fn down_closes_the_listener() {
    let manager = EndpointManager::new();
    let serving = generate_cluster_keypair().unwrap();
    let addr = serve_network(&manager, &serving).await;

    manager.down(true, &[]).await;
    assert!(!manager.is_up("core").await);

    let client = PeerClient::new(&addr, &client_identity(), &serving.cert_pem).unwrap();
    let err = client
        .request::<(), serde_json::Value>(Method::GET, "/core/1.0/ready", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), stratus_core::ErrorKind::Unavailable);
}

#[tokio::test]
async fn control_socket_serves_local_identity() {
    use http_body_util::BodyExt;

    let manager = EndpointManager::new();
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("control.socket");

    manager
        .add(Endpoint::control("control", socket.clone(), identity_router()))
        .await
        .unwrap();

    let stream = tokio::net::UnixStream::connect(&socket).await.unwrap();
    let (mut sender, conn) =
        hyper::client::conn::http1::handshake(hyper_util::rt::TokioIo::new(stream))
            .await
            .unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let request = http::Request::builder()
        .method(Method::GET)
        .uri("/core/1.0/ready")
        .header(http::header::HOST, "stratus")
        .body(http_body_util::Empty::<bytes::Bytes>::new())
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    assert!(response.status().is_success());

    let raw = response.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(body["local"], true);
    assert_eq!(body["presented_cert"], false);

    manager.down(true, &[]).await;
}
