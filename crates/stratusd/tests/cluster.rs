//! End-to-end daemon tests: bootstrap, token issue, two-node join,
//! quorum-safe removal, and token expiry. Everything runs in-process
//! over loopback TLS and per-daemon control sockets.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use http::{Method, StatusCode};
use http_body_util::BodyExt;
use hyper_util::rt::TokioIo;

use stratusd::{App, Daemon};

/// Reserve a loopback port by binding and dropping a listener.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

struct Node {
    _dir: tempfile::TempDir,
    daemon: Arc<Daemon>,
    socket: PathBuf,
    address: String,
    run: tokio::task::JoinHandle<stratus_core::Result<()>>,
}

impl Node {
    async fn spawn() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let address = format!("127.0.0.1:{}", free_port());
        let socket = dir.path().join("control.socket");

        let daemon = App::new(dir.path())
            .with_heartbeat_interval(Duration::from_secs(1))
            .with_drain_timeout(Some(Duration::from_secs(2)))
            .into_daemon()
            .unwrap();

        let run = {
            let daemon = Arc::clone(&daemon);
            tokio::spawn(async move { daemon.run().await })
        };

        // Wait for the control socket to come up.
        for _ in 0..100 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        Node {
            _dir: dir,
            daemon,
            socket,
            address,
            run,
        }
    }

    async fn control(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        control_call(&self.socket, method, path, body).await
    }

    async fn bootstrap(&self, name: &str) {
        let (status, body) = self
            .control(
                Method::POST,
                "/core/control",
                Some(serde_json::json!({
                    "bootstrap": true,
                    "name": name,
                    "address": self.address,
                })),
            )
            .await;
        assert!(status.is_success(), "bootstrap failed: {body}");
    }

    async fn issue_token(&self, name: &str, expire_after_secs: Option<u64>) -> String {
        let mut request = serde_json::json!({ "name": name });
        if let Some(secs) = expire_after_secs {
            request["expire_after_secs"] = secs.into();
        }
        let (status, body) = self
            .control(Method::POST, "/core/control/tokens", Some(request))
            .await;
        assert!(status.is_success(), "token issue failed: {body}");
        body.as_str().unwrap().to_string()
    }

    async fn join(&self, name: &str, token: &str) -> (StatusCode, serde_json::Value) {
        self.control(
            Method::POST,
            "/core/control",
            Some(serde_json::json!({
                "join_token": token,
                "name": name,
                "address": self.address,
            })),
        )
        .await
    }

    async fn members(&self) -> Vec<serde_json::Value> {
        let (status, body) = self.control(Method::GET, "/core/1.0/cluster", None).await;
        assert!(status.is_success(), "cluster listing failed: {body}");
        body.as_array().cloned().unwrap_or_default()
    }

    async fn stop(self) {
        self.daemon.trigger_shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(15), self.run).await;
    }
}

async fn control_call(
    socket: &Path,
    method: Method,
    path: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let stream = tokio::net::UnixStream::connect(socket)
        .await
        .expect("control socket reachable");
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let payload = body
        .map(|b| serde_json::to_vec(&b).unwrap())
        .unwrap_or_default();
    let request = http::Request::builder()
        .method(method)
        .uri(path)
        .header(http::header::HOST, "stratus-control")
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(http_body_util::Full::new(bytes::Bytes::from(payload)))
        .unwrap();

    let response = sender.send_request(request).await.unwrap();
    let status = response.status();
    let raw = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&raw).unwrap_or(serde_json::Value::Null);
    (status, value)
}

/// Poll until `check` passes or the deadline expires.
async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..120 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread")]
async fn bootstrap_lists_a_single_member() {
    let node = Node::spawn().await;

    // Nothing initialized yet: the ready probe refuses.
    let (status, _) = node.control(Method::GET, "/core/1.0/ready", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    node.bootstrap("c1.stratus.local").await;

    let (status, _) = node.control(Method::GET, "/core/1.0/ready", None).await;
    assert_eq!(status, StatusCode::OK);

    let members = node.members().await;
    assert_eq!(members.len(), 1);
    assert_eq!(members[0]["name"], "c1.stratus.local");
    assert_eq!(members[0]["address"], node.address);
    assert_eq!(members[0]["status"], "ONLINE");
    let role = members[0]["role"].as_str().unwrap();
    assert!(role == "voter" || role == "PENDING", "unexpected role {role}");

    // The heartbeat loop promotes the bootstrap member.
    wait_for("bootstrap member to become voter", || async {
        node.members().await[0]["role"] == "voter"
    })
    .await;

    node.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn bootstrap_twice_is_refused() {
    let node = Node::spawn().await;
    node.bootstrap("c1.stratus.local").await;

    let (status, body) = node
        .control(
            Method::POST,
            "/core/control",
            Some(serde_json::json!({
                "bootstrap": true,
                "name": "c1.stratus.local",
                "address": node.address,
            })),
        )
        .await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED, "{body}");

    node.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn two_node_join_and_remove() {
    let c1 = Node::spawn().await;
    c1.bootstrap("c1.stratus.local").await;

    let token = c1.issue_token("c2.stratus.local", None).await;

    let c2 = Node::spawn().await;
    let (status, body) = c2.join("c2.stratus.local", &token).await;
    assert!(status.is_success(), "join failed: {body}");

    // Both members visible from both sides.
    wait_for("both members in c1's view", || async {
        c1.members().await.len() == 2
    })
    .await;
    wait_for("both members in c2's view", || async {
        c2.members().await.len() == 2
    })
    .await;

    // Heartbeat convergence: everyone becomes a voter.
    wait_for("both members promoted to voter", || async {
        c1.members()
            .await
            .iter()
            .all(|m| m["role"] == "voter" && m["status"] == "ONLINE")
    })
    .await;

    // The same token cannot be redeemed twice.
    let c3 = Node::spawn().await;
    let (status, body) = c3.join("c2.stratus.local", &token).await;
    assert!(!status.is_success(), "stale token accepted: {body}");

    // Remove c2 through c1; c2 resets itself and exits.
    let (status, body) = c1
        .control(
            Method::DELETE,
            "/core/1.0/cluster/c2.stratus.local?force=1",
            None,
        )
        .await;
    assert!(status.is_success(), "remove failed: {body}");

    wait_for("cluster shrinks to one member", || async {
        c1.members().await.len() == 1
    })
    .await;

    c3.stop().await;
    c2.stop().await;
    c1.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_token_join_fails_without_side_effects() {
    let c1 = Node::spawn().await;
    c1.bootstrap("c1.stratus.local").await;

    let token = c1.issue_token("c4.stratus.local", Some(1)).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let c4 = Node::spawn().await;
    let (status, body) = c4.join("c4.stratus.local", &token).await;
    assert!(!status.is_success(), "expired token accepted: {body}");

    // No row was inserted anywhere.
    let members = c1.members().await;
    assert_eq!(members.len(), 1);
    assert_eq!(members[0]["name"], "c1.stratus.local");

    c4.stop().await;
    c1.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn removing_the_only_voter_is_refused() {
    let c1 = Node::spawn().await;
    c1.bootstrap("c1.stratus.local").await;

    wait_for("bootstrap member to become voter", || async {
        c1.members().await[0]["role"] == "voter"
    })
    .await;

    let (status, body) = c1
        .control(
            Method::DELETE,
            "/core/1.0/cluster/c1.stratus.local?force=0",
            None,
        )
        .await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED, "{body}");
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("insufficient voters"));

    c1.stop().await;
}
