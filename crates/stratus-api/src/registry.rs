//! The endpoint registry and authentication middleware.
//!
//! Every core endpoint is one flat record; the routers are assembled
//! from the same table the middleware consults, so access policy and
//! routing cannot drift apart.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{MatchedPath, Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use tracing::debug;

use stratus_cluster::ClusterState;
use stratus_trust::auth::{authenticate, AuthError, RequestIdentity};

use crate::{database, handlers};

/// Who may call an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Only trusted callers (control socket, cluster certificate, or
    /// a trust store match).
    AllowAuthenticated,
    /// Anyone; the handler carries its own authorization (the join
    /// admission is gated by the token secret).
    AllowUntrusted,
}

/// One endpoint record.
#[derive(Debug, Clone)]
pub struct EndpointRecord {
    pub method: Method,
    pub path: &'static str,
    pub access: Access,
    /// Reachable while the daemon has not bootstrapped or joined yet.
    pub allowed_before_init: bool,
    /// Whether a peer may need to forward this request to the member
    /// it targets.
    pub proxy_target: bool,
}

/// The core endpoint table.
pub fn endpoint_records() -> Vec<EndpointRecord> {
    use Access::*;

    let record = |method: Method,
                  path: &'static str,
                  access: Access,
                  allowed_before_init: bool,
                  proxy_target: bool| EndpointRecord {
        method,
        path,
        access,
        allowed_before_init,
        proxy_target,
    };

    vec![
        // Internal, peer to peer.
        record(Method::POST, "/core/internal/cluster", AllowUntrusted, false, false),
        record(Method::PUT, "/core/internal/cluster/{name}", AllowAuthenticated, false, false),
        record(Method::POST, "/core/internal/truststore", AllowAuthenticated, false, false),
        record(Method::DELETE, "/core/internal/truststore/{name}", AllowAuthenticated, false, false),
        record(Method::POST, "/core/internal/hooks/{kind}", AllowAuthenticated, false, true),
        record(Method::POST, "/core/internal/database", AllowAuthenticated, true, false),
        record(Method::PATCH, "/core/internal/database", AllowAuthenticated, true, false),
        // Public.
        record(Method::GET, "/core/1.0/cluster", AllowAuthenticated, false, false),
        record(Method::DELETE, "/core/1.0/cluster/{name}", AllowAuthenticated, false, true),
        record(Method::GET, "/core/1.0/ready", AllowAuthenticated, true, false),
        // Control socket only.
        record(Method::POST, "/core/control", AllowAuthenticated, true, false),
        record(Method::POST, "/core/control/tokens", AllowAuthenticated, false, false),
    ]
}

/// Shared handler state: the cluster state plus the rule index.
#[derive(Clone)]
pub struct ApiState {
    pub state: Arc<ClusterState>,
    rules: Arc<HashMap<(Method, String), EndpointRecord>>,
}

impl ApiState {
    pub fn new(state: Arc<ClusterState>) -> Self {
        let rules = endpoint_records()
            .into_iter()
            .map(|r| ((r.method.clone(), r.path.to_string()), r))
            .collect();
        Self {
            state,
            rules: Arc::new(rules),
        }
    }

    fn rule(&self, method: &Method, path: &str) -> Option<&EndpointRecord> {
        self.rules.get(&(method.clone(), path.to_string()))
    }
}

/// Router served on network listeners. Consumer routers nest inside
/// the authentication layer.
pub fn network_router(api: ApiState, extensions: Vec<(String, Router)>) -> Router {
    let mut router = core_routes().with_state(api.clone());
    for (prefix, extension) in extensions {
        router = router.nest(&prefix, extension);
    }
    router.layer(middleware::from_fn_with_state(api, authenticate_request))
}

/// Router served on the control socket: the network surface plus the
/// control endpoints.
pub fn control_router(api: ApiState, extensions: Vec<(String, Router)>) -> Router {
    let mut router = core_routes()
        .route("/core/control", post(handlers::control_post))
        .route("/core/control/tokens", post(handlers::tokens_post))
        .with_state(api.clone());
    for (prefix, extension) in extensions {
        router = router.nest(&prefix, extension);
    }
    router.layer(middleware::from_fn_with_state(api, authenticate_request))
}

fn core_routes() -> Router<ApiState> {
    Router::new()
        .route("/core/internal/cluster", post(handlers::cluster_post))
        .route("/core/internal/cluster/{name}", put(handlers::cluster_reset_put))
        .route("/core/internal/truststore", post(handlers::truststore_post))
        .route(
            "/core/internal/truststore/{name}",
            delete(handlers::truststore_delete),
        )
        .route("/core/internal/hooks/{kind}", post(handlers::hooks_post))
        .route(
            "/core/internal/database",
            post(database::database_post).patch(database::database_patch),
        )
        .route("/core/1.0/cluster", get(handlers::cluster_get))
        .route("/core/1.0/cluster/{name}", delete(handlers::cluster_delete))
        .route("/core/1.0/ready", get(handlers::ready_get))
}

fn deny(status: StatusCode, message: &str) -> Response {
    let body = stratus_core::error::ErrorBody {
        r#type: "error".to_string(),
        error: message.to_string(),
        code: status.as_u16(),
    };
    (status, Json(body)).into_response()
}

/// Registry-driven authentication.
///
/// Looks the request up in the endpoint table by method and matched
/// route, rejects pre-init access to endpoints that do not allow it,
/// and applies the trust-store contract. A wrong Host header answers
/// 421, untrusted callers 403.
async fn authenticate_request(
    State(api): State<ApiState>,
    request: Request,
    next: Next,
) -> Response {
    let identity = request
        .extensions()
        .get::<RequestIdentity>()
        .cloned()
        .unwrap_or_default();

    let matched = request
        .extensions()
        .get::<MatchedPath>()
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    // Consumer-supplied routes are not in the table; they require a
    // trusted caller on an initialized daemon.
    let (access, allowed_before_init) = match api.rule(request.method(), &matched) {
        Some(rule) => (rule.access, rule.allowed_before_init),
        None => (Access::AllowAuthenticated, false),
    };

    let initialized = api.state.is_initialized();
    if !initialized && !allowed_before_init {
        return deny(
            StatusCode::SERVICE_UNAVAILABLE,
            "daemon is not yet initialized",
        );
    }

    let host = request
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let own_addresses: Vec<String> = api
        .state
        .config()
        .map(|c| {
            let mut addrs = vec![c.address.clone()];
            addrs.extend(c.servers.values().map(|s| s.address.clone()));
            addrs
        })
        .unwrap_or_default();
    let cluster_der = api.state.cluster_cert_der();

    let trusted = match authenticate(
        &identity,
        host.as_deref(),
        &own_addresses,
        cluster_der.as_deref(),
        api.state.trust(),
    ) {
        Ok(trusted) => trusted,
        Err(AuthError::InvalidHost { host }) => {
            debug!(%host, "request for a host that is not ours");
            return deny(
                StatusCode::MISDIRECTED_REQUEST,
                &format!("host {host:?} does not match this cluster member"),
            );
        }
    };

    if access == Access::AllowAuthenticated && !trusted {
        return deny(StatusCode::FORBIDDEN, "request is not trusted");
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_has_no_duplicate_records() {
        let records = endpoint_records();
        let mut seen = std::collections::HashSet::new();
        for record in &records {
            assert!(
                seen.insert((record.method.clone(), record.path)),
                "duplicate record {} {}",
                record.method,
                record.path
            );
        }
    }

    #[test]
    fn admission_is_reachable_without_trust() {
        let records = endpoint_records();
        let admission = records
            .iter()
            .find(|r| r.path == "/core/internal/cluster" && r.method == Method::POST)
            .unwrap();
        // The join token is the authorizer for admission.
        assert_eq!(admission.access, Access::AllowUntrusted);
        assert!(!admission.allowed_before_init);
    }

    #[test]
    fn pre_init_surface_is_minimal() {
        let early: Vec<_> = endpoint_records()
            .into_iter()
            .filter(|r| r.allowed_before_init)
            .map(|r| (r.method.clone(), r.path))
            .collect();

        assert!(early.contains(&(Method::POST, "/core/control")));
        assert!(early.contains(&(Method::GET, "/core/1.0/ready")));
        assert!(early.contains(&(Method::POST, "/core/internal/database")));
        assert!(early.contains(&(Method::PATCH, "/core/internal/database")));
        assert_eq!(early.len(), 4);
    }
}
