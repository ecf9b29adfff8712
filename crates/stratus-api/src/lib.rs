//! stratus-api — the replicated REST surface.
//!
//! Three prefixes make up the core API:
//!
//! | prefix           | audience                                  |
//! |------------------|-------------------------------------------|
//! | `/core/internal` | peer-to-peer, over the cluster certificate |
//! | `/core/control`  | local operator, control socket only        |
//! | `/core/1.0`      | stable public surface                      |
//!
//! Consumer-supplied routers mount under their own prefixes. Every
//! endpoint is described by a registry record (path, method, access
//! policy, allowed-before-init, proxy-target); the authentication
//! middleware consults the registry rather than per-handler logic.

pub mod database;
pub mod error;
pub mod handlers;
pub mod registry;

use std::sync::Arc;

use axum::Router;

use stratus_cluster::ClusterState;

pub use error::ApiError;
pub use registry::{Access, ApiState, EndpointRecord};

/// Routers for the network listener and the control socket.
pub struct ApiRouters {
    /// Served on the core network listener and additional listeners.
    pub network: Router,
    /// Served on the local control socket; includes the control
    /// endpoints on top of the network surface.
    pub control: Router,
}

/// Build the REST surface over the shared cluster state.
///
/// `extensions` are consumer routers mounted under their own prefixes
/// on both listeners, inside the authentication layer: consumer
/// endpoints require a trusted caller on an initialized daemon.
pub fn build_routers(state: Arc<ClusterState>, extensions: Vec<(String, Router)>) -> ApiRouters {
    let api_state = ApiState::new(state);

    ApiRouters {
        network: registry::network_router(api_state.clone(), extensions.clone()),
        control: registry::control_router(api_state, extensions),
    }
}
