//! stratus-endpoints — the endpoint multiplexer.
//!
//! Owns a named collection of listeners: the local control socket,
//! the core network listener, and any additional listeners the
//! consuming application registers. Each wraps an axum router served
//! by hyper; network endpoints terminate TLS through a swappable
//! acceptor so the daemon can rotate certificates without dropping
//! in-flight sessions.

pub mod listener;
pub mod manager;

pub use listener::SwappableTls;
pub use manager::{Endpoint, EndpointKind, EndpointManager};

/// Errors distinguished by the endpoint layer.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    /// The requested bind address is already held by a listener.
    #[error("address {0} already in use")]
    AddrInUse(String),

    #[error("endpoint {0:?} is not registered")]
    UnknownEndpoint(String),

    #[error("endpoint io: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Tls(String),
}

impl From<EndpointError> for stratus_core::Error {
    fn from(err: EndpointError) -> Self {
        match &err {
            EndpointError::AddrInUse(_) => stratus_core::Error::conflict(err.to_string()),
            EndpointError::UnknownEndpoint(_) => stratus_core::Error::not_found(err.to_string()),
            _ => stratus_core::Error::internal(err.to_string()),
        }
    }
}
