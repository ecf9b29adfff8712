//! Request authentication against the trust store.

use thiserror::Error;
use tracing::debug;

use crate::store::TrustStore;

/// What the transport layer knows about the requester.
#[derive(Debug, Clone, Default)]
pub struct RequestIdentity {
    /// The request arrived over the local control socket.
    pub local: bool,
    /// DER bytes of the peer-presented leaf certificate, if any.
    pub peer_cert_der: Option<Vec<u8>>,
}

/// Distinguished authentication failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The request's Host header does not name this member; the
    /// caller may answer with a 421-equivalent.
    #[error("invalid host {host:?}")]
    InvalidHost { host: String },
}

/// Decide whether a request is trusted.
///
/// Trusted iff the request came over the local control socket, or the
/// daemon is still pre-init (no cluster certificate yet, the join and
/// bootstrap flows rely on this), or the Host header names one of our
/// advertised addresses and the peer certificate matches the shared
/// cluster certificate or a trust store entry, byte-exact.
pub fn authenticate(
    identity: &RequestIdentity,
    host: Option<&str>,
    own_addresses: &[String],
    cluster_cert_der: Option<&[u8]>,
    trust: &TrustStore,
) -> Result<bool, AuthError> {
    if identity.local {
        return Ok(true);
    }

    // No cluster certificate yet means the daemon is pre-init and the
    // core listener still serves the server certificate.
    let cluster_cert_der = match cluster_cert_der {
        Some(der) => der,
        None => return Ok(true),
    };

    let host = host.unwrap_or_default();
    if !own_addresses.iter().any(|a| a == host) {
        return Err(AuthError::InvalidHost {
            host: host.to_string(),
        });
    }

    match &identity.peer_cert_der {
        Some(der) if der.as_slice() == cluster_cert_der => Ok(true),
        Some(der) if trust.is_trusted_der(der) => Ok(true),
        Some(_) => {
            debug!("peer certificate not in trust store");
            Ok(false)
        }
        None => Ok(false),
    }
}
