//! The swappable TLS acceptor.
//!
//! The rustls server configuration lives behind a reader/writer lock
//! and is read once per accepted connection, so a swap affects only
//! sessions accepted after it; established sessions keep the
//! configuration they were handshaken with.

use std::sync::{Arc, RwLock};

use stratus_core::Result;
use stratus_trust::certs::KeyPair;
use stratus_trust::tls::server_config;

/// Shared handle to the TLS configuration of one network endpoint.
#[derive(Clone)]
pub struct SwappableTls {
    config: Arc<RwLock<Arc<rustls::ServerConfig>>>,
}

impl SwappableTls {
    /// Build the initial configuration from a keypair.
    pub fn new(keypair: &KeyPair) -> Result<Self> {
        let config = server_config(keypair)?;
        Ok(Self {
            config: Arc::new(RwLock::new(Arc::new(config))),
        })
    }

    /// The configuration future accepts will use.
    pub fn current(&self) -> Arc<rustls::ServerConfig> {
        Arc::clone(&self.config.read().unwrap())
    }

    /// Swap in a new keypair for future accepts.
    pub fn swap(&self, keypair: &KeyPair) -> Result<()> {
        let config = Arc::new(server_config(keypair)?);
        *self.config.write().unwrap() = config;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_trust::certs::generate_cluster_keypair;

    #[test]
    fn swap_replaces_config_for_future_accepts() {
        let first = generate_cluster_keypair().unwrap();
        let second = generate_cluster_keypair().unwrap();

        let tls = SwappableTls::new(&first).unwrap();
        let before = tls.current();

        // A handle taken before the swap keeps its configuration.
        tls.swap(&second).unwrap();
        let after = tls.current();

        assert!(!Arc::ptr_eq(&before, &after));
        // The pre-swap handle is still usable.
        assert_eq!(before.alpn_protocols, after.alpn_protocols);
    }
}
