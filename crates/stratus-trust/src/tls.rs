//! rustls configuration for cluster connections.
//!
//! Trust decisions happen at the request layer by byte-exact
//! comparison against the trust store, so the TLS layer is configured
//! to capture identities rather than judge them: servers request but
//! do not require a client certificate, and clients either pin the
//! expected peer certificate or (for the pre-join certificate fetch)
//! accept anything and let the caller compare fingerprints.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};

use stratus_core::{Error, Result};

use crate::certs::KeyPair;

fn algorithms() -> WebPkiSupportedAlgorithms {
    rustls::crypto::ring::default_provider().signature_verification_algorithms
}

fn server_builder() -> Result<rustls::ConfigBuilder<rustls::ServerConfig, rustls::WantsVerifier>> {
    rustls::ServerConfig::builder_with_provider(rustls::crypto::ring::default_provider().into())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::internal(format!("tls protocol versions: {e}")))
}

fn client_builder() -> Result<rustls::ConfigBuilder<rustls::ClientConfig, rustls::WantsVerifier>> {
    rustls::ClientConfig::builder_with_provider(rustls::crypto::ring::default_provider().into())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::internal(format!("tls protocol versions: {e}")))
}

/// Parse every certificate in a PEM bundle.
pub fn pem_chain(cert_pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(cert_pem.as_bytes());
    let chain: std::result::Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
    let chain = chain.map_err(|e| Error::invalid_argument(format!("malformed certificate: {e}")))?;
    if chain.is_empty() {
        return Err(Error::invalid_argument("no certificate in PEM data"));
    }
    Ok(chain)
}

/// Parse the private key from a PEM bundle.
pub fn pem_key(key_pem: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = std::io::BufReader::new(key_pem.as_bytes());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::invalid_argument(format!("malformed private key: {e}")))?
        .ok_or_else(|| Error::invalid_argument("no private key in PEM data"))
}

/// Server configuration serving `keypair`, requesting (not requiring)
/// a client certificate so the request layer can authenticate it.
pub fn server_config(keypair: &KeyPair) -> Result<rustls::ServerConfig> {
    let chain = pem_chain(&keypair.cert_pem)?;
    let key = pem_key(&keypair.key_pem)?;

    let mut config = server_builder()?
        .with_client_cert_verifier(Arc::new(CaptureClientCert::new()))
        .with_single_cert(chain, key)
        .map_err(|e| Error::internal(format!("server tls config: {e}")))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(config)
}

/// Client configuration presenting `identity` and accepting exactly
/// the pinned peer certificate.
pub fn client_config(identity: &KeyPair, pinned_peer_pem: &str) -> Result<rustls::ClientConfig> {
    let pinned = pem_chain(pinned_peer_pem)?.remove(0);
    client_config_der(identity, pinned.as_ref().to_vec())
}

/// As [`client_config`], with the pinned certificate as raw DER.
pub fn client_config_der(identity: &KeyPair, pinned_der: Vec<u8>) -> Result<rustls::ClientConfig> {
    let chain = pem_chain(&identity.cert_pem)?;
    let key = pem_key(&identity.key_pem)?;
    let pinned = CertificateDer::from(pinned_der);

    let config = client_builder()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedServerCert::new(pinned)))
        .with_client_auth_cert(chain, key)
        .map_err(|e| Error::internal(format!("client tls config: {e}")))?;

    Ok(config)
}

/// Client configuration with no identity that accepts any server
/// certificate. Used only to fetch a peer's leaf certificate, which
/// the caller then compares against a token fingerprint.
pub fn client_config_anonymous() -> Result<rustls::ClientConfig> {
    Ok(client_builder()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
        .with_no_client_auth())
}

/// Requests a client certificate and accepts whatever is presented;
/// the request layer does the trust comparison.
#[derive(Debug)]
struct CaptureClientCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl CaptureClientCert {
    fn new() -> Self {
        Self {
            algorithms: algorithms(),
        }
    }
}

impl ClientCertVerifier for CaptureClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Accepts exactly one pre-shared certificate, byte for byte.
#[derive(Debug)]
struct PinnedServerCert {
    pinned: CertificateDer<'static>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl PinnedServerCert {
    fn new(pinned: CertificateDer<'static>) -> Self {
        Self {
            pinned,
            algorithms: algorithms(),
        }
    }
}

impl ServerCertVerifier for PinnedServerCert {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.pinned.as_ref() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Accepts any server certificate.
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self {
            algorithms: algorithms(),
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::{generate_cluster_keypair, generate_server_keypair};

    #[test]
    fn server_config_builds() {
        let pair = generate_cluster_keypair().unwrap();
        let config = server_config(&pair).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn client_config_builds_with_pin() {
        let identity = generate_server_keypair("c2", &[]).unwrap();
        let peer = generate_cluster_keypair().unwrap();
        client_config(&identity, &peer.cert_pem).unwrap();
    }

    #[test]
    fn anonymous_config_builds() {
        client_config_anonymous().unwrap();
    }

    #[test]
    fn pem_key_rejects_cert_input() {
        let pair = generate_cluster_keypair().unwrap();
        assert!(pem_key(&pair.cert_pem).is_err());
        assert!(pem_chain(&pair.key_pem).is_err());
    }
}
