//! Certificate generation and inspection.
//!
//! The cluster keypair is a self-signed CA shared by every member and
//! served on the core listener once a node is initialized. Each
//! member additionally holds its own server keypair, presented as its
//! client identity on outbound connections and compared byte-exact
//! against the trust store on the receiving side.

use std::path::Path;

use rcgen::{CertificateParams, DistinguishedName, DnType};
use sha2::{Digest, Sha256};
use tracing::info;

use stratus_core::{Error, Result};

/// A PEM certificate and private key pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub cert_pem: String,
    pub key_pem: String,
}

impl KeyPair {
    /// Load a keypair from `<dir>/<name>.crt` and `<dir>/<name>.key`.
    pub fn load(dir: &Path, name: &str) -> Result<Self> {
        let cert_path = dir.join(format!("{name}.crt"));
        let key_path = dir.join(format!("{name}.key"));
        let cert_pem = std::fs::read_to_string(&cert_path)
            .map_err(|e| Error::internal(format!("read {}: {e}", cert_path.display())))?;
        let key_pem = std::fs::read_to_string(&key_path)
            .map_err(|e| Error::internal(format!("read {}: {e}", key_path.display())))?;

        Ok(Self { cert_pem, key_pem })
    }

    /// Write the keypair as `<dir>/<name>.crt` and `<dir>/<name>.key`,
    /// with the key readable only by the owner.
    pub fn save(&self, dir: &Path, name: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::internal(format!("create {}: {e}", dir.display())))?;
        let cert_path = dir.join(format!("{name}.crt"));
        let key_path = dir.join(format!("{name}.key"));

        std::fs::write(&cert_path, &self.cert_pem)
            .map_err(|e| Error::internal(format!("write {}: {e}", cert_path.display())))?;
        std::fs::write(&key_path, &self.key_pem)
            .map_err(|e| Error::internal(format!("write {}: {e}", key_path.display())))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| Error::internal(format!("chmod {}: {e}", key_path.display())))?;
        }

        Ok(self.clone())
    }

    pub fn exists(dir: &Path, name: &str) -> bool {
        dir.join(format!("{name}.crt")).exists() && dir.join(format!("{name}.key")).exists()
    }

    /// Remove both files; missing files are fine.
    pub fn delete(dir: &Path, name: &str) {
        let _ = std::fs::remove_file(dir.join(format!("{name}.crt")));
        let _ = std::fs::remove_file(dir.join(format!("{name}.key")));
    }

    /// DER bytes of the first certificate in the PEM bundle.
    pub fn cert_der(&self) -> Result<Vec<u8>> {
        pem_to_der(&self.cert_pem)
    }

    pub fn fingerprint(&self) -> Result<String> {
        Ok(fingerprint(&self.cert_der()?))
    }
}

/// Generate the self-signed cluster keypair shared by all members.
pub fn generate_cluster_keypair() -> Result<KeyPair> {
    let mut params = CertificateParams::default();
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "Stratus");
    dn.push(DnType::CommonName, "Stratus cluster");
    params.distinguished_name = dn;
    params.not_after = rcgen::date_time_ymd(2036, 1, 1);

    let key = rcgen::KeyPair::generate().map_err(gen_err)?;
    let cert = params.self_signed(&key).map_err(gen_err)?;

    info!("generated cluster keypair");
    Ok(KeyPair {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

/// Generate a member server keypair with the member name and the
/// given hosts as subject alternative names.
pub fn generate_server_keypair(name: &str, hosts: &[String]) -> Result<KeyPair> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "Stratus");
    dn.push(DnType::CommonName, name);
    params.distinguished_name = dn;
    params.not_after = rcgen::date_time_ymd(2036, 1, 1);

    params
        .subject_alt_names
        .push(rcgen::SanType::DnsName(name.to_string().try_into().map_err(gen_err)?));
    for host in hosts {
        // Strip a port if one is present; SANs carry bare hosts.
        let host = host.rsplit_once(':').map_or(host.as_str(), |(h, _)| h);
        if let Ok(ip) = host.parse::<std::net::IpAddr>() {
            params.subject_alt_names.push(rcgen::SanType::IpAddress(ip));
        } else {
            params
                .subject_alt_names
                .push(rcgen::SanType::DnsName(host.to_string().try_into().map_err(gen_err)?));
        }
    }

    let key = rcgen::KeyPair::generate().map_err(gen_err)?;
    let cert = params.self_signed(&key).map_err(gen_err)?;

    info!(%name, sans = hosts.len() + 1, "generated server keypair");
    Ok(KeyPair {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

fn gen_err(e: impl std::fmt::Display) -> Error {
    Error::internal(format!("certificate generation: {e}"))
}

/// Lowercase hex SHA-256 over certificate DER bytes.
pub fn fingerprint(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Fingerprint of the first certificate in a PEM bundle.
pub fn fingerprint_pem(cert_pem: &str) -> Result<String> {
    Ok(fingerprint(&pem_to_der(cert_pem)?))
}

/// DER bytes of the first certificate in a PEM bundle.
pub fn pem_to_der(cert_pem: &str) -> Result<Vec<u8>> {
    let mut reader = std::io::BufReader::new(cert_pem.as_bytes());
    let cert = rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or_else(|| Error::invalid_argument("no certificate in PEM data"))?
        .map_err(|e| Error::invalid_argument(format!("malformed certificate PEM: {e}")))?;
    Ok(cert.as_ref().to_vec())
}

/// Whether the certificate's subject alternative names cover `name`.
pub fn cert_matches_name(cert_pem: &str, name: &str) -> Result<bool> {
    use rustls::client::verify_server_name;
    use rustls::pki_types::{CertificateDer, ServerName};
    use rustls::server::ParsedCertificate;

    let der = CertificateDer::from(pem_to_der(cert_pem)?);
    let parsed = ParsedCertificate::try_from(&der)
        .map_err(|e| Error::invalid_argument(format!("unparseable certificate: {e}")))?;
    let server_name = ServerName::try_from(name.to_string())
        .map_err(|e| Error::invalid_argument(format!("invalid name {name:?}: {e}")))?;

    Ok(verify_server_name(&parsed, &server_name).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_keypair_is_pem() {
        let pair = generate_cluster_keypair().unwrap();
        assert!(pair.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(pair.key_pem.contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn server_keypair_carries_name_san() {
        let pair = generate_server_keypair(
            "c1.example.com",
            &["127.0.0.1:9001".to_string(), "c1.internal".to_string()],
        )
        .unwrap();

        assert!(cert_matches_name(&pair.cert_pem, "c1.example.com").unwrap());
        assert!(cert_matches_name(&pair.cert_pem, "c1.internal").unwrap());
        assert!(!cert_matches_name(&pair.cert_pem, "other.example.com").unwrap());
    }

    #[test]
    fn fingerprints_differ_per_keypair() {
        let a = generate_cluster_keypair().unwrap();
        let b = generate_cluster_keypair().unwrap();
        let fa = a.fingerprint().unwrap();
        let fb = b.fingerprint().unwrap();
        assert_eq!(fa.len(), 64);
        assert_ne!(fa, fb);
        // Stable for the same certificate.
        assert_eq!(fa, fingerprint_pem(&a.cert_pem).unwrap());
    }

    #[test]
    fn save_load_roundtrip_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let pair = generate_server_keypair("c1", &[]).unwrap();
        pair.save(dir.path(), "server").unwrap();

        assert!(KeyPair::exists(dir.path(), "server"));
        let loaded = KeyPair::load(dir.path(), "server").unwrap();
        assert_eq!(loaded, pair);

        KeyPair::delete(dir.path(), "server");
        assert!(!KeyPair::exists(dir.path(), "server"));
        // Deleting again is fine.
        KeyPair::delete(dir.path(), "server");
    }

    #[test]
    fn pem_to_der_rejects_garbage() {
        assert!(pem_to_der("not a pem").is_err());
    }
}
