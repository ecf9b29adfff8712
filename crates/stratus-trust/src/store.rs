//! Directory-backed trust store.
//!
//! One YAML file per peer under `truststore/`, named by member name.
//! The in-memory index is rebuilt from the directory and swapped
//! atomically; writers refresh before returning so a subsequent
//! authenticate call on the same store observes the write.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use stratus_core::{Error, Result};

use crate::certs::{fingerprint, pem_to_der};

/// One trusted peer: the on-disk record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remote {
    pub name: String,
    pub address: String,
    /// PEM-encoded certificate this peer presents.
    pub certificate: String,
}

#[derive(Debug, Clone)]
struct Entry {
    remote: Remote,
    cert_der: Vec<u8>,
    fingerprint: String,
}

/// The authoritative local mapping from peer name to address and
/// certificate.
pub struct TrustStore {
    dir: PathBuf,
    entries: RwLock<HashMap<String, Entry>>,
}

impl TrustStore {
    /// Open (creating if needed) the trust directory and load it.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::internal(format!("create {}: {e}", dir.display())))?;
        let store = Self {
            dir: dir.to_path_buf(),
            entries: RwLock::new(HashMap::new()),
        };
        store.refresh()?;
        Ok(store)
    }

    /// Write each record as `<name>.yaml` and reload before returning.
    ///
    /// A name already mapping to a different certificate is refused;
    /// re-adding an identical certificate is idempotent and may update
    /// the address.
    pub fn add(&self, remotes: &[Remote]) -> Result<()> {
        for remote in remotes {
            let der = pem_to_der(&remote.certificate)?;
            {
                let entries = self.entries.read().unwrap();
                if let Some(existing) = entries.get(&remote.name) {
                    if existing.cert_der != der {
                        return Err(Error::conflict(format!(
                            "remote {:?} already exists with a different certificate",
                            remote.name
                        )));
                    }
                }
            }

            let path = self.dir.join(format!("{}.yaml", remote.name));
            let raw = serde_yaml::to_string(remote)?;
            let tmp = path.with_extension("yaml.tmp");
            std::fs::write(&tmp, raw)
                .map_err(|e| Error::internal(format!("write {}: {e}", tmp.display())))?;
            std::fs::rename(&tmp, &path)
                .map_err(|e| Error::internal(format!("rename {}: {e}", path.display())))?;
            debug!(name = %remote.name, address = %remote.address, "trust entry written");
        }

        self.refresh()
    }

    /// Delete a peer's file. Unknown names are fine.
    pub fn remove(&self, name: &str) -> Result<()> {
        let path = self.dir.join(format!("{name}.yaml"));
        match std::fs::remove_file(&path) {
            Ok(()) => info!(%name, "trust entry removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::internal(format!("remove {}: {e}", path.display())));
            }
        }

        self.refresh()
    }

    /// Rescan the directory and atomically replace the index.
    ///
    /// Called by writers before returning, and by the daemon when an
    /// external filesystem watcher reports a change.
    pub fn refresh(&self) -> Result<()> {
        let mut next = HashMap::new();

        let dir = std::fs::read_dir(&self.dir)
            .map_err(|e| Error::internal(format!("read {}: {e}", self.dir.display())))?;
        for item in dir {
            let item = item.map_err(|e| Error::internal(e.to_string()))?;
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }

            let raw = match std::fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable trust entry");
                    continue;
                }
            };
            let remote: Remote = match serde_yaml::from_str(&raw) {
                Ok(remote) => remote,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping malformed trust entry");
                    continue;
                }
            };
            let cert_der = match pem_to_der(&remote.certificate) {
                Ok(der) => der,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping trust entry with bad certificate");
                    continue;
                }
            };

            let fingerprint = fingerprint(&cert_der);
            next.insert(
                remote.name.clone(),
                Entry {
                    remote,
                    cert_der,
                    fingerprint,
                },
            );
        }

        let mut entries = self.entries.write().unwrap();
        *entries = next;
        Ok(())
    }

    pub fn by_name(&self, name: &str) -> Option<Remote> {
        self.entries
            .read()
            .unwrap()
            .get(name)
            .map(|e| e.remote.clone())
    }

    pub fn by_address(&self, address: &str) -> Option<Remote> {
        self.entries
            .read()
            .unwrap()
            .values()
            .find(|e| e.remote.address == address)
            .map(|e| e.remote.clone())
    }

    /// Look up a peer by the SHA-256 fingerprint of its certificate.
    pub fn by_fingerprint(&self, fingerprint: &str) -> Option<Remote> {
        self.entries
            .read()
            .unwrap()
            .values()
            .find(|e| e.fingerprint == fingerprint)
            .map(|e| e.remote.clone())
    }

    /// Whether any trusted peer presents exactly this certificate.
    pub fn is_trusted_der(&self, der: &[u8]) -> bool {
        self.entries
            .read()
            .unwrap()
            .values()
            .any(|e| e.cert_der == der)
    }

    /// All remotes, optionally excluding one member name.
    pub fn remotes(&self, exclude: Option<&str>) -> Vec<Remote> {
        let mut remotes: Vec<Remote> = self
            .entries
            .read()
            .unwrap()
            .values()
            .filter(|e| Some(e.remote.name.as_str()) != exclude)
            .map(|e| e.remote.clone())
            .collect();
        remotes.sort_by(|a, b| a.name.cmp(&b.name));
        remotes
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::generate_server_keypair;

    fn remote(name: &str, address: &str) -> Remote {
        let pair = generate_server_keypair(name, &[]).unwrap();
        Remote {
            name: name.to_string(),
            address: address.to_string(),
            certificate: pair.cert_pem,
        }
    }

    #[test]
    fn add_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::open(dir.path()).unwrap();

        let c1 = remote("c1", "127.0.0.1:9001");
        let c2 = remote("c2", "127.0.0.1:9002");
        store.add(&[c1.clone(), c2.clone()]).unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.by_name("c1").unwrap().address, "127.0.0.1:9001");
        assert_eq!(store.by_address("127.0.0.1:9002").unwrap().name, "c2");
        assert!(store.by_name("c3").is_none());

        let der = pem_to_der(&c1.certificate).unwrap();
        assert_eq!(store.by_fingerprint(&fingerprint(&der)).unwrap().name, "c1");
        assert!(store.is_trusted_der(&der));
    }

    #[test]
    fn add_refuses_cert_change() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::open(dir.path()).unwrap();

        store.add(&[remote("c1", "127.0.0.1:9001")]).unwrap();

        // Same name, different keypair.
        let other = remote("c1", "127.0.0.1:9001");
        let err = store.add(&[other]).unwrap_err();
        assert_eq!(err.kind(), stratus_core::ErrorKind::Conflict);
    }

    #[test]
    fn add_same_cert_updates_address() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::open(dir.path()).unwrap();

        let mut c1 = remote("c1", "127.0.0.1:9001");
        store.add(&[c1.clone()]).unwrap();

        c1.address = "127.0.0.1:9009".to_string();
        store.add(&[c1]).unwrap();
        assert_eq!(store.by_name("c1").unwrap().address, "127.0.0.1:9009");
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::open(dir.path()).unwrap();

        store.add(&[remote("c1", "127.0.0.1:9001")]).unwrap();
        store.remove("c1").unwrap();
        assert!(store.by_name("c1").is_none());
        store.remove("c1").unwrap();
    }

    #[test]
    fn refresh_picks_up_external_edits() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::open(dir.path()).unwrap();
        store.add(&[remote("c1", "127.0.0.1:9001")]).unwrap();

        // A second store writes into the same directory.
        let other = TrustStore::open(dir.path()).unwrap();
        other.add(&[remote("c2", "127.0.0.1:9002")]).unwrap();

        assert!(store.by_name("c2").is_none());
        store.refresh().unwrap();
        assert!(store.by_name("c2").is_some());
    }

    #[test]
    fn refresh_skips_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::open(dir.path()).unwrap();
        store.add(&[remote("c1", "127.0.0.1:9001")]).unwrap();

        std::fs::write(dir.path().join("junk.yaml"), "not: [valid").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        store.refresh().unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.names(), vec!["c1".to_string()]);
    }

    #[test]
    fn remotes_excludes_self() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::open(dir.path()).unwrap();
        store
            .add(&[remote("c1", "127.0.0.1:9001"), remote("c2", "127.0.0.1:9002")])
            .unwrap();

        let peers = store.remotes(Some("c1"));
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].name, "c2");
        assert_eq!(store.remotes(None).len(), 2);
    }
}
