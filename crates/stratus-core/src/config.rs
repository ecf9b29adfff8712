//! Local daemon configuration (`daemon.yaml`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{validate_address, validate_fqdn};

/// Configuration for one additional listener.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub address: String,
}

/// The local daemon configuration persisted at `daemon.yaml` in the
/// state directory.
///
/// Immutable after init except through the dedicated update path,
/// which rewrites the file and fires `on_daemon_config_update`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub name: String,
    pub address: String,
    /// Named additional servers, keyed by listener name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub servers: HashMap<String, ServerConfig>,
}

impl DaemonConfig {
    /// Validate name and addresses.
    pub fn validate(&self) -> Result<()> {
        validate_fqdn(&self.name)?;
        validate_address(&self.address)?;
        for (name, server) in &self.servers {
            validate_address(&server.address)
                .map_err(|e| Error::invalid_argument(format!("server {name:?}: {e}")))?;
        }

        Ok(())
    }

    /// Load the configuration from `daemon.yaml` under the state dir.
    pub fn load(state_dir: &Path) -> Result<Self> {
        let path = Self::path(state_dir);
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| Error::internal(format!("read {}: {e}", path.display())))?;
        let config: DaemonConfig = serde_yaml::from_str(&raw)?;

        Ok(config)
    }

    /// Write the configuration atomically: temp file then rename.
    pub fn save(&self, state_dir: &Path) -> Result<()> {
        let path = Self::path(state_dir);
        let raw = serde_yaml::to_string(self)?;
        let tmp = path.with_extension("yaml.tmp");
        std::fs::write(&tmp, raw)
            .map_err(|e| Error::internal(format!("write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| Error::internal(format!("rename {}: {e}", path.display())))?;

        Ok(())
    }

    pub fn path(state_dir: &Path) -> PathBuf {
        state_dir.join("daemon.yaml")
    }

    pub fn exists(state_dir: &Path) -> bool {
        Self::path(state_dir).exists()
    }
}
