//! Replicated record types and their derived views.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Replication role of a cluster member.
///
/// `Pending` is assigned on admission and replaced by the engine's
/// role assignment on a later heartbeat pass. The remaining roles are
/// owned by the replication engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "voter")]
    Voter,
    #[serde(rename = "standby")]
    Standby,
    #[serde(rename = "spare")]
    Spare,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Pending => "PENDING",
            Role::Voter => "voter",
            Role::Standby => "standby",
            Role::Spare => "spare",
        };
        f.write_str(s)
    }
}

/// Name and address of a member, the part of the record that never
/// changes after admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberLocation {
    pub name: String,
    pub address: String,
}

/// A row in the replicated membership table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: u64,
    pub name: String,
    pub address: String,
    /// PEM-encoded server certificate presented by this member on
    /// outbound connections.
    pub certificate: String,
    pub schema_internal: u64,
    pub schema_external: u64,
    /// Ordered list of opaque API capability labels.
    pub api_extensions: Vec<String>,
    /// Unix seconds of the last successful heartbeat; zero means the
    /// leader has never reached this member.
    pub heartbeat: u64,
    pub role: Role,
}

impl Member {
    pub fn location(&self) -> MemberLocation {
        MemberLocation {
            name: self.name.clone(),
            address: self.address.clone(),
        }
    }
}

/// Liveness and version state of a member as observed by the node
/// serving a cluster listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberState {
    #[serde(rename = "ONLINE")]
    Online,
    #[serde(rename = "UNREACHABLE")]
    Unreachable,
    #[serde(rename = "NOT TRUSTED")]
    NotTrusted,
    #[serde(rename = "NOT FOUND")]
    NotFound,
    /// The member is ahead of us; we need to upgrade.
    #[serde(rename = "UPGRADING")]
    Upgrading,
    /// The member is behind us and needs to upgrade.
    #[serde(rename = "NEEDS UPGRADE")]
    NeedsUpgrade,
}

/// A member row joined with its derived state, as served by
/// `GET /core/1.0/cluster`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberInfo {
    #[serde(flatten)]
    pub member: Member,
    pub status: MemberState,
}

/// A row in the replicated join-token table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub id: u64,
    pub secret: String,
    /// FQDN the token was issued for; admission rejects any other name.
    pub name: String,
    /// Unix seconds after which the token is rejected and swept.
    pub expiry: u64,
}

impl TokenRecord {
    pub fn is_expired(&self, now: u64) -> bool {
        self.expiry <= now
    }
}

/// The single replicated schema row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaRow {
    pub internal: u64,
    pub external: u64,
}

/// Validate that a member name is a well-formed FQDN.
///
/// Labels are 1-63 characters of `[a-z0-9-]`, must not start or end
/// with a hyphen, and the whole name caps at 255 characters.
pub fn validate_fqdn(name: &str) -> Result<()> {
    let err = || Error::invalid_argument(format!("cluster member name {name:?} is not a valid FQDN"));

    if name.is_empty() || name.len() > 255 || name.ends_with('.') {
        return Err(err());
    }

    for label in name.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(err());
        }

        if label.starts_with('-') || label.ends_with('-') {
            return Err(err());
        }

        let ok = label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !ok {
            return Err(err());
        }
    }

    Ok(())
}

/// Validate a `host:port` member address.
pub fn validate_address(address: &str) -> Result<()> {
    address
        .parse::<std::net::SocketAddr>()
        .map(|_| ())
        .map_err(|e| Error::invalid_argument(format!("invalid address {address:?}: {e}")))
}

/// Current time as unix seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
