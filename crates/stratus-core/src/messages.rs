//! Request and response bodies for the REST surface.

use std::collections::HashMap;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{Member, MemberLocation};

/// Upgrade protocol name for replication streams.
pub const DATABASE_UPGRADE_PROTOCOL: &str = "stratus-raft";

/// Header carrying the replication wire-protocol version.
pub const DATABASE_VERSION_HEADER: &str = "x-stratus-raft-version";

/// The wire-protocol version this build speaks.
pub const DATABASE_PROTOCOL_VERSION: u32 = 1;

/// Body of `POST /core/control`: drive a local bootstrap or join.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlRequest {
    #[serde(default)]
    pub bootstrap: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_token: Option<String>,
    pub name: String,
    pub address: String,
    /// Opaque per-application initialization data, passed to hooks.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub init_config: HashMap<String, String>,
}

/// Body of `POST /core/control/tokens`: issue a join token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenIssueRequest {
    pub name: String,
    /// Seconds until the token expires. Defaults to three hours.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_after_secs: Option<u64>,
}

/// The decoded join-token bundle handed to the joining member.
///
/// Encoded as base64 over the canonical JSON object with PascalCase
/// keys; the encoding is part of the stable external interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    #[serde(rename = "Secret")]
    pub secret: String,
    #[serde(rename = "Name")]
    pub name: String,
    /// Hex SHA-256 fingerprint of the cluster certificate.
    #[serde(rename = "Fingerprint")]
    pub fingerprint: String,
    #[serde(rename = "JoinAddresses")]
    pub join_addresses: Vec<String>,
}

impl Token {
    pub fn encode(&self) -> Result<String> {
        let raw = serde_json::to_vec(self)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(raw))
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::invalid_argument(format!("malformed join token: {e}")))?;
        serde_json::from_slice(&raw)
            .map_err(|e| Error::invalid_argument(format!("malformed join token: {e}")))
    }
}

/// Body of `POST /core/internal/cluster`: the joiner's proposed member
/// record plus the token secret authorizing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub name: String,
    pub address: String,
    /// PEM server certificate the joiner will present on outbound
    /// connections.
    pub certificate: String,
    pub schema_internal: u64,
    pub schema_external: u64,
    pub api_extensions: Vec<String>,
    pub secret: String,
}

/// Certificate material for one additional listener, returned to a
/// joiner so every member serves the same keypairs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CertificateBundle {
    pub cert: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
}

/// Response to a successful admission: the cluster identity and the
/// current member list the joiner seeds its trust store from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub cluster_cert: String,
    pub cluster_key: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub cluster_additional_certs: HashMap<String, CertificateBundle>,
    /// The member that authorized us; recorded for unwind.
    pub trusted_member: MemberLocation,
    pub cluster_members: Vec<Member>,
}

/// Lifecycle hook kinds a peer may trigger remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookKind {
    PreRemove,
    PostRemove,
    OnNewMember,
    OnDaemonConfigUpdate,
}

impl HookKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pre-remove" => Ok(HookKind::PreRemove),
            "post-remove" => Ok(HookKind::PostRemove),
            "on-new-member" => Ok(HookKind::OnNewMember),
            "on-daemon-config-update" => Ok(HookKind::OnDaemonConfigUpdate),
            other => Err(Error::invalid_argument(format!("unknown hook kind {other:?}"))),
        }
    }
}

/// Body of `POST /core/internal/hooks/{pre-remove,post-remove}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookRemoveRequest {
    #[serde(default)]
    pub force: bool,
}

/// Body of `POST /core/internal/hooks/on-new-member`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookNewMemberRequest {
    pub new_member: MemberLocation,
}

/// Trust entry propagated between peers after a join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustEntry {
    pub name: String,
    pub address: String,
    pub certificate: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_encoding_is_base64_json_with_stable_keys() {
        let token = Token {
            secret: "deadbeef".to_string(),
            name: "c4.example.com".to_string(),
            fingerprint: "ab".repeat(32),
            join_addresses: vec!["127.0.0.1:9001".to_string(), "127.0.0.1:9002".to_string()],
        };

        let encoded = token.encode().unwrap();
        let raw = base64::engine::general_purpose::STANDARD
            .decode(&encoded)
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(json["Name"], "c4.example.com");
        assert_eq!(json["JoinAddresses"].as_array().unwrap().len(), 2);

        let back = Token::decode(&encoded).unwrap();
        assert_eq!(back, token);
    }

    #[test]
    fn token_decode_rejects_garbage() {
        assert!(Token::decode("not base64 at all!!!").is_err());

        let not_json = base64::engine::general_purpose::STANDARD.encode(b"hello");
        assert!(Token::decode(&not_json).is_err());
    }

    #[test]
    fn hook_kind_parse() {
        assert_eq!(HookKind::parse("pre-remove").unwrap(), HookKind::PreRemove);
        assert_eq!(
            HookKind::parse("on-new-member").unwrap(),
            HookKind::OnNewMember
        );
        assert!(HookKind::parse("reboot").is_err());
    }

    #[test]
    fn control_request_defaults() {
        let req: ControlRequest =
            serde_json::from_str(r#"{"name": "c1", "address": "127.0.0.1:9001"}"#).unwrap();
        assert!(!req.bootstrap);
        assert!(req.join_token.is_none());
        assert!(req.init_config.is_empty());
    }
}
