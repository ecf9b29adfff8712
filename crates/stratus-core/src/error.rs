//! Error taxonomy shared across the stratus crates.
//!
//! Every fallible operation in the library resolves to an [`Error`]
//! carrying one of a small set of [`ErrorKind`]s. The kind determines
//! the HTTP status code on the REST surface, and peer-to-peer calls
//! reconstruct the remote kind from the wire body so callers see the
//! remote failure verbatim.

use serde::{Deserialize, Serialize};

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a failure, mapped onto HTTP statuses at the REST
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input: bad FQDN, unparseable address, unknown hook kind.
    InvalidArgument,
    /// TLS peer is not in the trust set, or the Host header is wrong.
    Unauthorized,
    /// Member, token, or endpoint does not exist.
    NotFound,
    /// Duplicate name or address, or a token that was already redeemed.
    Conflict,
    /// Operation attempted in the wrong state.
    FailedPrecondition,
    /// Database not ready or replication leader lost.
    Unavailable,
    /// The caller's version is behind ours.
    UpgradeRequired,
    /// Everything else.
    Internal,
}

impl ErrorKind {
    /// HTTP status code used when rendering this kind on the wire.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::InvalidArgument => 400,
            ErrorKind::Unauthorized => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::FailedPrecondition => 412,
            ErrorKind::Unavailable => 503,
            ErrorKind::UpgradeRequired => 426,
            ErrorKind::Internal => 500,
        }
    }

    /// Inverse of [`ErrorKind::http_status`], defaulting to Internal.
    pub fn from_http_status(code: u16) -> Self {
        match code {
            400 => ErrorKind::InvalidArgument,
            401 | 403 => ErrorKind::Unauthorized,
            404 => ErrorKind::NotFound,
            409 => ErrorKind::Conflict,
            412 => ErrorKind::FailedPrecondition,
            503 => ErrorKind::Unavailable,
            426 => ErrorKind::UpgradeRequired,
            _ => ErrorKind::Internal,
        }
    }
}

/// An error with a kind and a human-readable message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FailedPrecondition, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    pub fn upgrade_required(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpgradeRequired, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Render the wire body used by every REST error response.
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            r#type: "error".to_string(),
            error: self.message.clone(),
            code: self.kind.http_status(),
        }
    }

    /// Rebuild an error from a wire body received from a peer.
    pub fn from_body(body: &ErrorBody) -> Self {
        Self::new(ErrorKind::from_http_status(body.code), body.error.clone())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::internal(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::internal(format!("json: {err}"))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::internal(format!("yaml: {err}"))
    }
}

/// JSON error body: `{"type": "error", "error": msg, "code": int}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub r#type: String,
    pub error: String,
    pub code: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_status_roundtrip() {
        for kind in [
            ErrorKind::InvalidArgument,
            ErrorKind::Unauthorized,
            ErrorKind::NotFound,
            ErrorKind::Conflict,
            ErrorKind::FailedPrecondition,
            ErrorKind::Unavailable,
            ErrorKind::UpgradeRequired,
            ErrorKind::Internal,
        ] {
            assert_eq!(ErrorKind::from_http_status(kind.http_status()), kind);
        }
    }

    #[test]
    fn wire_body_preserves_kind_and_message() {
        let err = Error::conflict("cluster member \"c1\" already exists");
        let body = err.to_body();
        assert_eq!(body.r#type, "error");
        assert_eq!(body.code, 409);

        let back = Error::from_body(&body);
        assert_eq!(back.kind(), ErrorKind::Conflict);
        assert_eq!(back.message(), err.message());
    }

    #[test]
    fn unknown_status_maps_to_internal() {
        assert_eq!(ErrorKind::from_http_status(418), ErrorKind::Internal);
    }
}
