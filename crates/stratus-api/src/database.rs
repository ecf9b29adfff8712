//! The database endpoint: replication-stream upgrade and the
//! fence wake-up.

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use hyper_util::rt::TokioIo;
use tracing::{debug, warn};

use stratus_core::messages::{
    DATABASE_PROTOCOL_VERSION, DATABASE_UPGRADE_PROTOCOL, DATABASE_VERSION_HEADER,
};
use stratus_core::Error;

use crate::error::{ApiError, ApiResult};
use crate::registry::ApiState;

/// Parse the peer's wire-protocol version header. A missing header
/// means a pre-1.0 peer.
fn peer_version(request: &Request) -> Result<u32, ApiError> {
    let raw = match request.headers().get(DATABASE_VERSION_HEADER) {
        Some(value) => value
            .to_str()
            .map_err(|_| Error::invalid_argument("invalid replication version header"))?,
        None => "0",
    };

    raw.parse::<u32>()
        .map_err(|e| Error::invalid_argument(format!("invalid replication version: {e}")).into())
}

/// `POST /core/internal/database` — upgrade the connection to a raw
/// replication stream and hand it to the engine.
///
/// Answers `426 Upgrade Required` when the peer's version is stale,
/// `400` for a missing or wrong upgrade header, and `101 Switching
/// Protocols` on success.
pub async fn database_post(
    State(api): State<ApiState>,
    mut request: Request,
) -> Result<Response, ApiError> {
    let version = peer_version(&request)?;
    if version < DATABASE_PROTOCOL_VERSION {
        return Err(Error::upgrade_required(format!(
            "replication protocol {version} is older than ours ({DATABASE_PROTOCOL_VERSION})"
        ))
        .into());
    }

    let upgrade_header = request
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok());
    if upgrade_header != Some(DATABASE_UPGRADE_PROTOCOL) {
        return Err(Error::invalid_argument("missing or invalid upgrade header").into());
    }

    let on_upgrade = request
        .extensions_mut()
        .remove::<hyper::upgrade::OnUpgrade>()
        .ok_or_else(|| Error::invalid_argument("connection does not support upgrades"))?;

    let attach = api.state.callbacks.attach_stream.clone();
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                debug!("replication stream attached");
                if let Err(e) = attach(Box::new(TokioIo::new(upgraded))) {
                    warn!(error = %e, "replication stream rejected");
                }
            }
            Err(e) => warn!(error = %e, "replication upgrade failed"),
        }
    });

    Ok((
        StatusCode::SWITCHING_PROTOCOLS,
        [
            (header::UPGRADE, DATABASE_UPGRADE_PROTOCOL),
            (header::CONNECTION, "Upgrade"),
        ],
    )
        .into_response())
}

/// `PATCH /core/internal/database` — wake a fence waiting for peers
/// to upgrade. Nothing waiting is fine.
pub async fn database_patch(
    State(api): State<ApiState>,
    request: Request,
) -> ApiResult<Json<serde_json::Value>> {
    peer_version(&request)?;

    if let Ok(db) = api.state.db() {
        db.notify_upgraded();
    }

    Ok(Json(serde_json::json!({})))
}
