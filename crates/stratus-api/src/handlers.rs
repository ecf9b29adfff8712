//! Core REST handlers.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use tracing::{info, warn};

use stratus_cluster::StartApiArgs;
use stratus_core::messages::{
    ControlRequest, HookKind, HookNewMemberRequest, HookRemoveRequest, JoinRequest,
    TokenIssueRequest, Token, TrustEntry,
};
use stratus_core::types::{validate_address, validate_fqdn, MemberInfo};
use stratus_core::{DaemonConfig, Error};
use stratus_trust::Remote;

use crate::error::{ApiError, ApiResult};
use crate::registry::ApiState;

#[derive(Debug, Default, Deserialize)]
pub struct ForceQuery {
    #[serde(default)]
    force: Option<u8>,
}

impl ForceQuery {
    fn force(&self) -> bool {
        self.force == Some(1)
    }
}

fn empty() -> Json<serde_json::Value> {
    Json(serde_json::json!({}))
}

/// `POST /core/control` — drive a local bootstrap or join.
pub async fn control_post(
    State(api): State<ApiState>,
    Json(request): Json<ControlRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if api.state.is_initialized() {
        return Err(Error::failed_precondition(
            "unable to initialize: cluster is already initialized",
        )
        .into());
    }
    if request.bootstrap && request.join_token.is_some() {
        return Err(Error::invalid_argument(
            "invalid options: both bootstrap flag and join token given",
        )
        .into());
    }
    if !request.bootstrap && request.join_token.is_none() {
        return Err(Error::invalid_argument(
            "invalid options: neither bootstrap flag nor join token given",
        )
        .into());
    }
    validate_fqdn(&request.name)?;
    validate_address(&request.address)?;

    // Reject malformed tokens before any state is touched.
    if let Some(encoded) = &request.join_token {
        Token::decode(encoded)?;
    }

    api.state.set_config(DaemonConfig {
        name: request.name.clone(),
        address: request.address.clone(),
        servers: Default::default(),
    });

    info!(name = %request.name, bootstrap = request.bootstrap, "control request accepted");
    (api.state.callbacks.start_api)(StartApiArgs {
        bootstrap: request.bootstrap,
        init_config: request.init_config,
        join_token: request.join_token,
    })
    .await?;

    Ok(empty())
}

/// `POST /core/control/tokens` — issue a join token.
pub async fn tokens_post(
    State(api): State<ApiState>,
    Json(request): Json<TokenIssueRequest>,
) -> ApiResult<Json<String>> {
    let expiry = request
        .expire_after_secs
        .map(std::time::Duration::from_secs);
    let token = api.state.issue_token(&request.name, expiry).await?;
    Ok(Json(token))
}

/// `POST /core/internal/cluster` — peer-side admission of a joiner.
pub async fn cluster_post(
    State(api): State<ApiState>,
    Json(request): Json<JoinRequest>,
) -> ApiResult<impl IntoResponse> {
    let response = api.state.admission(request).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// `GET /core/1.0/cluster` — the member table with derived state.
///
/// Never fails on peer trouble; unreachable or untrusted members are
/// reflected in their per-member state.
pub async fn cluster_get(State(api): State<ApiState>) -> ApiResult<Json<Vec<MemberInfo>>> {
    Ok(Json(api.state.member_infos().await?))
}

/// `DELETE /core/1.0/cluster/{name}` — quorum-safe removal.
pub async fn cluster_delete(
    State(api): State<ApiState>,
    Path(name): Path<String>,
    Query(query): Query<ForceQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    api.state.remove_member(&name, query.force()).await?;
    Ok(empty())
}

/// `PUT /core/internal/cluster/{name}` — wipe local state and restart
/// into the pre-init state. Sent by the remover to the removed member.
pub async fn cluster_reset_put(
    State(api): State<ApiState>,
    Path(name): Path<String>,
    Query(query): Query<ForceQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let own_name = api.state.name()?;
    if own_name != name {
        return Err(Error::invalid_argument(format!(
            "reset addressed to {name:?} but this member is {own_name:?}"
        ))
        .into());
    }

    info!(force = query.force(), "resetting cluster member");
    (api.state.callbacks.reset)(query.force()).await?;
    Ok(empty())
}

/// `POST /core/internal/truststore` — idempotently install a peer's
/// trust entry. The name doubles as the on-disk file name, so it must
/// be a well-formed FQDN.
pub async fn truststore_post(
    State(api): State<ApiState>,
    Json(entry): Json<TrustEntry>,
) -> ApiResult<Json<serde_json::Value>> {
    validate_fqdn(&entry.name)?;
    validate_address(&entry.address)?;
    api.state.trust().add(&[Remote {
        name: entry.name,
        address: entry.address,
        certificate: entry.certificate,
    }])?;
    Ok(empty())
}

/// `DELETE /core/internal/truststore/{name}` — drop a trust entry.
pub async fn truststore_delete(
    State(api): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    validate_fqdn(&name)?;
    api.state.trust().remove(&name)?;
    Ok(empty())
}

/// `GET /core/1.0/ready` — 200 once the daemon is fully up.
pub async fn ready_get(State(api): State<ApiState>) -> ApiResult<Json<serde_json::Value>> {
    if api.state.is_ready() {
        Ok(empty())
    } else {
        Err(Error::unavailable("daemon is not ready yet").into())
    }
}

/// `POST /core/internal/hooks/{kind}` — peer-triggered lifecycle hook.
pub async fn hooks_post(
    State(api): State<ApiState>,
    Path(kind): Path<String>,
    body: axum::body::Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    let kind = HookKind::parse(&kind)?;
    let hooks = api.state.hooks();

    match kind {
        HookKind::PreRemove => {
            let request: HookRemoveRequest = parse_body(&body)?;
            hooks
                .pre_remove(request.force)
                .await
                .map_err(|e| wrap_hook_err("pre-remove", e))?;
        }
        HookKind::PostRemove => {
            let request: HookRemoveRequest = parse_body(&body)?;
            hooks
                .post_remove(request.force)
                .await
                .map_err(|e| wrap_hook_err("post-remove", e))?;
        }
        HookKind::OnNewMember => {
            let request: HookNewMemberRequest = parse_body(&body)?;
            if request.new_member.name.is_empty() {
                return Err(
                    Error::invalid_argument("no member name given for the new-member hook").into(),
                );
            }
            if let Err(e) = hooks.on_new_member(&request.new_member).await {
                warn!(member = %request.new_member.name, error = %e, "on-new-member hook failed");
            }
        }
        HookKind::OnDaemonConfigUpdate => {
            let config: DaemonConfig = parse_body(&body)?;
            config.validate()?;
            config.save(api.state.state_dir())?;
            api.state.set_config(config.clone());
            if let Err(e) = hooks.on_daemon_config_update(&config).await {
                warn!(error = %e, "config-update hook failed");
            }
        }
    }

    Ok(empty())
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| Error::invalid_argument(format!("malformed hook body: {e}")).into())
}

fn wrap_hook_err(kind: &str, err: Error) -> ApiError {
    Error::new(err.kind(), format!("{kind} hook failed: {err}")).into()
}
