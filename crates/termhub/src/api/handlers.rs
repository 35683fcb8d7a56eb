//! Handlers for the request/response surface.
//!
//! These perform the same operations as the persistent channel but only
//! return fully buffered results.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
};
use serde::de::DeserializeOwned;
use termhub_protocol::http::{
    CreateSessionRequest, CreateSessionResponse, DEVICE_ID_HEADER, ExecuteCommandRequest,
    ExecuteCommandResponse, HealthResponse, MessageResponse, SESSION_ID_HEADER,
    SessionInfoResponse, SlotSummary,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::pool::ContainerPool;
use crate::session::Session;

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_sessions: state.registry().active_count(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub(super) fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn session_id(headers: &HeaderMap) -> ApiResult<&str> {
    header(headers, SESSION_ID_HEADER).ok_or_else(|| ApiError::unauthorized("Session ID required"))
}

/// Parse an optional JSON body; an empty body yields the default.
pub(super) fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("Invalid JSON body: {e}")))
}

fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Create a session.
///
/// POST /create-session
#[instrument(skip(state, headers, body))]
pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<CreateSessionResponse>> {
    let request: CreateSessionRequest = parse_body(&body)?;
    let session = state
        .registry()
        .create(request.user_id.as_deref(), header(&headers, DEVICE_ID_HEADER))
        .await?;

    info!(session_id = %session.id, user_id = %session.user_id, "Created session");
    Ok(Json(CreateSessionResponse {
        expires_in: millis(state.registry().expires_in(&session)),
        session_id: session.id,
        user_id: session.user_id,
    }))
}

/// Run a command and return its buffered output.
///
/// POST /execute-command
#[instrument(skip(state, headers, body))]
pub async fn execute_command(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<([(&'static str, String); 1], Json<ExecuteCommandResponse>)> {
    let request: ExecuteCommandRequest = serde_json::from_slice(&body)
        .map_err(|_| ApiError::bad_request("Command is required"))?;

    let session = match header(&headers, SESSION_ID_HEADER) {
        Some(session_id) => state.registry().touch(session_id).await?,
        None => device_session(&state, &headers).await?,
    };
    let outcome = state
        .executor()
        .execute(&session, &request.command, None, CancellationToken::new())
        .await?;
    let _ = state.registry().touch(&session.id).await;
    let session_header = [(SESSION_ID_HEADER, session.id)];

    let exit_code = outcome.exit_code();
    if exit_code != 0 {
        let message = if outcome.output.trim().is_empty() {
            format!("Command failed with exit code {exit_code}")
        } else {
            outcome.output
        };
        return Err(ApiError::CommandFailed { message, exit_code });
    }

    Ok((
        session_header,
        Json(ExecuteCommandResponse {
            output: outcome.output,
            exit_code,
        }),
    ))
}

/// Session for a caller that sent no session id: without an API key, the
/// `X-Device-Id` header picks (or starts) the device's session.
async fn device_session(state: &AppState, headers: &HeaderMap) -> ApiResult<Session> {
    let device = match (&state.api_key, header(headers, DEVICE_ID_HEADER)) {
        (None, Some(device)) => device,
        _ => return Err(ApiError::unauthorized("Session ID required")),
    };
    let session = state.registry().session_for_device(device).await?;
    info!(session_id = %session.id, user_id = %session.user_id, "Using device session");
    Ok(session)
}

/// Describe the caller's session.
///
/// GET /session
pub async fn get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<SessionInfoResponse>> {
    let session = state.registry().get(session_id(&headers)?).await?;
    Ok(Json(SessionInfoResponse {
        expires_in: millis(state.registry().expires_in(&session)),
        user_id: session.user_id,
        created: session.created_at.to_rfc3339(),
        last_accessed: session.last_active_at.to_rfc3339(),
    }))
}

/// End the caller's session. Always succeeds.
///
/// DELETE /session
pub async fn delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Json<MessageResponse> {
    let message = match header(&headers, SESSION_ID_HEADER) {
        Some(session_id) if state.gateway.end_session(session_id).await => "Session ended",
        _ => "No active session",
    };
    Json(MessageResponse {
        message: message.to_string(),
    })
}

fn pool(state: &AppState) -> ApiResult<std::sync::Arc<ContainerPool>> {
    let backend = state.registry().backend();
    backend
        .pool()
        .ok_or_else(|| ApiError::not_found(format!("The {} backend has no container pool", backend.kind())))
}

/// List container slots.
///
/// GET /pool
pub async fn list_pool(State(state): State<AppState>) -> ApiResult<Json<Vec<SlotSummary>>> {
    let slots = pool(&state)?
        .slots()
        .into_iter()
        .map(|slot| SlotSummary {
            container_id: slot.container_id,
            state: slot.state.to_string(),
            load: slot.load,
            capacity: slot.capacity,
            accounts: slot.current_user_count,
        })
        .collect();
    Ok(Json(slots))
}

/// Stop placing users on a slot and remove it once idle.
///
/// POST /pool/{container_id}/drain
#[instrument(skip(state))]
pub async fn drain_slot(
    State(state): State<AppState>,
    Path(container_id): Path<String>,
) -> ApiResult<Json<MessageResponse>> {
    pool(&state)?.drain_slot(&container_id).await?;
    Ok(Json(MessageResponse {
        message: format!("Container {container_id} drained"),
    }))
}

/// Re-provision a failed slot.
///
/// POST /pool/{container_id}/recover
#[instrument(skip(state))]
pub async fn recover_slot(
    State(state): State<AppState>,
    Path(container_id): Path<String>,
) -> ApiResult<Json<MessageResponse>> {
    pool(&state)?.recover_slot(&container_id).await?;
    Ok(Json(MessageResponse {
        message: format!("Container {container_id} recovered"),
    }))
}
