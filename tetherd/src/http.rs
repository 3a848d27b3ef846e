//! HTTP surface of the backend daemon.
//!
//! Four agent/pairing routes from the core contract plus the adapter surface
//! that queues commands and picks results up. Agent routes authenticate with
//! the bearer key issued at claim time; adapter routes with the shared
//! adapter token.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tether_contract::{Command, CommandEnvelope, CommandResult, CodedError, ErrorCode};
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::auth::{adapter_authorized, bearer_token};
use crate::pairing::{KeyGrade, PairingService};
use crate::queue::{CommandQueue, MAX_POLL_WAIT};

pub struct AppState {
    pub pairing: PairingService,
    pub queue: CommandQueue,
    pub adapter_token: Option<String>,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Coded(StatusCode, CodedError),
    Internal(anyhow::Error),
}

impl ApiError {
    fn from_coded(err: CodedError) -> Self {
        let status = match err.code {
            ErrorCode::PairingExpired => StatusCode::GONE,
            ErrorCode::PairingReused => StatusCode::CONFLICT,
            ErrorCode::AuthUnauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::AgentNotPaired => StatusCode::NOT_FOUND,
            ErrorCode::Internal | ErrorCode::InternalTimeout => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        };
        ApiError::Coded(status, err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": ErrorCode::AuthUnauthorized })),
            )
                .into_response(),
            ApiError::Coded(status, err) => (
                status,
                Json(json!({ "error": err.code, "detail": err.detail })),
            )
                .into_response(),
            ApiError::Internal(err) => {
                tracing::error!("HTTP surface error: {:#}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": ErrorCode::Internal })),
                )
                    .into_response()
            }
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/pair/start", post(pair_start))
        .route("/pair/claim", post(pair_claim))
        .route("/poll", get(poll))
        .route("/result", post(result))
        .route("/commands", post(enqueue_command))
        .route("/commands/:command_id/result", get(command_result))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PairStartRequest {
    telegram_user_id: i64,
}

#[derive(Debug, Serialize)]
struct PairStartResponse {
    pairing_code: String,
    expires_at: DateTime<Utc>,
}

async fn pair_start(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<PairStartRequest>,
) -> Result<Json<PairStartResponse>, ApiError> {
    if !adapter_authorized(&headers, state.adapter_token.as_deref()) {
        return Err(ApiError::Unauthorized);
    }
    let (pairing_code, expires_at) = state
        .pairing
        .start_pairing(request.telegram_user_id, Utc::now())
        .await;
    Ok(Json(PairStartResponse {
        pairing_code,
        expires_at,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PairClaimRequest {
    pairing_code: String,
    device_info: String,
}

#[derive(Debug, Serialize)]
struct PairClaimResponse {
    agent_id: String,
    agent_key: String,
}

async fn pair_claim(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PairClaimRequest>,
) -> Result<Json<PairClaimResponse>, ApiError> {
    let record = state
        .pairing
        .claim_pairing(&request.pairing_code, &request.device_info, Utc::now())
        .await
        .map_err(ApiError::from_coded)?;
    Ok(Json(PairClaimResponse {
        agent_id: record.agent_id,
        agent_key: record.agent_key,
    }))
}

#[derive(Debug, Deserialize)]
struct PollParams {
    #[serde(default)]
    timeout_seconds: Option<u64>,
}

async fn poll(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<PollParams>,
) -> Result<Response, ApiError> {
    let agent_id = authenticate_agent(&state, &headers, KeyGrade::Active).await?;

    let wait = std::time::Duration::from_secs(params.timeout_seconds.unwrap_or(25))
        .min(MAX_POLL_WAIT);

    match state.queue.poll(&agent_id, wait).await {
        Some(command) => Ok((StatusCode::OK, Json(command)).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn result(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(result): Json<CommandResult>,
) -> Result<Json<serde_json::Value>, ApiError> {
    // Draining keys may still post results for inflight work.
    let agent_id = authenticate_agent(&state, &headers, KeyGrade::Draining).await?;
    state.queue.complete(&agent_id, result.clamped()).await;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EnqueueRequest {
    telegram_user_id: i64,
    command: CommandEnvelope,
}

async fn enqueue_command(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<EnqueueRequest>,
) -> Result<Response, ApiError> {
    if !adapter_authorized(&headers, state.adapter_token.as_deref()) {
        return Err(ApiError::Unauthorized);
    }

    // Validate before any side effect so a malformed command never occupies
    // the queue.
    Command::parse(&request.command).map_err(ApiError::from_coded)?;

    let agent_id = state
        .pairing
        .active_agent_for_user(request.telegram_user_id)
        .await
        .ok_or_else(|| {
            ApiError::from_coded(CodedError::new(
                ErrorCode::AgentNotPaired,
                "user has no active paired agent",
            ))
        })?;

    let command_id = request.command.command_id.clone();
    state.queue.enqueue(&agent_id, request.command).await;
    Ok((StatusCode::ACCEPTED, Json(json!({ "command_id": command_id }))).into_response())
}

#[derive(Debug, Deserialize)]
struct ResultLookupParams {
    telegram_user_id: i64,
}

async fn command_result(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(command_id): Path<String>,
    Query(params): Query<ResultLookupParams>,
) -> Result<Response, ApiError> {
    if !adapter_authorized(&headers, state.adapter_token.as_deref()) {
        return Err(ApiError::Unauthorized);
    }

    let agent_ids = state
        .pairing
        .agent_ids_for_user(params.telegram_user_id)
        .await;
    if agent_ids.is_empty() {
        return Err(ApiError::from_coded(CodedError::new(
            ErrorCode::AgentNotPaired,
            "user has no paired agent",
        )));
    }

    // A result drained under a superseded key sits under the old agent id;
    // check those channels too.
    for agent_id in &agent_ids {
        if let Some(result) = state.queue.result(agent_id, &command_id).await {
            return Ok((StatusCode::OK, Json(result)).into_response());
        }
    }
    Ok(StatusCode::NOT_FOUND.into_response())
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Resolve the bearer key to an agent id. `minimum` is the weakest grade the
/// route accepts: `Active` routes reject draining keys, `Draining` routes
/// accept both.
async fn authenticate_agent(
    state: &AppState,
    headers: &HeaderMap,
    minimum: KeyGrade,
) -> Result<String, ApiError> {
    let token = bearer_token(headers).ok_or(ApiError::Unauthorized)?;
    let (agent_id, grade) = state
        .pairing
        .authenticate(token, Utc::now())
        .await
        .map_err(ApiError::from_coded)?;

    if grade == KeyGrade::Draining && minimum == KeyGrade::Active {
        debug!(agent_id = %agent_id, "Draining key rejected for poll-grade route");
        return Err(ApiError::Unauthorized);
    }
    Ok(agent_id)
}
