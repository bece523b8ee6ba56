use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::debug;

use streamsync_offline::QueueError;
use streamsync_protocol::{AckEntry, EventKind, MAX_QUEUE, OFFLINE_DRAIN_LIMIT, SyncMessage};

use crate::auth::{bearer_token, user_identity};
use crate::server::AppState;

// ── Error mapping ────────────────────────────────────────────────────────────

/// Ingress failure, mapped onto a status code and a stable error code.
pub enum ApiError {
    BadRequest { code: &'static str, message: String },
    Unauthorized(&'static str),
    Conflict(&'static str),
    RateLimited,
    Capacity(&'static str),
    Internal(String),
}

impl ApiError {
    fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::BadRequest {
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::BadRequest { code, message } => (StatusCode::BAD_REQUEST, code, message),
            Self::Unauthorized(message) => {
                (StatusCode::UNAUTHORIZED, "unauthorized", message.to_string())
            },
            Self::Conflict(message) => {
                (StatusCode::CONFLICT, "message_not_found", message.to_string())
            },
            Self::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "too many requests".to_string(),
            ),
            Self::Capacity(message) => {
                (StatusCode::SERVICE_UNAVAILABLE, "capacity", message.to_string())
            },
            Self::Internal(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
            },
        };
        (status, Json(json!({ "error": message, "code": code }))).into_response()
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Auth => Self::Unauthorized("ack token mismatch"),
            QueueError::NotFound => Self::Conflict("no queued message with that id"),
            QueueError::Storage(e) => Self::Internal(e.to_string()),
            QueueError::Codec(e) => Self::Internal(e.to_string()),
        }
    }
}

// ── Guards ───────────────────────────────────────────────────────────────────

fn require_service(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if !state.auth.authorize_service(bearer_token(headers)) {
        return Err(ApiError::Unauthorized("invalid service token"));
    }
    Ok(())
}

fn require_identity(headers: &HeaderMap) -> Result<String, ApiError> {
    user_identity(headers).ok_or(ApiError::Unauthorized("missing session identity"))
}

fn check_rate(state: &AppState, identity: &str) -> Result<(), ApiError> {
    if !state.ratelimit.check(identity) {
        return Err(ApiError::RateLimited);
    }
    Ok(())
}

fn parse_kind(raw: &str) -> Result<EventKind, ApiError> {
    EventKind::parse(raw).ok_or_else(|| {
        ApiError::bad_request("invalid_message_type", format!("unknown event type '{raw}'"))
    })
}

/// Caller identity for rate limiting: the resolved user when present,
/// otherwise the internal-service bucket.
fn rate_identity(headers: &HeaderMap) -> String {
    user_identity(headers).unwrap_or_else(|| "service".to_string())
}

// ── Publish endpoints ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

pub async fn publish_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<PublishRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_service(&state, &headers)?;
    check_rate(&state, &rate_identity(&headers))?;
    if req.user_id.is_empty() {
        return Err(ApiError::bad_request("missing_user_id", "user_id is required"));
    }
    let kind = parse_kind(&req.kind)?;

    let mut msg = SyncMessage::new(kind, req.user_id, req.data);
    msg.id = uuid::Uuid::new_v4().to_string();
    msg.timestamp = streamsync_protocol::now_millis();
    let message_id = msg.id.clone();

    if !state.manager.try_broadcast(msg) {
        return Err(ApiError::Capacity("broadcast channel full"));
    }
    Ok(Json(json!({ "success": true, "message_id": message_id })))
}

#[derive(Debug, Deserialize)]
pub struct BatchPublishRequest {
    #[serde(default)]
    pub user_ids: Vec<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

pub async fn batch_publish_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<BatchPublishRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_service(&state, &headers)?;
    check_rate(&state, &rate_identity(&headers))?;
    if req.user_ids.is_empty() {
        return Err(ApiError::bad_request("empty_batch", "user_ids must be non-empty"));
    }
    let kind = parse_kind(&req.kind)?;

    let mut accepted = 0;
    let mut dropped = 0;
    for user_id in &req.user_ids {
        let mut msg = SyncMessage::new(kind, user_id.clone(), req.data.clone());
        msg.id = uuid::Uuid::new_v4().to_string();
        msg.timestamp = streamsync_protocol::now_millis();
        if state.manager.try_broadcast(msg) {
            accepted += 1;
        } else {
            dropped += 1;
        }
    }
    if accepted == 0 {
        return Err(ApiError::Capacity("broadcast channel full"));
    }
    Ok(Json(json!({ "success": true, "published": accepted, "dropped": dropped })))
}

#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

pub async fn broadcast_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<BroadcastRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_service(&state, &headers)?;
    check_rate(&state, &rate_identity(&headers))?;
    let kind = parse_kind(&req.kind)?;

    let mut msg = SyncMessage::new(kind, "", req.data);
    msg.id = uuid::Uuid::new_v4().to_string();
    msg.timestamp = streamsync_protocol::now_millis();
    let message_id = msg.id.clone();

    if !state.manager.try_broadcast(msg) {
        return Err(ApiError::Capacity("broadcast channel full"));
    }
    Ok(Json(json!({ "success": true, "message_id": message_id })))
}

// ── Offline endpoints ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub limit: Option<usize>,
}

pub async fn offline_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<MessagesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = require_identity(&headers)?;
    check_rate(&state, &user_id)?;
    let limit = query.limit.unwrap_or(OFFLINE_DRAIN_LIMIT).min(MAX_QUEUE);
    let messages = state.manager.offline().pull(&user_id, limit).await?;
    Ok(Json(json!({ "count": messages.len(), "messages": messages })))
}

#[derive(Debug, Deserialize)]
pub struct AckRequest {
    pub message_id: String,
    pub ack_token: String,
}

pub async fn ack_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<AckRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = require_identity(&headers)?;
    check_rate(&state, &user_id)?;
    state
        .manager
        .offline()
        .ack(&user_id, &req.message_id, &req.ack_token)
        .await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
pub struct BatchAckRequest {
    #[serde(default)]
    pub acks: Vec<AckEntry>,
}

pub async fn batch_ack_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<BatchAckRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = require_identity(&headers)?;
    check_rate(&state, &user_id)?;
    if req.acks.is_empty() {
        return Err(ApiError::bad_request("empty_batch", "acks must be non-empty"));
    }
    let pairs: Vec<(String, String)> = req
        .acks
        .into_iter()
        .map(|a| (a.message_id, a.ack_token))
        .collect();
    let acked = state.manager.offline().batch_ack(&user_id, &pairs).await?;
    debug!(%user_id, acked, "batch ack");
    Ok(Json(json!({ "success": true, "acked": acked })))
}

pub async fn offline_count(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = require_identity(&headers)?;
    check_rate(&state, &user_id)?;
    let count = state.manager.offline().count(&user_id).await?;
    Ok(Json(json!({ "user_id": user_id, "count": count })))
}

// ── Presence & observability ─────────────────────────────────────────────────

pub async fn user_online(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    let room = state.manager.room();
    Json(json!({
        "online": room.is_online(&user_id).await,
        "connection_count": room.connection_count(&user_id).await,
    }))
}

pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.stats().await)
}

pub async fn pubsub_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.pubsub_stats())
}

pub async fn offline_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let stats = state.manager.offline().stats().await?;
    Ok(Json(stats))
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "instance_id": state.manager.instance_id(),
        "connections": state.manager.room().total_connections().await,
    }))
}
