//! Operator endpoints: inspect connections, push to a room, kick a user.
//!
//! Every call is charged to the caller's own `http:<user>` rate-limit window.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::auth::middleware::AdminUser;
use crate::error::{ApiError, ApiErrorBody, ErrorCode, GatewayError};
use crate::gateway::rooms::RoomId;
use crate::gateway::session::ConnectionInfo;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/admin/connections", get(list_connections))
        .route("/admin/rooms/{room}/broadcast", post(broadcast_to_room))
        .route("/admin/users/{user_id}/disconnect", post(disconnect_user))
}

async fn throttle(state: &AppState, admin: &AdminUser) -> Result<(), ApiError> {
    let subject = format!("http:{}", admin.0.user_id);
    state
        .gateway
        .limiter
        .admit_key(&subject, 1)
        .await
        .map_err(|err: GatewayError| match err.code {
            ErrorCode::RateLimitExceeded => ApiError::too_many_requests(err.message),
            _ => ApiError::internal(err.message),
        })
}

// ---------------------------------------------------------------------------
// GET /api/v1/admin/connections
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, ToSchema)]
pub struct ListConnectionsResponse {
    pub data: Vec<ConnectionInfo>,
}

#[utoipa::path(
    get,
    path = "/api/v1/admin/connections",
    tag = "Admin",
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Connections to this process", body = ListConnectionsResponse),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 403, description = "Admin role required", body = ApiErrorBody),
        (status = 429, description = "Rate limited", body = ApiErrorBody),
    ),
)]
pub async fn list_connections(
    admin: AdminUser,
    State(state): State<AppState>,
) -> Result<Json<ListConnectionsResponse>, ApiError> {
    throttle(&state, &admin).await?;
    Ok(Json(ListConnectionsResponse {
        data: state.gateway.connections(),
    }))
}

// ---------------------------------------------------------------------------
// POST /api/v1/admin/rooms/:room/broadcast
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct BroadcastRequest {
    pub event: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub data: Value,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BroadcastResponse {
    pub room: String,
    /// Local connections the event was queued for. Other processes are
    /// reached through the relay and are not counted.
    pub delivered: usize,
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/rooms/{room}/broadcast",
    tag = "Admin",
    security(("bearer" = [])),
    params(
        ("room" = String, Path, description = "Room id, e.g. `document:<id>`"),
    ),
    request_body = BroadcastRequest,
    responses(
        (status = 200, description = "Event delivered", body = BroadcastResponse),
        (status = 400, description = "Invalid room or event", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 403, description = "Admin role required", body = ApiErrorBody),
        (status = 429, description = "Rate limited", body = ApiErrorBody),
    ),
)]
pub async fn broadcast_to_room(
    admin: AdminUser,
    State(state): State<AppState>,
    Path(room): Path<String>,
    Json(body): Json<BroadcastRequest>,
) -> Result<Json<BroadcastResponse>, ApiError> {
    throttle(&state, &admin).await?;

    let room: RoomId = room
        .parse()
        .map_err(|e: crate::gateway::rooms::RoomIdError| ApiError::bad_request(e.to_string()))?;
    if body.event.trim().is_empty() {
        return Err(ApiError::bad_request("Event name must not be empty"));
    }

    let delivered = state
        .gateway
        .emit_to_room(&room, &body.event, body.data)
        .await;

    tracing::info!(admin_id = %admin.0.user_id, %room, event = %body.event, delivered, "admin broadcast");
    Ok(Json(BroadcastResponse {
        room: room.to_string(),
        delivered,
    }))
}

// ---------------------------------------------------------------------------
// POST /api/v1/admin/users/:user_id/disconnect
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, ToSchema)]
pub struct DisconnectResponse {
    /// Local connections that were signalled to close.
    pub disconnected: usize,
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/users/{user_id}/disconnect",
    tag = "Admin",
    security(("bearer" = [])),
    params(
        ("user_id" = String, Path, description = "User ID"),
    ),
    responses(
        (status = 200, description = "Connections signalled", body = DisconnectResponse),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 403, description = "Admin role required", body = ApiErrorBody),
        (status = 429, description = "Rate limited", body = ApiErrorBody),
    ),
)]
pub async fn disconnect_user(
    admin: AdminUser,
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<DisconnectResponse>, ApiError> {
    throttle(&state, &admin).await?;
    let disconnected = state
        .gateway
        .force_disconnect_user(&user_id, "Disconnected by administrator");
    tracing::info!(admin_id = %admin.0.user_id, %user_id, disconnected, "admin disconnect");
    Ok(Json(DisconnectResponse { disconnected }))
}
