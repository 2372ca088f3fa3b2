//! Presence lookups.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};

use crate::auth::middleware::AuthUser;
use crate::error::{ApiError, ApiErrorBody};
use crate::gateway::presence::UserPresence;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/presence/{user_id}", get(get_presence))
}

// ---------------------------------------------------------------------------
// GET /api/v1/presence/:user_id
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/presence/{user_id}",
    tag = "Presence",
    security(("bearer" = [])),
    params(
        ("user_id" = String, Path, description = "User ID"),
    ),
    responses(
        (status = 200, description = "Current presence", body = UserPresence),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
    ),
)]
pub async fn get_presence(
    AuthUser(_caller): AuthUser,
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<UserPresence>, ApiError> {
    let presence = state.gateway.presence(&user_id).await?;
    Ok(Json(UserPresence::new(&user_id, presence)))
}
