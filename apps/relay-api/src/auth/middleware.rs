//! Bearer token extraction for the HTTP surface.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::auth::tokens::VerifiedUser;
use crate::AppState;

/// Authenticated caller extracted from the `Authorization: Bearer <token>`
/// header.
#[derive(Debug, Clone)]
pub struct AuthUser(pub VerifiedUser);

/// Authenticated caller holding the admin role.
#[derive(Debug, Clone)]
pub struct AdminUser(pub VerifiedUser);

/// Rejection returned when the bearer token is missing, invalid, or lacks
/// the required role.
pub struct AuthError {
    status: StatusCode,
    code: &'static str,
    message: &'static str,
}

impl AuthError {
    fn unauthorized(message: &'static str) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "UNAUTHORIZED",
            message,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code,
                "message": self.message
            }
        });
        (self.status, Json(body)).into_response()
    }
}

/// Pull the bearer credential out of an `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| AuthError::unauthorized("Missing or malformed Authorization header"))?;

        let user = state
            .verifier
            .verify(token)
            .await
            .map_err(|_| AuthError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "INTERNAL_ERROR",
                message: "Token verification failed",
            })?
            .ok_or_else(|| AuthError::unauthorized("Invalid or expired token"))?;

        Ok(AuthUser(user))
    }
}

impl FromRequestParts<AppState> for AdminUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let AuthUser(user) = AuthUser::from_request_parts(parts, state).await?;
        if !user.is_admin() {
            return Err(AuthError {
                status: StatusCode::FORBIDDEN,
                code: "FORBIDDEN",
                message: "Admin role required",
            });
        }
        Ok(AdminUser(user))
    }
}
