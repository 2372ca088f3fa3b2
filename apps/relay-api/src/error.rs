use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

/// Structured API error returned to clients.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
}

/// Application-level error type that converts into an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "BAD_REQUEST".to_string(),
            message: message.into(),
        }
    }

    /// Handshake rejection. The message is stable so clients can match on it.
    pub fn authentication_failed() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: ErrorCode::AuthenticationFailed.as_str().to_string(),
            message: "Authentication failed".to_string(),
        }
    }

    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            code: ErrorCode::RateLimitExceeded.as_str().to_string(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL_ERROR".to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: ApiErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        tracing::error!(?err, "shared store error");
        Self::internal("An internal error occurred")
    }
}

// ---------------------------------------------------------------------------
// In-band gateway errors
// ---------------------------------------------------------------------------

/// Stable error codes carried by the in-band `error` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthenticationFailed,
    Forbidden,
    RateLimitExceeded,
    InvalidEvent,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthenticationFailed => "AUTHENTICATION_FAILED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::InvalidEvent => "INVALID_EVENT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// A non-terminal failure while handling an inbound event. Sent back to the
/// originating connection as an `error` event; the connection stays open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayError {
    pub code: ErrorCode,
    pub message: String,
}

impl GatewayError {
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Forbidden,
            message: message.into(),
        }
    }

    pub fn rate_limited() -> Self {
        Self {
            code: ErrorCode::RateLimitExceeded,
            message: "Too many events, slow down".to_string(),
        }
    }

    pub fn invalid_event(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidEvent,
            message: message.into(),
        }
    }

    pub fn internal() -> Self {
        Self {
            code: ErrorCode::InternalError,
            message: "An internal error occurred".to_string(),
        }
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        tracing::error!(?err, "shared store error");
        Self::internal()
    }
}

impl From<ApiError> for GatewayError {
    fn from(err: ApiError) -> Self {
        tracing::error!(code = %err.code, message = %err.message, "collaborator call failed");
        Self::internal()
    }
}

// ---------------------------------------------------------------------------
// Shared store errors
// ---------------------------------------------------------------------------

/// Failures from the shared key-value / pub-sub substrate.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("corrupt value under {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}
