pub mod admin;
pub mod health;
pub mod presence;

use axum::Router;
use utoipa::openapi::security::{Http, HttpAuthScheme, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(crate::gateway::server::router())
        .nest("/api/v1", presence::router().merge(admin::router()))
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        presence::get_presence,
        admin::list_connections,
        admin::broadcast_to_room,
        admin::disconnect_user,
    ),
    components(
        schemas(
            crate::error::ApiErrorBody,
            crate::error::ApiErrorDetail,
            crate::gateway::presence::UserPresence,
            crate::gateway::session::ConnectionInfo,
            crate::gateway::session::ConnectionState,
            health::HealthResponse,
            admin::ListConnectionsResponse,
            admin::BroadcastRequest,
            admin::BroadcastResponse,
            admin::DisconnectResponse,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Health check"),
        (name = "Presence", description = "User presence"),
        (name = "Admin", description = "Operator tooling"),
    )
)]
pub struct ApiDoc;
