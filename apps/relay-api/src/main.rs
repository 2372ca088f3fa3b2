use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay_api::auth::access::{AccessPolicy, MemoryAccessPolicy, RemoteAccessPolicy};
use relay_api::auth::tokens::JwtVerifier;
use relay_api::config::Config;
use relay_api::gateway::Gateway;
use relay_api::store::{MemoryStore, RedisStore, SharedStore};
use relay_api::AppState;

/// How often the in-memory store drops expired counters.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    // .env is optional; variables may come from the environment.
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    // Redis when configured (multi-instance, relay on); otherwise a single
    // process with an in-memory store.
    let (store, relay): (Arc<dyn SharedStore>, bool) = match &config.redis_url {
        Some(url) => {
            let store = RedisStore::connect(url)
                .await
                .expect("failed to connect to redis");
            (Arc::new(store), true)
        }
        None => {
            let store = Arc::new(MemoryStore::new());
            let sweeper = store.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(PURGE_INTERVAL);
                loop {
                    interval.tick().await;
                    let purged = sweeper.purge_expired();
                    if purged > 0 {
                        tracing::debug!(purged, "expired keys purged");
                    }
                }
            });
            tracing::warn!("REDIS_URL not set, running single-process with in-memory store");
            (store, false)
        }
    };

    let access: Arc<dyn AccessPolicy> = match &config.access_api_url {
        Some(url) => Arc::new(
            RemoteAccessPolicy::new(url).expect("failed to build access service client"),
        ),
        None => {
            tracing::warn!("ACCESS_API_URL not set, every room join is allowed");
            Arc::new(MemoryAccessPolicy::allow_all())
        }
    };

    let gateway = Arc::new(Gateway::new(&config, store, access, relay));
    gateway.spawn_relay();

    tracing::info!(
        server_id = %config.server_id,
        relay,
        max_events = config.rate_limit.max_events,
        window_secs = config.rate_limit.window.as_secs(),
        "relay-api configured"
    );

    let state = AppState {
        verifier: Arc::new(JwtVerifier::new(&config.jwt_secret)),
        config: Arc::new(config),
        gateway,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(relay_api::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "relay-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(?err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
