#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use relay_api::auth::access::{AccessPolicy, MemoryAccessPolicy};
use relay_api::auth::tokens::{mint_access_token, JwtVerifier, Role};
use relay_api::config::Config;
use relay_api::gateway::Gateway;
use relay_api::store::{MemoryStore, SharedStore};
use relay_api::AppState;

pub const TEST_SECRET: &str = "relay-test-secret";

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Build an AppState over `store` and `access`, with relay optional.
pub fn state_with(
    config: Config,
    store: Arc<dyn SharedStore>,
    access: Arc<dyn AccessPolicy>,
    relay: bool,
) -> AppState {
    let gateway = Arc::new(Gateway::new(&config, store, access, relay));
    AppState {
        verifier: Arc::new(JwtVerifier::new(&config.jwt_secret)),
        config: Arc::new(config),
        gateway,
    }
}

/// In-memory state where every room join is allowed.
pub fn test_state() -> AppState {
    test_state_with(Config::local(TEST_SECRET), MemoryAccessPolicy::allow_all()).0
}

/// In-memory state with the given config and access policy. The policy is
/// returned so tests can grant and revoke.
pub fn test_state_with(config: Config, access: MemoryAccessPolicy) -> (AppState, Arc<MemoryAccessPolicy>) {
    let access = Arc::new(access);
    let state = state_with(config, Arc::new(MemoryStore::new()), access.clone(), false);
    (state, access)
}

pub fn test_app(state: AppState) -> Router {
    relay_api::routes::router().with_state(state)
}

/// Start a real TCP server for WebSocket testing. Runs in the background.
pub async fn start_ws_server(state: AppState) -> SocketAddr {
    let app = test_app(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

pub fn user_token(user_id: &str, name: &str) -> String {
    mint_access_token(TEST_SECRET, user_id, name, Role::User, 300).expect("mint token")
}

pub fn admin_token(user_id: &str) -> String {
    mint_access_token(TEST_SECRET, user_id, "Admin", Role::Admin, 300).expect("mint token")
}

/// Connect with the credential in the query string and wait for `connected`.
/// Returns the stream and the `connected` payload.
pub async fn connect(addr: SocketAddr, token: &str) -> (WsStream, Value) {
    let url = format!("ws://{addr}/gateway?token={token}");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");
    let connected = next_event(&mut ws, "connected").await;
    (ws, connected)
}

/// Connect with the credential in the `Authorization` header.
pub async fn connect_with_header(addr: SocketAddr, token: &str) -> (WsStream, Value) {
    let mut request = format!("ws://{addr}/gateway")
        .into_client_request()
        .expect("request");
    request.headers_mut().insert(
        http::header::AUTHORIZATION,
        format!("Bearer {token}").parse().unwrap(),
    );
    let (mut ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("ws connect");
    let connected = next_event(&mut ws, "connected").await;
    (ws, connected)
}

pub async fn send_event(ws: &mut WsStream, event: &str, d: Value) {
    let frame = serde_json::json!({ "t": event, "d": d });
    ws.send(tungstenite::Message::Text(frame.to_string().into()))
        .await
        .expect("send event");
}

/// Next frame from the server, as JSON. Panics after 5 seconds.
pub async fn next_frame(ws: &mut WsStream) -> Value {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for frame")
            .expect("stream ended")
            .expect("ws read error");
        match msg {
            tungstenite::Message::Text(text) => {
                return serde_json::from_str(&text).expect("parse frame");
            }
            tungstenite::Message::Close(frame) => panic!("connection closed: {frame:?}"),
            _ => continue,
        }
    }
}

/// Skip frames until one named `event` arrives; returns its payload.
pub async fn next_event(ws: &mut WsStream, event: &str) -> Value {
    loop {
        let frame = next_frame(ws).await;
        if frame["t"] == event {
            return frame["d"].clone();
        }
    }
}

/// Wait for the server's close frame and return its code.
pub async fn next_close_code(ws: &mut WsStream) -> u16 {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for close")
            .expect("stream ended")
            .expect("ws read error");
        if let tungstenite::Message::Close(frame) = msg {
            return frame.map(|f| u16::from(f.code)).unwrap_or(1005);
        }
    }
}

/// Poll `check` until it holds. Panics after 5 seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(time::Instant::now() < deadline, "condition not reached in time");
        time::sleep(Duration::from_millis(20)).await;
    }
}
