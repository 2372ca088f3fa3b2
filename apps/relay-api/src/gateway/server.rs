//! WebSocket upgrade handler and per-connection event loop.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};

use crate::auth::middleware::bearer_token;
use crate::auth::tokens::VerifiedUser;
use crate::error::{ApiError, GatewayError};
use crate::AppState;

use super::handler;
use super::session::CloseReason;
use super::{Admitted, Gateway};

pub fn router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

/// Browsers cannot set headers on a WebSocket upgrade, so the credential may
/// also ride in the query string.
#[derive(Debug, Default, Deserialize)]
pub struct HandshakeQuery {
    #[serde(default)]
    pub token: Option<String>,
}

/// Authenticate before upgrading. A rejected handshake creates no connection
/// and touches neither presence nor rate-limit state.
async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<HandshakeQuery>,
    headers: HeaderMap,
) -> Response {
    let credential = bearer_token(&headers)
        .map(str::to_string)
        .or(query.token)
        .filter(|t| !t.trim().is_empty());

    let Some(credential) = credential else {
        tracing::debug!("handshake without credential");
        return ApiError::authentication_failed().into_response();
    };

    let user = match state.verifier.verify(&credential).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            tracing::debug!("handshake with invalid credential");
            return ApiError::authentication_failed().into_response();
        }
        Err(err) => return err.into_response(),
    };

    let gateway = state.gateway.clone();
    ws.on_upgrade(move |socket| handle_connection(socket, gateway, user))
}

async fn handle_connection(socket: WebSocket, gateway: Arc<Gateway>, user: VerifiedUser) {
    let (ws_tx, mut ws_rx) = socket.split();
    let Admitted {
        connection: conn,
        outbound,
        closed,
    } = gateway.admit(user).await;

    // The writer drains the outbound queue on its own task, so a dispatch
    // waiting on the access service or the store never backs the queue up.
    let mut writer = tokio::spawn(write_loop(ws_tx, outbound, closed, conn.id.clone()));

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handler::dispatch(&gateway, &conn, text.as_str()).await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let err = GatewayError::invalid_event("Binary frames are not supported");
                        gateway.reply_error(&conn, &err, None);
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(?e, connection_id = %conn.id, "ws read error");
                        break;
                    }
                }
            }

            // Writer finished: forced close sent, or the socket is gone.
            _ = &mut writer => break,
        }
    }

    writer.abort();
    gateway.disconnect(&conn).await;
}

/// Forward queued frames to the socket until the connection is told to
/// close or the socket stops accepting writes.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Arc<str>>,
    mut closed: watch::Receiver<Option<CloseReason>>,
    connection_id: String,
) {
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if ws_tx.send(Message::Text(frame.to_string().into())).await.is_err() {
                    break;
                }
            }

            // Forced close (revoked credential, slow consumer).
            changed = closed.changed() => {
                let reason = closed.borrow_and_update().clone();
                if let (Ok(()), Some(reason)) = (changed, reason) {
                    tracing::info!(
                        %connection_id,
                        code = reason.code(),
                        reason = %reason.message(),
                        "closing connection"
                    );
                    let _ = send_close(&mut ws_tx, reason.code(), reason.message()).await;
                }
                break;
            }
        }
    }
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    code: u16,
    reason: &str,
) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
