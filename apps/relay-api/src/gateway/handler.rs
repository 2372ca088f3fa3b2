//! Inbound event dispatch.
//!
//! Every inbound frame is charged to the rate limiter before anything else.
//! Failures become an in-band `error` event; none of them close the
//! connection.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::error::GatewayError;

use super::events::{
    ClientMessage, DocumentBatch, DocumentRef, DocumentUpdatePayload, EventName, ExecutionRef,
    NotificationAckPayload, PresenceAction, PresenceUpdatePayload, StreamRef,
};
use super::fanout::{Envelope, Target};
use super::rooms::{JoinOutcome, RoomId, RoomIdError};
use super::session::Connection;
use super::Gateway;

/// Handle one text frame from `conn`.
pub async fn dispatch(gw: &Gateway, conn: &Arc<Connection>, text: &str) {
    let parsed = serde_json::from_str::<ClientMessage>(text);
    let name = parsed.as_ref().ok().map(|m| m.t.clone());

    if let Err(err) = gw.limiter.admit(conn, 1).await {
        gw.reply_error(conn, &err, name.as_deref());
        return;
    }

    let msg = match parsed {
        Ok(msg) => msg,
        Err(_) => {
            gw.reply_error(conn, &GatewayError::invalid_event("Malformed frame"), None);
            return;
        }
    };

    if let Err(err) = handle(gw, conn, &msg.t, msg.d).await {
        tracing::debug!(
            connection_id = %conn.id,
            event = %msg.t,
            code = ?err.code,
            "event rejected"
        );
        gw.reply_error(conn, &err, Some(&msg.t));
    }
}

async fn handle(gw: &Gateway, conn: &Arc<Connection>, event: &str, d: Value) -> Result<(), GatewayError> {
    match event {
        EventName::JOIN_DOCUMENT => {
            let p: DocumentRef = payload(d)?;
            join_document(gw, conn, &p.document_id).await
        }
        EventName::JOIN_DOCUMENTS => {
            let p: DocumentBatch = payload(d)?;
            join_documents(gw, conn, p.document_ids).await
        }
        EventName::LEAVE_DOCUMENT => {
            let p: DocumentRef = payload(d)?;
            leave_document(gw, conn, &p.document_id).await
        }
        EventName::DOCUMENT_UPDATE => {
            let p: DocumentUpdatePayload = payload(d)?;
            document_update(gw, conn, p).await
        }
        EventName::PRESENCE_UPDATE => {
            let p: PresenceUpdatePayload = payload(d)?;
            presence_update(gw, conn, p).await
        }
        EventName::NOTIFICATION_ACK => {
            let p: NotificationAckPayload = payload(d)?;
            gw.emit(
                Envelope::new(
                    EventName::NOTIFICATION_ACKED,
                    json!({ "notificationId": p.notification_id }),
                    Target::User(conn.user.user_id.clone()),
                )
                .excluding(&conn.id),
            )
            .await;
            Ok(())
        }
        EventName::SUBSCRIBE_AI_STREAM => {
            let p: StreamRef = payload(d)?;
            subscribe(gw, conn, room(RoomId::new("ai-stream", &p.stream_id))?).await
        }
        EventName::UNSUBSCRIBE_AI_STREAM => {
            let p: StreamRef = payload(d)?;
            unsubscribe(gw, conn, room(RoomId::new("ai-stream", &p.stream_id))?);
            Ok(())
        }
        EventName::SUBSCRIBE_TOOL_EXECUTION => {
            let p: ExecutionRef = payload(d)?;
            subscribe(gw, conn, room(RoomId::new("tool-execution", &p.execution_id))?).await
        }
        EventName::UNSUBSCRIBE_TOOL_EXECUTION => {
            let p: ExecutionRef = payload(d)?;
            unsubscribe(gw, conn, room(RoomId::new("tool-execution", &p.execution_id))?);
            Ok(())
        }
        // Nothing beyond the rate-limit unit already charged.
        EventName::PING => Ok(()),
        other => Err(GatewayError::invalid_event(format!("Unknown event `{other}`"))),
    }
}

fn payload<T: DeserializeOwned>(d: Value) -> Result<T, GatewayError> {
    serde_json::from_value(d).map_err(|e| GatewayError::invalid_event(format!("Malformed payload: {e}")))
}

fn room(parsed: Result<RoomId, RoomIdError>) -> Result<RoomId, GatewayError> {
    parsed.map_err(|e| GatewayError::invalid_event(e.to_string()))
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

async fn join_document(gw: &Gateway, conn: &Arc<Connection>, document_id: &str) -> Result<(), GatewayError> {
    let room = room(RoomId::document(document_id))?;
    match gw.rooms.join(conn, room.clone()).await? {
        JoinOutcome::Denied => Err(GatewayError::forbidden("Access to document denied")),
        JoinOutcome::AlreadyMember => {
            gw.reply(conn, EventName::ROOM_JOINED, json!({ "room": room }));
            Ok(())
        }
        JoinOutcome::Joined => {
            gw.reply(conn, EventName::ROOM_JOINED, json!({ "room": room }));
            announce_enter(gw, conn, room, document_id).await;
            Ok(())
        }
    }
}

async fn join_documents(
    gw: &Gateway,
    conn: &Arc<Connection>,
    document_ids: Vec<String>,
) -> Result<(), GatewayError> {
    let mut joined = Vec::new();
    let mut denied = Vec::new();
    let mut rooms = Vec::new();

    for id in document_ids {
        match RoomId::document(&id) {
            Ok(room) => rooms.push(room),
            Err(_) => denied.push(id),
        }
    }

    for (room, outcome) in gw.rooms.join_many(conn, rooms).await {
        let document_id = room.entity_id().to_string();
        match outcome {
            Ok(JoinOutcome::Joined) => {
                announce_enter(gw, conn, room, &document_id).await;
                joined.push(document_id);
            }
            Ok(JoinOutcome::AlreadyMember) => joined.push(document_id),
            Ok(JoinOutcome::Denied) => denied.push(document_id),
            Err(err) => {
                tracing::error!(code = %err.code, %room, "access check failed during batch join");
                denied.push(document_id);
            }
        }
    }

    gw.reply(conn, EventName::ROOMS_JOINED, json!({ "joined": joined, "denied": denied }));
    Ok(())
}

async fn leave_document(gw: &Gateway, conn: &Arc<Connection>, document_id: &str) -> Result<(), GatewayError> {
    let room = room(RoomId::document(document_id))?;
    let was_member = gw.rooms.leave(conn, &room);
    gw.reply(conn, EventName::ROOM_LEFT, json!({ "room": room }));
    if was_member {
        announce_exit(gw, conn, room, document_id).await;
    }
    Ok(())
}

/// Relay an edit to the other members verbatim. Ordering, merging and
/// version checks are left to the document service.
async fn document_update(
    gw: &Gateway,
    conn: &Arc<Connection>,
    p: DocumentUpdatePayload,
) -> Result<(), GatewayError> {
    let room = room(RoomId::document(&p.document_id))?;
    if !conn.in_room(&room) {
        return Err(GatewayError::forbidden("Join the document before editing it"));
    }
    if !gw.rooms.authorize(&conn.user.user_id, &room).await? {
        return Err(GatewayError::forbidden("Access to document denied"));
    }

    gw.emit(
        Envelope::new(
            EventName::DOCUMENT_UPDATED,
            json!({
                "documentId": p.document_id,
                "changes": p.changes,
                "userId": conn.user.user_id,
                "version": p.version,
            }),
            Target::Room(room),
        )
        .excluding(&conn.id),
    )
    .await;
    Ok(())
}

async fn presence_update(
    gw: &Gateway,
    conn: &Arc<Connection>,
    p: PresenceUpdatePayload,
) -> Result<(), GatewayError> {
    let room = room(RoomId::document(&p.document_id))?;
    match p.action {
        PresenceAction::Join if conn.in_room(&room) => {
            announce_enter(gw, conn, room, &p.document_id).await;
            Ok(())
        }
        PresenceAction::Join => join_document(gw, conn, &p.document_id).await,
        PresenceAction::Leave => {
            announce_exit(gw, conn, room, &p.document_id).await;
            Ok(())
        }
    }
}

/// Record the connection as viewing and tell the others if the user is new.
async fn announce_enter(gw: &Gateway, conn: &Arc<Connection>, room: RoomId, document_id: &str) {
    if !gw.documents.enter(document_id, &conn.user.user_id, &conn.id) {
        return;
    }
    gw.emit(
        Envelope::new(
            EventName::USER_JOINED,
            json!({
                "userId": conn.user.user_id,
                "name": conn.user.name,
                "documentId": document_id,
            }),
            Target::Room(room),
        )
        .excluding(&conn.id),
    )
    .await;
}

/// Drop the connection from the viewers and tell the others once the user
/// has no connection left on the document.
async fn announce_exit(gw: &Gateway, conn: &Arc<Connection>, room: RoomId, document_id: &str) {
    if !gw.documents.exit(document_id, &conn.user.user_id, &conn.id) {
        return;
    }
    gw.emit(
        Envelope::new(
            EventName::USER_LEFT,
            json!({ "userId": conn.user.user_id, "documentId": document_id }),
            Target::Room(room),
        )
        .excluding(&conn.id),
    )
    .await;
}

// ---------------------------------------------------------------------------
// Streams and tool executions
// ---------------------------------------------------------------------------

async fn subscribe(gw: &Gateway, conn: &Arc<Connection>, room: RoomId) -> Result<(), GatewayError> {
    match gw.rooms.join(conn, room.clone()).await? {
        JoinOutcome::Denied => Err(GatewayError::forbidden(format!("Access to {} denied", room.kind()))),
        JoinOutcome::Joined | JoinOutcome::AlreadyMember => {
            gw.reply(conn, EventName::SUBSCRIBED, json!({ "room": room }));
            Ok(())
        }
    }
}

fn unsubscribe(gw: &Gateway, conn: &Arc<Connection>, room: RoomId) {
    gw.rooms.leave(conn, &room);
    gw.reply(conn, EventName::UNSUBSCRIBED, json!({ "room": room }));
}
