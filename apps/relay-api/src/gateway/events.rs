//! Gateway event names and wire-format messages.
//!
//! Every frame in either direction is a JSON object `{"t": <event>, "d": <payload>}`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

// ---------------------------------------------------------------------------
// Server → Client message
// ---------------------------------------------------------------------------

/// A message sent from the server to the client over WebSocket.
#[derive(Debug, Clone, Serialize)]
pub struct ServerMessage {
    pub t: String,
    pub d: Value,
}

impl ServerMessage {
    pub fn event(name: &str, data: Value) -> Self {
        Self {
            t: name.to_string(),
            d: data,
        }
    }

    /// Build an in-band `error` event. `event` names the inbound event that
    /// failed, when known.
    pub fn error(err: &GatewayError, event: Option<&str>) -> Self {
        let mut d = serde_json::json!({
            "code": err.code,
            "message": err.message,
        });
        if let Some(event) = event {
            d["event"] = Value::String(event.to_string());
        }
        Self::event(EventName::ERROR, d)
    }

    /// Serialize once; the frame is shared by every recipient of a fan-out.
    pub fn to_frame(&self) -> Arc<str> {
        // Serializing a String key and a serde_json::Value cannot fail.
        Arc::from(serde_json::to_string(self).unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Client → Server message
// ---------------------------------------------------------------------------

/// A message received from the client over WebSocket.
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    pub t: String,
    #[serde(default)]
    pub d: Value,
}

// ---------------------------------------------------------------------------
// Inbound payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRef {
    pub document_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentBatch {
    pub document_ids: Vec<String>,
}

/// An edit relayed verbatim. `changes` and `version` are opaque here.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentUpdatePayload {
    pub document_id: String,
    pub changes: Value,
    #[serde(default)]
    pub version: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceAction {
    Join,
    Leave,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdatePayload {
    pub document_id: String,
    pub action: PresenceAction,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationAckPayload {
    pub notification_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRef {
    pub stream_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRef {
    pub execution_id: String,
}

// ---------------------------------------------------------------------------
// Event names
// ---------------------------------------------------------------------------

/// Event names used on the wire, both directions.
pub struct EventName;

impl EventName {
    // Inbound.
    pub const JOIN_DOCUMENT: &'static str = "join:document";
    pub const JOIN_DOCUMENTS: &'static str = "join:documents";
    pub const LEAVE_DOCUMENT: &'static str = "leave:document";
    pub const DOCUMENT_UPDATE: &'static str = "document:update";
    pub const PRESENCE_UPDATE: &'static str = "presence:update";
    pub const NOTIFICATION_ACK: &'static str = "notification:ack";
    pub const SUBSCRIBE_AI_STREAM: &'static str = "subscribe:ai-stream";
    pub const UNSUBSCRIBE_AI_STREAM: &'static str = "unsubscribe:ai-stream";
    pub const SUBSCRIBE_TOOL_EXECUTION: &'static str = "subscribe:tool-execution";
    pub const UNSUBSCRIBE_TOOL_EXECUTION: &'static str = "unsubscribe:tool-execution";
    pub const PING: &'static str = "ping";

    // Outbound.
    pub const CONNECTED: &'static str = "connected";
    pub const ERROR: &'static str = "error";
    pub const ROOM_JOINED: &'static str = "room:joined";
    pub const ROOM_LEFT: &'static str = "room:left";
    pub const ROOMS_JOINED: &'static str = "rooms:joined";
    pub const SUBSCRIBED: &'static str = "subscribed";
    pub const UNSUBSCRIBED: &'static str = "unsubscribed";
    pub const USER_JOINED: &'static str = "user:joined";
    pub const USER_LEFT: &'static str = "user:left";
    pub const DOCUMENT_UPDATED: &'static str = "document:updated";
    pub const NOTIFICATION_ACKED: &'static str = "notification:acked";
    // Shares its name with the inbound event; direction disambiguates.
    pub const PRESENCE_CHANGED: &'static str = "presence:update";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;

    #[test]
    fn error_frame_carries_stable_code_and_event() {
        let msg = ServerMessage::error(&GatewayError::rate_limited(), Some("ping"));
        let v: Value = serde_json::from_str(&msg.to_frame()).unwrap();
        assert_eq!(v["t"], "error");
        assert_eq!(v["d"]["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(v["d"]["event"], "ping");
    }

    #[test]
    fn client_message_payload_defaults_to_null() {
        let msg: ClientMessage = serde_json::from_str(r#"{"t":"ping"}"#).unwrap();
        assert_eq!(msg.t, "ping");
        assert!(msg.d.is_null());
    }

    #[test]
    fn document_update_keeps_version_verbatim() {
        let p: DocumentUpdatePayload = serde_json::from_value(serde_json::json!({
            "documentId": "doc-1",
            "changes": [{"op": "insert", "at": 3, "text": "hi"}],
            "version": "v7-client"
        }))
        .unwrap();
        assert_eq!(p.document_id, "doc-1");
        assert_eq!(p.version, "v7-client");
        assert!(p.changes.is_array());
    }

    #[test]
    fn presence_action_rejects_unknown_values() {
        let bad = serde_json::from_value::<PresenceUpdatePayload>(serde_json::json!({
            "documentId": "d", "action": "wave"
        }));
        assert!(bad.is_err());
    }
}
