//! Event fan-out to connections, users, rooms, or everyone.
//!
//! Delivery is best-effort and at most once per live connection. Each
//! envelope is serialized once; every recipient gets the same shared frame
//! pushed onto its bounded outbound queue without waiting. When a relay store
//! is configured, locally originated envelopes are also published for the
//! other relay processes, which deliver them to their own connections only.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use relay_common::time::now_millis;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::store::SharedStore;

use super::events::ServerMessage;
use super::registry::ConnectionRegistry;
use super::rooms::{RoomId, RoomManager};
use super::session::{CloseReason, Connection, Enqueue};

/// Pub/sub channel shared by every relay process.
pub const RELAY_CHANNEL: &str = "relay:envelopes";

/// Pause before resubscribing after the relay subscription drops.
const RELAY_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Who an envelope is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Target {
    Connection(String),
    User(String),
    Room(RoomId),
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Origin {
    /// Stamped by the router that first delivers the envelope.
    #[serde(default)]
    pub server_id: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomId>,
    /// Connection that must not receive the event (usually the sender).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<String>,
}

/// One logical event on its way to one or many connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub event: String,
    pub data: Value,
    pub target: Target,
    pub origin: Origin,
}

impl Envelope {
    pub fn new(event: &str, data: Value, target: Target) -> Self {
        let room = match &target {
            Target::Room(room) => Some(room.clone()),
            _ => None,
        };
        Self {
            event: event.to_string(),
            data,
            target,
            origin: Origin {
                server_id: String::new(),
                timestamp: now_millis(),
                room,
                exclude: None,
            },
        }
    }

    /// Skip `connection_id` when fanning out.
    pub fn excluding(mut self, connection_id: &str) -> Self {
        self.origin.exclude = Some(connection_id.to_string());
        self
    }
}

pub struct BroadcastRouter {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomManager>,
    server_id: String,
    relay: Option<Arc<dyn SharedStore>>,
    slow_consumer_limit: u32,
}

impl BroadcastRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomManager>,
        server_id: String,
        relay: Option<Arc<dyn SharedStore>>,
        slow_consumer_limit: u32,
    ) -> Self {
        Self {
            registry,
            rooms,
            server_id,
            relay,
            slow_consumer_limit: slow_consumer_limit.max(1),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Deliver to local recipients, then hand the envelope to the relay.
    /// Returns the number of local connections the frame was queued for.
    pub async fn deliver(&self, mut envelope: Envelope) -> usize {
        envelope.origin.server_id = self.server_id.clone();
        let delivered = self.deliver_local(&envelope);

        if let Some(relay) = &self.relay {
            match serde_json::to_string(&envelope) {
                Ok(raw) => {
                    if let Err(err) = relay.publish(RELAY_CHANNEL, &raw).await {
                        tracing::warn!(?err, event = %envelope.event, "relay publish failed");
                    }
                }
                Err(err) => tracing::error!(?err, event = %envelope.event, "envelope encoding failed"),
            }
        }
        delivered
    }

    /// Deliver to connections in this process only.
    pub fn deliver_local(&self, envelope: &Envelope) -> usize {
        let frame = ServerMessage::event(&envelope.event, envelope.data.clone()).to_frame();
        let exclude = envelope.origin.exclude.as_deref();

        let delivered: usize = match &envelope.target {
            Target::Connection(id) => self
                .registry
                .get(id)
                .map_or(0, |conn| self.push(&conn, &frame, exclude)),
            Target::User(user_id) => self
                .registry
                .connections_for_user(user_id)
                .iter()
                .map(|conn| self.push(conn, &frame, exclude))
                .sum(),
            // The room lock is held for the whole fan-out so concurrent
            // deliveries to one room reach every member in the same order.
            Target::Room(room) => self
                .rooms
                .with_members(room, |members| {
                    members
                        .iter()
                        .filter_map(|id| self.registry.get(id))
                        .map(|conn| self.push(&conn, &frame, exclude))
                        .sum::<usize>()
                })
                .unwrap_or(0),
            Target::All => self
                .registry
                .all()
                .iter()
                .map(|conn| self.push(conn, &frame, exclude))
                .sum(),
        };

        tracing::trace!(event = %envelope.event, target = ?envelope.target, delivered, "fan-out");
        delivered
    }

    fn push(&self, conn: &Connection, frame: &Arc<str>, exclude: Option<&str>) -> usize {
        if exclude == Some(conn.id.as_str()) {
            return 0;
        }
        match conn.enqueue(Arc::clone(frame)) {
            Enqueue::Queued => 1,
            Enqueue::Dropped { strikes } => {
                tracing::warn!(connection_id = %conn.id, strikes, "outbound queue full, event dropped");
                if strikes >= self.slow_consumer_limit {
                    tracing::warn!(connection_id = %conn.id, user_id = %conn.user.user_id, "closing slow consumer");
                    conn.close(CloseReason::SlowConsumer);
                }
                0
            }
            Enqueue::Gone => 0,
        }
    }

    /// Start the relay subscriber, if a relay store is configured.
    pub fn spawn_relay(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let store = self.relay.clone()?;
        let router = Arc::clone(self);
        Some(tokio::spawn(async move { router.relay_loop(store).await }))
    }

    async fn relay_loop(&self, store: Arc<dyn SharedStore>) {
        loop {
            match store.subscribe(RELAY_CHANNEL).await {
                Ok(stream) => {
                    tracing::info!(server_id = %self.server_id, "relay subscribed");
                    self.consume_relay(stream).await;
                    tracing::warn!("relay subscription ended, resubscribing");
                }
                Err(err) => tracing::error!(?err, "relay subscribe failed"),
            }
            tokio::time::sleep(RELAY_RETRY_DELAY).await;
        }
    }

    /// Deliver envelopes published by other processes until the stream ends.
    /// Envelopes this process published are skipped; nothing is re-published.
    pub async fn consume_relay(&self, mut stream: BoxStream<'static, String>) {
        while let Some(raw) = stream.next().await {
            match serde_json::from_str::<Envelope>(&raw) {
                Ok(envelope) if envelope.origin.server_id == self.server_id => {}
                Ok(envelope) => {
                    self.deliver_local(&envelope);
                }
                Err(err) => tracing::warn!(?err, "dropping malformed relay envelope"),
            }
        }
    }
}
