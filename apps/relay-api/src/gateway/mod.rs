//! Real-time gateway: connection lifecycle, rooms, presence and fan-out.
//!
//! [`Gateway`] ties the pieces together and is the entry point both for the
//! WebSocket server and for in-process producers (notifications, AI streams,
//! tool executions) that push events without being a connection themselves.

pub mod events;
pub mod fanout;
pub mod handler;
pub mod presence;
pub mod ratelimit;
pub mod registry;
pub mod rooms;
pub mod server;
pub mod session;

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::auth::access::AccessPolicy;
use crate::auth::tokens::VerifiedUser;
use crate::config::Config;
use crate::error::{GatewayError, StoreError};
use crate::store::SharedStore;

use events::{EventName, ServerMessage};
use fanout::{BroadcastRouter, Envelope, Target};
use presence::{DocumentPresence, Presence, PresenceStore, UserLocks, UserPresence};
use ratelimit::RateLimiter;
use registry::ConnectionRegistry;
use rooms::{RoomId, RoomManager};
use session::{CloseReason, Connection, ConnectionInfo, ConnectionState, Enqueue};

/// A freshly admitted connection and the receiving ends its task drives.
pub struct Admitted {
    pub connection: Arc<Connection>,
    pub outbound: mpsc::Receiver<Arc<str>>,
    pub closed: watch::Receiver<Option<CloseReason>>,
}

/// One instance per process; tests build as many isolated ones as they like.
pub struct Gateway {
    pub registry: Arc<ConnectionRegistry>,
    pub rooms: Arc<RoomManager>,
    pub presence: PresenceStore,
    pub documents: DocumentPresence,
    pub limiter: RateLimiter,
    pub router: Arc<BroadcastRouter>,
    locks: UserLocks,
    outbound_buffer: usize,
}

impl Gateway {
    /// Build a gateway over `store`. With `relay` set, envelopes are also
    /// exchanged with other processes through the store's pub/sub.
    pub fn new(
        config: &Config,
        store: Arc<dyn SharedStore>,
        access: Arc<dyn AccessPolicy>,
        relay: bool,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomManager::new(access));
        let router = Arc::new(BroadcastRouter::new(
            registry.clone(),
            rooms.clone(),
            config.server_id.clone(),
            relay.then(|| store.clone()),
            config.slow_consumer_limit,
        ));
        Self {
            registry,
            rooms,
            presence: PresenceStore::new(store.clone()),
            documents: DocumentPresence::new(),
            limiter: RateLimiter::new(store, config.rate_limit.clone()),
            router,
            locks: UserLocks::new(),
            outbound_buffer: config.outbound_buffer,
        }
    }

    /// Register an authenticated user's new connection.
    ///
    /// The `connected` event is the first frame the client sees. Store
    /// failures are logged; they never refuse an authenticated client.
    pub async fn admit(&self, user: VerifiedUser) -> Admitted {
        let (conn, outbound, closed) = Connection::new(user, self.outbound_buffer);
        let user_id = conn.user.user_id.clone();

        let went_online = {
            let _guard = self.locks.lock(&user_id).await;
            if self.registry.register(conn.clone()) {
                match self.presence.set_online(&user_id).await {
                    Ok(presence) => Some(presence),
                    Err(err) => {
                        tracing::error!(?err, %user_id, "failed to record presence online");
                        None
                    }
                }
            } else {
                None
            }
        };

        self.reply(
            &conn,
            EventName::CONNECTED,
            json!({ "connectionId": conn.id, "userId": user_id }),
        );

        if let Err(err) = self.rooms.join(&conn, RoomId::User(user_id.clone())).await {
            tracing::error!(code = %err.code, %user_id, "failed to join own user room");
        }
        conn.transition(ConnectionState::Active);

        if let Some(presence) = went_online {
            self.announce_presence(&user_id, presence, &[]).await;
        }

        tracing::info!(connection_id = %conn.id, %user_id, "connection admitted");
        Admitted {
            connection: conn,
            outbound,
            closed,
        }
    }

    /// Tear down a connection. Safe to call more than once.
    pub async fn disconnect(&self, conn: &Arc<Connection>) {
        if conn.transition(ConnectionState::Closed) == ConnectionState::Closed {
            return;
        }
        let user_id = conn.user.user_id.clone();

        let left = self.rooms.leave_all(conn);
        let mut document_rooms = Vec::new();
        for room in left {
            if let RoomId::Document(document_id) = &room {
                if self.documents.exit(document_id, &user_id, &conn.id) {
                    self.emit(Envelope::new(
                        EventName::USER_LEFT,
                        json!({ "userId": user_id, "documentId": document_id }),
                        Target::Room(room.clone()),
                    ))
                    .await;
                }
                document_rooms.push(room);
            }
        }

        let went_offline = {
            let _guard = self.locks.lock(&user_id).await;
            match self.registry.remove(&conn.id) {
                Some((_, true)) => match self.presence.set_offline(&user_id).await {
                    Ok(presence) => presence,
                    Err(err) => {
                        tracing::error!(?err, %user_id, "failed to record presence offline");
                        None
                    }
                },
                _ => None,
            }
        };

        if let Some(presence) = went_offline {
            self.announce_presence(&user_id, presence, &document_rooms).await;
        }

        tracing::info!(
            connection_id = %conn.id,
            %user_id,
            reason = ?conn.close_reason(),
            "connection closed"
        );
    }

    /// `presence:update` to the user's own room and the given document rooms.
    async fn announce_presence(&self, user_id: &str, presence: Presence, document_rooms: &[RoomId]) {
        let data = match serde_json::to_value(UserPresence::new(user_id, presence)) {
            Ok(data) => data,
            Err(err) => {
                tracing::error!(?err, %user_id, "presence encoding failed");
                return;
            }
        };
        let own = RoomId::User(user_id.to_string());
        for room in std::iter::once(&own).chain(document_rooms) {
            self.emit(Envelope::new(
                EventName::PRESENCE_CHANGED,
                data.clone(),
                Target::Room(room.clone()),
            ))
            .await;
        }
    }

    /// Route an envelope locally and, when enabled, to the other processes.
    pub async fn emit(&self, envelope: Envelope) -> usize {
        self.router.deliver(envelope).await
    }

    /// Send a frame to one connection of this process, bypassing the relay.
    pub fn reply(&self, conn: &Connection, event: &str, data: Value) {
        self.send_frame(conn, ServerMessage::event(event, data).to_frame());
    }

    /// In-band `error` event for the connection. The connection stays open.
    pub fn reply_error(&self, conn: &Connection, err: &GatewayError, event: Option<&str>) {
        self.send_frame(conn, ServerMessage::error(err, event).to_frame());
    }

    fn send_frame(&self, conn: &Connection, frame: Arc<str>) {
        if let Enqueue::Dropped { strikes } = conn.enqueue(frame) {
            tracing::warn!(connection_id = %conn.id, strikes, "reply dropped, outbound queue full");
        }
    }

    pub async fn emit_to_user(&self, user_id: &str, event: &str, data: Value) -> usize {
        self.emit(Envelope::new(event, data, Target::User(user_id.to_string())))
            .await
    }

    pub async fn emit_to_room(&self, room: &RoomId, event: &str, data: Value) -> usize {
        self.emit(Envelope::new(event, data, Target::Room(room.clone())))
            .await
    }

    pub async fn emit_to_connection(&self, connection_id: &str, event: &str, data: Value) -> usize {
        self.emit(Envelope::new(
            event,
            data,
            Target::Connection(connection_id.to_string()),
        ))
        .await
    }

    pub async fn broadcast_all(&self, event: &str, data: Value) -> usize {
        self.emit(Envelope::new(event, data, Target::All)).await
    }

    /// Users with at least one connection to this process.
    pub fn connected_users(&self) -> Vec<String> {
        self.registry.connected_users()
    }

    /// Cross-process presence; falls back to local knowledge if the store is
    /// unreachable.
    pub async fn is_online(&self, user_id: &str) -> bool {
        match self.presence.get(user_id).await {
            Ok(presence) => presence.online,
            Err(err) => {
                tracing::warn!(?err, %user_id, "presence lookup failed, using local registry");
                self.registry.count_for(user_id) > 0
            }
        }
    }

    pub async fn presence(&self, user_id: &str) -> Result<Presence, StoreError> {
        self.presence.get(user_id).await
    }

    /// Signal every local connection of the user to close. Cleanup runs in
    /// each connection's own task. Returns how many were signalled.
    pub fn force_disconnect_user(&self, user_id: &str, reason: &str) -> usize {
        let conns = self.registry.connections_for_user(user_id);
        for conn in &conns {
            conn.close(CloseReason::Revoked(reason.to_string()));
        }
        if !conns.is_empty() {
            tracing::info!(%user_id, count = conns.len(), %reason, "forcing disconnect");
        }
        conns.len()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> =
            self.registry.all().iter().map(|conn| conn.info()).collect();
        infos.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        infos
    }

    /// Start the cross-process relay subscriber, if relay is enabled.
    pub fn spawn_relay(&self) -> Option<JoinHandle<()>> {
        self.router.spawn_relay()
    }
}
