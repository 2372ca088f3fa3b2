//! Per-connection state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relay_common::id::{prefix, prefixed_ulid};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use utoipa::ToSchema;

use crate::auth::tokens::VerifiedUser;

use super::rooms::RoomId;

/// Close code sent when a connection is terminated by an operator or because
/// its credential was revoked.
pub const CLOSE_REVOKED: u16 = 4008;
/// Close code sent when a connection cannot keep up with its outbound queue.
pub const CLOSE_SLOW_CONSUMER: u16 = 4009;

/// Lifecycle of a connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    Active,
    Closed,
}

/// Why a connection was forced closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Revoked(String),
    SlowConsumer,
}

impl CloseReason {
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::Revoked(_) => CLOSE_REVOKED,
            CloseReason::SlowConsumer => CLOSE_SLOW_CONSUMER,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            CloseReason::Revoked(reason) => reason,
            CloseReason::SlowConsumer => "Slow consumer",
        }
    }
}

/// Result of handing a frame to a connection's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Queued,
    /// The queue was full. `strikes` counts consecutive drops.
    Dropped { strikes: u32 },
    /// The writer side is gone.
    Gone,
}

/// One live, authenticated WebSocket connection.
///
/// Owned by the registry; rooms and the router refer to it by id.
pub struct Connection {
    pub id: String,
    pub user: VerifiedUser,
    pub created_at: DateTime<Utc>,
    rooms: Mutex<HashSet<RoomId>>,
    state: Mutex<ConnectionState>,
    outbound: mpsc::Sender<Arc<str>>,
    close_tx: watch::Sender<Option<CloseReason>>,
    dropped: AtomicU32,
}

/// Serializable snapshot of a connection, for admin tooling.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub user_id: String,
    pub name: String,
    pub state: ConnectionState,
    pub connected_at: DateTime<Utc>,
    pub rooms: Vec<String>,
}

impl Connection {
    /// Create a connection in the `Authenticated` state. Returns the
    /// receiving halves of its outbound queue and its close signal.
    pub fn new(
        user: VerifiedUser,
        outbound_capacity: usize,
    ) -> (
        Arc<Self>,
        mpsc::Receiver<Arc<str>>,
        watch::Receiver<Option<CloseReason>>,
    ) {
        let (outbound, outbound_rx) = mpsc::channel(outbound_capacity.max(1));
        let (close_tx, close_rx) = watch::channel(None);
        let conn = Arc::new(Self {
            id: prefixed_ulid(prefix::CONNECTION),
            user,
            created_at: Utc::now(),
            rooms: Mutex::new(HashSet::new()),
            state: Mutex::new(ConnectionState::Authenticated),
            outbound,
            close_tx,
            dropped: AtomicU32::new(0),
        });
        (conn, outbound_rx, close_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Move to `next`. Returns the previous state. Nothing leaves `Closed`.
    pub fn transition(&self, next: ConnectionState) -> ConnectionState {
        let mut state = self.state.lock();
        let prev = *state;
        if prev != ConnectionState::Closed {
            *state = next;
        }
        prev
    }

    /// Queue a frame for the writer without waiting.
    pub fn enqueue(&self, frame: Arc<str>) -> Enqueue {
        match self.outbound.try_send(frame) {
            Ok(()) => {
                self.dropped.store(0, Ordering::Relaxed);
                Enqueue::Queued
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let strikes = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                Enqueue::Dropped { strikes }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Enqueue::Gone,
        }
    }

    /// Signal the connection task to close with `reason`. The first reason
    /// wins; later calls are ignored.
    pub fn close(&self, reason: CloseReason) {
        self.close_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_tx.borrow().clone()
    }

    pub fn add_room(&self, room: RoomId) -> bool {
        self.rooms.lock().insert(room)
    }

    pub fn remove_room(&self, room: &RoomId) -> bool {
        self.rooms.lock().remove(room)
    }

    pub fn in_room(&self, room: &RoomId) -> bool {
        self.rooms.lock().contains(room)
    }

    pub fn rooms(&self) -> Vec<RoomId> {
        self.rooms.lock().iter().cloned().collect()
    }

    /// Empty the room set and return what it held.
    pub fn take_rooms(&self) -> Vec<RoomId> {
        self.rooms.lock().drain().collect()
    }

    pub fn info(&self) -> ConnectionInfo {
        let mut rooms: Vec<String> = self.rooms.lock().iter().map(ToString::to_string).collect();
        rooms.sort();
        ConnectionInfo {
            connection_id: self.id.clone(),
            user_id: self.user.user_id.clone(),
            name: self.user.name.clone(),
            state: self.state(),
            connected_at: self.created_at,
            rooms,
        }
    }
}
