//! Room ids and room membership.
//!
//! A room is a set of connection ids that receive the same events. Rooms have
//! no lifecycle of their own: they appear on first join and are dropped when
//! the last member leaves.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::auth::access::AccessPolicy;
use crate::error::ApiError;

use super::session::Connection;

// ---------------------------------------------------------------------------
// RoomId
// ---------------------------------------------------------------------------

/// A room, tagged by the kind of entity it fans out for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoomId {
    User(String),
    Document(String),
    AiStream(String),
    ToolExecution(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomIdError {
    #[error("room id must look like <kind>:<id>")]
    Malformed,
    #[error("unknown room kind `{0}`")]
    UnknownKind(String),
    #[error("room entity id must not be empty")]
    EmptyId,
}

impl RoomId {
    /// Build a room id from a kind tag and an entity id.
    pub fn new(kind: &str, id: &str) -> Result<Self, RoomIdError> {
        if id.trim().is_empty() {
            return Err(RoomIdError::EmptyId);
        }
        let id = id.to_string();
        match kind {
            "user" => Ok(RoomId::User(id)),
            "document" => Ok(RoomId::Document(id)),
            "ai-stream" => Ok(RoomId::AiStream(id)),
            "tool-execution" => Ok(RoomId::ToolExecution(id)),
            other => Err(RoomIdError::UnknownKind(other.to_string())),
        }
    }

    pub fn document(id: &str) -> Result<Self, RoomIdError> {
        Self::new("document", id)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RoomId::User(_) => "user",
            RoomId::Document(_) => "document",
            RoomId::AiStream(_) => "ai-stream",
            RoomId::ToolExecution(_) => "tool-execution",
        }
    }

    pub fn entity_id(&self) -> &str {
        match self {
            RoomId::User(id)
            | RoomId::Document(id)
            | RoomId::AiStream(id)
            | RoomId::ToolExecution(id) => id,
        }
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.entity_id())
    }
}

impl FromStr for RoomId {
    type Err = RoomIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Entity ids may themselves contain ':'; the kind never does.
        let (kind, id) = s.split_once(':').ok_or(RoomIdError::Malformed)?;
        RoomId::new(kind, id)
    }
}

impl Serialize for RoomId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RoomId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// RoomManager
// ---------------------------------------------------------------------------

/// Result of a join request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyMember,
    Denied,
}

type Members = Arc<Mutex<HashSet<String>>>;

/// Membership of connections in rooms.
///
/// Each room's member set has its own lock, so fan-out to one room never
/// waits on another. The `DashMap` entry guard is held while inserting a
/// member so a concurrent garbage-collection of the same room cannot orphan
/// the insert.
pub struct RoomManager {
    rooms: DashMap<RoomId, Members>,
    access: Arc<dyn AccessPolicy>,
}

impl RoomManager {
    pub fn new(access: Arc<dyn AccessPolicy>) -> Self {
        Self {
            rooms: DashMap::new(),
            access,
        }
    }

    /// May `user_id` occupy `room`? A user's own room is always allowed and
    /// other users' rooms never are; everything else asks the access policy.
    pub async fn authorize(&self, user_id: &str, room: &RoomId) -> Result<bool, ApiError> {
        match room {
            RoomId::User(owner) => Ok(owner == user_id),
            _ => self.access.has_access(user_id, room).await,
        }
    }

    /// Authorize then add the connection to `room`. Joining twice is a no-op.
    pub async fn join(&self, conn: &Connection, room: RoomId) -> Result<JoinOutcome, ApiError> {
        if !self.authorize(&conn.user.user_id, &room).await? {
            tracing::debug!(
                connection_id = %conn.id,
                user_id = %conn.user.user_id,
                %room,
                "room join denied"
            );
            return Ok(JoinOutcome::Denied);
        }

        let inserted = {
            let entry = self.rooms.entry(room.clone()).or_default();
            let inserted = entry.lock().insert(conn.id.clone());
            inserted
        };
        conn.add_room(room.clone());

        if inserted {
            tracing::debug!(connection_id = %conn.id, %room, "joined room");
            Ok(JoinOutcome::Joined)
        } else {
            Ok(JoinOutcome::AlreadyMember)
        }
    }

    /// Join several rooms; each outcome is independent of the others.
    pub async fn join_many(
        &self,
        conn: &Connection,
        rooms: Vec<RoomId>,
    ) -> Vec<(RoomId, Result<JoinOutcome, ApiError>)> {
        let mut outcomes = Vec::with_capacity(rooms.len());
        for room in rooms {
            let outcome = self.join(conn, room.clone()).await;
            outcomes.push((room, outcome));
        }
        outcomes
    }

    /// Remove the connection from `room`. Returns whether it was a member.
    pub fn leave(&self, conn: &Connection, room: &RoomId) -> bool {
        conn.remove_room(room);
        self.remove_member(room, &conn.id)
    }

    /// Remove the connection from every room it joined. Returns those rooms.
    pub fn leave_all(&self, conn: &Connection) -> Vec<RoomId> {
        let rooms = conn.take_rooms();
        for room in &rooms {
            self.remove_member(room, &conn.id);
        }
        rooms
    }

    /// Snapshot of the room's current members.
    pub fn members_of(&self, room: &RoomId) -> Vec<String> {
        self.rooms
            .get(room)
            .map(|m| m.lock().iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Run `f` over the room's members while holding the room lock, so
    /// concurrent fan-outs to the same room are observed in call order.
    pub fn with_members<R>(&self, room: &RoomId, f: impl FnOnce(&HashSet<String>) -> R) -> Option<R> {
        let members = self.rooms.get(room).map(|m| Arc::clone(m.value()))?;
        let guard = members.lock();
        Some(f(&guard))
    }

    /// Number of live (non-empty) rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    fn remove_member(&self, room: &RoomId, connection_id: &str) -> bool {
        let mut removed = false;
        self.rooms.remove_if(room, |_, members| {
            let mut set = members.lock();
            removed = set.remove(connection_id);
            set.is_empty()
        });
        removed
    }
}
