//! User presence (online / last seen) and per-document viewers.
//!
//! Presence is per **user**, not per connection. A process "holds" a user
//! while it has at least one live connection for them; the shared holder
//! counter lets several relay processes agree on when the user is really
//! gone.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use relay_common::time::{from_millis, now_millis};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use utoipa::ToSchema;

use crate::error::StoreError;
use crate::store::SharedStore;

fn holders_key(user_id: &str) -> String {
    format!("presence:holders:{user_id}")
}

fn record_key(user_id: &str) -> String {
    format!("presence:record:{user_id}")
}

/// A user's presence as seen by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Presence {
    pub fn offline() -> Self {
        Self {
            online: false,
            last_seen: None,
        }
    }
}

/// Presence tagged with its user, as sent in `presence:update` events and
/// presence lookups.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserPresence {
    pub user_id: String,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

impl UserPresence {
    pub fn new(user_id: &str, presence: Presence) -> Self {
        Self {
            user_id: user_id.to_string(),
            online: presence.online,
            last_seen: presence.last_seen,
        }
    }
}

/// Shape stored in the shared store. Timestamps are epoch millis.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredPresence {
    online: bool,
    last_seen: Option<i64>,
}

impl From<StoredPresence> for Presence {
    fn from(s: StoredPresence) -> Self {
        Self {
            online: s.online,
            last_seen: s.last_seen.map(from_millis),
        }
    }
}

/// Cross-process presence records on top of a [`SharedStore`].
pub struct PresenceStore {
    store: Arc<dyn SharedStore>,
}

impl PresenceStore {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    /// Record that this process now holds `user_id`. Call once per user, on
    /// their first local connection.
    pub async fn set_online(&self, user_id: &str) -> Result<Presence, StoreError> {
        let (stored, raw) = encode(user_id, true)?;
        let holders = self
            .store
            .incr_and_set(&holders_key(user_id), &record_key(user_id), &raw)
            .await?;
        tracing::debug!(%user_id, holders, "presence online");
        Ok(stored.into())
    }

    /// Release this process's hold on `user_id`. Returns the new presence when
    /// the user went offline, `None` when another process still holds them.
    ///
    /// The decrement and the offline write are one store operation, so a
    /// concurrent `set_online` elsewhere either lands before it (and keeps the
    /// user online) or after it (and flips them back online).
    pub async fn set_offline(&self, user_id: &str) -> Result<Option<Presence>, StoreError> {
        let (stored, raw) = encode(user_id, false)?;
        let holders = self
            .store
            .decr_and_set_at_zero(&holders_key(user_id), &record_key(user_id), &raw)
            .await?;
        if holders > 0 {
            tracing::debug!(%user_id, holders, "presence still held elsewhere");
            return Ok(None);
        }
        tracing::debug!(%user_id, "presence offline");
        Ok(Some(stored.into()))
    }

    /// Current presence. Unknown users are offline with no last-seen time.
    pub async fn get(&self, user_id: &str) -> Result<Presence, StoreError> {
        let key = record_key(user_id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(Presence::offline());
        };
        let stored: StoredPresence =
            serde_json::from_str(&raw).map_err(|source| StoreError::Corrupt { key, source })?;
        Ok(stored.into())
    }
}

/// Presence record stamped now, with its stored JSON.
fn encode(user_id: &str, online: bool) -> Result<(StoredPresence, String), StoreError> {
    let stored = StoredPresence {
        online,
        last_seen: Some(now_millis()),
    };
    let raw = serde_json::to_string(&stored).map_err(|source| StoreError::Corrupt {
        key: record_key(user_id),
        source,
    })?;
    Ok((stored, raw))
}

// ---------------------------------------------------------------------------
// Document viewers
// ---------------------------------------------------------------------------

/// Which users are viewing which document, counted per connection so a user
/// with two tabs on the same document stays present until both leave.
pub struct DocumentPresence {
    inner: DashMap<String, HashMap<String, HashSet<String>>>,
}

impl DocumentPresence {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Mark `connection_id` as viewing. Returns `true` if the user was not
    /// already present on the document.
    pub fn enter(&self, document_id: &str, user_id: &str, connection_id: &str) -> bool {
        let mut viewers = self.inner.entry(document_id.to_string()).or_default();
        let conns = viewers.entry(user_id.to_string()).or_default();
        let newly_present = conns.is_empty();
        conns.insert(connection_id.to_string());
        newly_present
    }

    /// Drop `connection_id` from the document. Returns `true` if the user has
    /// no connection left on it.
    pub fn exit(&self, document_id: &str, user_id: &str, connection_id: &str) -> bool {
        let mut gone = false;
        self.inner.remove_if_mut(document_id, |_, viewers| {
            if let Some(conns) = viewers.get_mut(user_id) {
                if conns.remove(connection_id) && conns.is_empty() {
                    viewers.remove(user_id);
                    gone = true;
                }
            }
            viewers.is_empty()
        });
        gone
    }
}

impl Default for DocumentPresence {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Per-user sequencing
// ---------------------------------------------------------------------------

/// Per-user async locks. Registration and presence transitions for one user
/// run under that user's lock so "first connection → online" and
/// "last connection → offline" cannot interleave.
pub struct UserLocks {
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

/// Held while a user's presence transition runs. Unused lock entries are
/// dropped when the last guard goes away.
pub struct UserGuard<'a> {
    owner: &'a UserLocks,
    user_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    pub async fn lock(&self, user_id: &str) -> UserGuard<'_> {
        let mutex = Arc::clone(self.locks.entry(user_id.to_string()).or_default().value());
        let guard = mutex.lock_owned().await;
        UserGuard {
            owner: self,
            user_id: user_id.to_string(),
            guard: Some(guard),
        }
    }

    fn len(&self) -> usize {
        self.locks.len()
    }
}

impl Default for UserLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UserGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.owner
            .locks
            .remove_if(&self.user_id, |_, m| Arc::strong_count(m) == 1);
    }
}
