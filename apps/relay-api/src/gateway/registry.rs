//! Process-local index of live connections.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;

use super::session::Connection;

/// Live connections, indexed by connection id and by user id.
///
/// `DashMap` shards keep unrelated users from contending. The per-user index
/// is updated through the shard's entry guard, so "first connection" and
/// "last connection" are decided atomically per user.
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<Connection>>,
    by_user: DashMap<String, HashSet<String>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            by_user: DashMap::new(),
        }
    }

    /// Add a connection. Returns `true` when it is the user's first live
    /// connection in this process.
    pub fn register(&self, conn: Arc<Connection>) -> bool {
        let first = {
            let mut ids = self.by_user.entry(conn.user.user_id.clone()).or_default();
            ids.insert(conn.id.clone());
            ids.len() == 1
        };
        self.connections.insert(conn.id.clone(), conn);
        first
    }

    /// Remove a connection. Returns it along with `true` when it was the
    /// user's last live connection. `None` if it was already removed.
    pub fn remove(&self, connection_id: &str) -> Option<(Arc<Connection>, bool)> {
        let (_, conn) = self.connections.remove(connection_id)?;
        let mut last = false;
        self.by_user.remove_if_mut(&conn.user.user_id, |_, ids| {
            ids.remove(connection_id);
            last = ids.is_empty();
            last
        });
        Some((conn, last))
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(connection_id).map(|c| Arc::clone(c.value()))
    }

    pub fn count_for(&self, user_id: &str) -> usize {
        self.by_user.get(user_id).map_or(0, |ids| ids.len())
    }

    pub fn connections_for_user(&self, user_id: &str) -> Vec<Arc<Connection>> {
        let ids: Vec<String> = match self.by_user.get(user_id) {
            Some(ids) => ids.iter().cloned().collect(),
            None => return Vec::new(),
        };
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|c| Arc::clone(c.value())).collect()
    }

    pub fn connected_users(&self) -> Vec<String> {
        self.by_user.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn user_count(&self) -> usize {
        self.by_user.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::session::tests::test_connection;

    #[test]
    fn first_and_last_connection_are_reported() {
        let registry = ConnectionRegistry::new();
        let (a, _ra, _ca) = test_connection("u1");
        let (b, _rb, _cb) = test_connection("u1");

        assert!(registry.register(a.clone()));
        assert!(!registry.register(b.clone()));
        assert_eq!(registry.count_for("u1"), 2);
        assert_eq!(registry.user_count(), 1);

        let (_, last) = registry.remove(&a.id).unwrap();
        assert!(!last);
        assert_eq!(registry.count_for("u1"), 1);

        let (_, last) = registry.remove(&b.id).unwrap();
        assert!(last);
        assert_eq!(registry.count_for("u1"), 0);
        assert!(registry.connected_users().is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (a, _ra, _ca) = test_connection("u1");
        registry.register(a.clone());
        assert!(registry.remove(&a.id).is_some());
        assert!(registry.remove(&a.id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn lookups_by_user_only_see_that_user() {
        let registry = ConnectionRegistry::new();
        let (a, _ra, _ca) = test_connection("u1");
        let (b, _rb, _cb) = test_connection("u2");
        registry.register(a.clone());
        registry.register(b.clone());

        let mine = registry.connections_for_user("u1");
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, a.id);
        assert!(registry.connections_for_user("nobody").is_empty());

        let mut users = registry.connected_users();
        users.sort();
        assert_eq!(users, vec!["u1", "u2"]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(&b.id).map(|c| c.id.clone()), Some(b.id.clone()));
    }
}
