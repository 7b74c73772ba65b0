//! Connected-user table.
//!
//! Keyed by session id, with name and uuid lookups. Disconnected users stay
//! behind as tombstones so a reconnect can reclaim its uuid; at most one
//! live entry may hold a given name (case-insensitive).

use crate::error::{Error, Result};
use crate::types::Sid;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub uuid: String,
    pub uri: String,
    pub sid: Sid,
    /// Learned through replica sync rather than a direct connect.
    pub replicated: bool,
    /// Tombstone flag; the entry is kept for uuid reclaim.
    pub disconnected: bool,
}

#[derive(Default)]
pub struct UserTable {
    users: Mutex<HashMap<Sid, User>>,
}

impl UserTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a user. Rules, in order:
    /// - a tombstoned holder of the name is reclaimed (same uuid, new sid);
    /// - a live replicated holder yields to the real user arriving;
    /// - a replicated add against a live real holder returns the existing
    ///   entry;
    /// - otherwise a live holder means the name is taken.
    pub async fn add_user(
        &self,
        name: &str,
        sid: &str,
        uri: &str,
        replicated: bool,
    ) -> Result<User> {
        if name.is_empty() {
            return Err(Error::DuplicateName(name.to_string()));
        }

        let mut users = self.users.lock().await;
        if let Some(old) = lookup_name(&users, name) {
            let old = old.clone();
            if old.disconnected {
                users.remove(&old.sid);
                let user = User {
                    name: old.name,
                    uuid: old.uuid,
                    uri: uri.to_string(),
                    sid: sid.to_string(),
                    replicated: old.replicated,
                    disconnected: false,
                };
                users.insert(sid.to_string(), user.clone());
                debug!("{} reclaimed uuid {}", user.name, user.uuid);
                return Ok(user);
            }
            if old.replicated {
                // The real user is arriving; the synced ghost yields.
                users.remove(&old.sid);
            } else if replicated {
                return Ok(old);
            } else {
                return Err(Error::DuplicateName(name.to_string()));
            }
        }

        let user = User {
            name: name.to_string(),
            uuid: Uuid::new_v4().to_string(),
            uri: uri.to_string(),
            sid: sid.to_string(),
            replicated,
            disconnected: false,
        };
        users.insert(sid.to_string(), user.clone());
        Ok(user)
    }

    /// Move a user's published endpoint to a new session id and uri. The
    /// old entry is deleted outright; uuid and name carry over.
    pub async fn rebind_uri(&self, name: &str, sid: &str, uri: &str) -> Option<User> {
        let mut users = self.users.lock().await;
        let old = lookup_name(&users, name)?.clone();
        users.remove(&old.sid);
        let user = User {
            uri: uri.to_string(),
            sid: sid.to_string(),
            disconnected: false,
            ..old
        };
        users.insert(sid.to_string(), user.clone());
        Some(user)
    }

    pub async fn by_sid(&self, sid: &str) -> Option<User> {
        self.users.lock().await.get(sid).cloned()
    }

    /// Name lookup, live entries first.
    pub async fn by_name(&self, name: &str) -> Option<User> {
        let users = self.users.lock().await;
        lookup_name(&users, name).cloned()
    }

    /// Uuid lookup, live entries first.
    pub async fn by_uuid(&self, uuid: &str) -> Option<User> {
        let users = self.users.lock().await;
        users
            .values()
            .find(|u| u.uuid == uuid && !u.disconnected)
            .or_else(|| users.values().find(|u| u.uuid == uuid))
            .cloned()
    }

    /// Tombstone the session's user, returning the entry as it was.
    pub async fn tombstone(&self, sid: &str) -> Option<User> {
        let mut users = self.users.lock().await;
        let user = users.get_mut(sid)?;
        let before = user.clone();
        user.disconnected = true;
        Some(before)
    }

    /// Users that are neither tombstoned nor replica ghosts; the sessions
    /// this server can actually talk to.
    pub async fn live_users(&self) -> Vec<User> {
        self.users
            .lock()
            .await
            .values()
            .filter(|u| !u.disconnected && !u.replicated)
            .cloned()
            .collect()
    }

    /// All non-tombstoned users, replica ghosts included.
    pub async fn live_count(&self) -> usize {
        self.users
            .lock()
            .await
            .values()
            .filter(|u| !u.disconnected)
            .count()
    }

    pub async fn len(&self) -> usize {
        self.users.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.users.lock().await.is_empty()
    }
}

fn lookup_name<'a>(users: &'a HashMap<Sid, User>, name: &str) -> Option<&'a User> {
    let wanted = name.to_uppercase();
    users
        .values()
        .find(|u| u.name.to_uppercase() == wanted && !u.disconnected)
        .or_else(|| users.values().find(|u| u.name.to_uppercase() == wanted))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_live_name_is_refused() {
        let table = UserTable::new();
        table.add_user("alice", "s1", "uri1", false).await.unwrap();
        let err = table.add_user("ALICE", "s2", "uri2", false).await;
        assert!(matches!(err, Err(Error::DuplicateName(_))));
    }

    #[tokio::test]
    async fn tombstone_reclaim_keeps_uuid() {
        let table = UserTable::new();
        let first = table.add_user("alice", "s1", "uri1", false).await.unwrap();
        table.tombstone("s1").await.unwrap();

        let again = table.add_user("alice", "s2", "uri2", false).await.unwrap();
        assert_eq!(again.uuid, first.uuid);
        assert_eq!(again.sid, "s2");
        assert!(!again.disconnected);
        // The old sid entry is gone, not just tombstoned.
        assert!(table.by_sid("s1").await.is_none());
    }

    #[tokio::test]
    async fn real_user_replaces_replicated_ghost() {
        let table = UserTable::new();
        let ghost = table.add_user("bob", "remote-1", "uri", true).await.unwrap();
        let real = table.add_user("bob", "s1", "uri", false).await.unwrap();
        assert_ne!(real.uuid, ghost.uuid);
        assert!(!real.replicated);
        assert!(table.by_sid("remote-1").await.is_none());
    }

    #[tokio::test]
    async fn replicated_add_against_live_user_returns_existing() {
        let table = UserTable::new();
        let real = table.add_user("bob", "s1", "uri", false).await.unwrap();
        let synced = table.add_user("bob", "remote-1", "uri", true).await.unwrap();
        assert_eq!(synced.uuid, real.uuid);
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn name_lookup_prefers_live_entry() {
        let table = UserTable::new();
        table.add_user("carol", "s1", "uri1", false).await.unwrap();
        table.tombstone("s1").await;
        table.add_user("carol", "s2", "uri2", false).await.unwrap();

        let found = table.by_name("carol").await.unwrap();
        assert_eq!(found.sid, "s2");
        assert!(!found.disconnected);
    }

    #[tokio::test]
    async fn rebind_moves_sid_and_uri() {
        let table = UserTable::new();
        let user = table.add_user("dave", "s1", "old-uri", false).await.unwrap();
        let moved = table.rebind_uri("dave", "s2", "new-uri").await.unwrap();
        assert_eq!(moved.uuid, user.uuid);
        assert_eq!(moved.uri, "new-uri");
        assert!(table.by_sid("s1").await.is_none());
        assert_eq!(table.by_sid("s2").await.unwrap().uri, "new-uri");
    }

    #[tokio::test]
    async fn live_users_excludes_ghosts_and_tombstones() {
        let table = UserTable::new();
        table.add_user("a", "s1", "u", false).await.unwrap();
        table.add_user("b", "s2", "u", false).await.unwrap();
        table.add_user("c", "remote-1", "u", true).await.unwrap();
        table.tombstone("s2").await;

        let live = table.live_users().await;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].name, "a");
        // live_count still sees the replicated ghost.
        assert_eq!(table.live_count().await, 2);
    }
}
