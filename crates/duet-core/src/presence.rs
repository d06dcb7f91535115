//! Presence tracking for Duet.
//!
//! The registry maps each online user to the one connection currently
//! routing for them. The latest `connect` for a user wins; a stale
//! connection closing afterwards does not take the user offline. A single
//! connection may announce several identities, and closing it takes all
//! of them offline.

use crate::connection::ConnectionId;
use duet_protocol::UserId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Default capacity of the change notification channel.
const DEFAULT_CHANGE_CAPACITY: usize = 256;

/// Emitted whenever the online set or its routing changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    /// Online users after the change, sorted.
    pub online: Vec<UserId>,
}

#[derive(Debug, Default)]
struct Routes {
    by_user: HashMap<UserId, ConnectionId>,
    by_connection: HashMap<ConnectionId, HashSet<UserId>>,
}

impl Routes {
    fn snapshot(&self) -> Vec<UserId> {
        let mut online: Vec<UserId> = self.by_user.keys().cloned().collect();
        online.sort_unstable();
        online
    }
}

/// Registry of online users and their active connection.
///
/// All state sits behind a single lock; no operation performs I/O while
/// holding it.
#[derive(Debug)]
pub struct PresenceRegistry {
    routes: Mutex<Routes>,
    changes: broadcast::Sender<PresenceChange>,
}

impl PresenceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANGE_CAPACITY)
    }

    /// Create an empty registry with a specific change channel capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity);
        Self {
            routes: Mutex::new(Routes::default()),
            changes,
        }
    }

    /// Subscribe to presence change notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceChange> {
        self.changes.subscribe()
    }

    /// Bind `user` to `connection`, replacing the user's previous binding.
    ///
    /// Identities already announced on `connection` stay bound. Returns the
    /// connection that previously routed for `user`, if it differs.
    pub fn connect(&self, user: impl Into<UserId>, connection: ConnectionId) -> Option<ConnectionId> {
        let user = user.into();
        let mut routes = self.routes.lock();

        let replaced = routes
            .by_user
            .insert(user.clone(), connection.clone())
            .filter(|previous| *previous != connection);
        if let Some(previous) = &replaced {
            if let Some(users) = routes.by_connection.get_mut(previous) {
                users.remove(&user);
                if users.is_empty() {
                    routes.by_connection.remove(previous);
                }
            }
            debug!(user = %user, old = %previous, new = %connection, "Presence: connection superseded");
        } else {
            debug!(user = %user, connection = %connection, "Presence: user online");
        }
        routes
            .by_connection
            .entry(connection)
            .or_default()
            .insert(user);

        self.notify(&routes);
        replaced
    }

    /// Remove every user `connection` currently routes for.
    ///
    /// Returns the users taken offline, sorted. Empty if the connection was
    /// never bound or has been superseded for all its users; no change is
    /// emitted in that case.
    pub fn disconnect(&self, connection: &ConnectionId) -> Vec<UserId> {
        let mut routes = self.routes.lock();

        let Some(users) = routes.by_connection.remove(connection) else {
            return Vec::new();
        };
        let mut removed: Vec<UserId> = users.into_iter().collect();
        removed.sort_unstable();
        for user in &removed {
            routes.by_user.remove(user);
            debug!(user = %user, connection = %connection, "Presence: user offline");
        }

        self.notify(&routes);
        removed
    }

    /// Whether `connection` is the current routing target for `user`.
    #[must_use]
    pub fn is_bound(&self, user: &str, connection: &ConnectionId) -> bool {
        self.routes.lock().by_user.get(user) == Some(connection)
    }

    /// Current routing target for `user`.
    #[must_use]
    pub fn lookup(&self, user: &str) -> Option<ConnectionId> {
        self.routes.lock().by_user.get(user).cloned()
    }

    /// All online users, sorted.
    #[must_use]
    pub fn snapshot(&self) -> Vec<UserId> {
        self.routes.lock().snapshot()
    }

    /// Check if a user is online.
    #[must_use]
    pub fn is_online(&self, user: &str) -> bool {
        self.routes.lock().by_user.contains_key(user)
    }

    /// Number of online users.
    #[must_use]
    pub fn count(&self) -> usize {
        self.routes.lock().by_user.len()
    }

    // Sent under the lock so subscribers observe changes in order.
    fn notify(&self, routes: &Routes) {
        let change = PresenceChange {
            online: routes.snapshot(),
        };
        let receivers = self.changes.send(change).unwrap_or_default();
        trace!(receivers, "Presence change published");
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::new(id)
    }

    #[test]
    fn test_connect_lookup_disconnect() {
        let registry = PresenceRegistry::new();

        assert_eq!(registry.connect("1", conn("c1")), None);
        assert_eq!(registry.lookup("1"), Some(conn("c1")));
        assert!(registry.is_online("1"));

        assert_eq!(registry.disconnect(&conn("c1")), vec!["1".to_string()]);
        assert_eq!(registry.lookup("1"), None);
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_reconnect_keeps_single_entry() {
        let registry = PresenceRegistry::new();

        registry.connect("1", conn("c1"));
        assert_eq!(registry.connect("1", conn("c2")), Some(conn("c1")));

        assert_eq!(registry.snapshot(), vec!["1".to_string()]);
        assert_eq!(registry.lookup("1"), Some(conn("c2")));
    }

    #[test]
    fn test_stale_disconnect_is_noop() {
        let registry = PresenceRegistry::new();

        registry.connect("1", conn("c1"));
        registry.connect("1", conn("c2"));

        assert!(registry.disconnect(&conn("c1")).is_empty());
        assert_eq!(registry.lookup("1"), Some(conn("c2")));
        assert!(registry.is_bound("1", &conn("c2")));
        assert!(!registry.is_bound("1", &conn("c1")));
    }

    #[test]
    fn test_second_identity_on_same_connection_keeps_first() {
        let registry = PresenceRegistry::new();

        registry.connect("1", conn("c1"));
        registry.connect("2", conn("c1"));

        assert_eq!(registry.snapshot(), vec!["1".to_string(), "2".to_string()]);
        assert!(registry.is_bound("1", &conn("c1")));
        assert!(registry.is_bound("2", &conn("c1")));

        assert_eq!(
            registry.disconnect(&conn("c1")),
            vec!["1".to_string(), "2".to_string()]
        );
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_moving_one_identity_leaves_the_other() {
        let registry = PresenceRegistry::new();

        registry.connect("1", conn("c1"));
        registry.connect("2", conn("c1"));
        registry.connect("2", conn("c2"));

        // c1 now only routes for "1".
        assert_eq!(registry.disconnect(&conn("c1")), vec!["1".to_string()]);
        assert_eq!(registry.snapshot(), vec!["2".to_string()]);
        assert_eq!(registry.lookup("2"), Some(conn("c2")));
    }

    #[test]
    fn test_change_notifications() {
        let registry = PresenceRegistry::new();
        let mut rx = registry.subscribe();

        registry.connect("2", conn("c2"));
        registry.connect("1", conn("c1"));
        assert_eq!(rx.try_recv().unwrap().online, vec!["2".to_string()]);
        assert_eq!(
            rx.try_recv().unwrap().online,
            vec!["1".to_string(), "2".to_string()]
        );

        // Unknown handle: nothing removed, nothing emitted.
        registry.disconnect(&conn("unknown"));
        assert!(rx.try_recv().is_err());

        registry.disconnect(&conn("c1"));
        assert_eq!(rx.try_recv().unwrap().online, vec!["2".to_string()]);
    }

    #[test]
    fn test_snapshot_tracks_last_operation_per_handle() {
        let registry = Arc::new(PresenceRegistry::new());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let user = format!("user-{}", i % 4);
                    for round in 0..50 {
                        let handle = conn(&format!("c-{}-{}", i, round));
                        registry.connect(user.clone(), handle.clone());
                        if round % 2 == 0 {
                            registry.disconnect(&handle);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Every user's routing entry must point at a live handle of that user.
        for user in registry.snapshot() {
            let handle = registry.lookup(&user).unwrap();
            assert_eq!(registry.disconnect(&handle), vec![user]);
        }
        assert_eq!(registry.count(), 0);
    }
}
