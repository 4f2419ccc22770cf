//! Reference-counted presence tracking.
//!
//! A user is Online while at least one session connection is live and
//! Offline only when the last one drops.  Every connection carries a
//! liveness deadline refreshed by inbound frames; a periodic sweep expires
//! connections whose deadline passed, so presence converges even after
//! abrupt network loss with no disconnect signal.
//!
//! Transitions are serialized per user (each user has its own async mutex),
//! persisted to the identity store, and fanned out to watchers.  The log is
//! never affected by a presence failure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use causerie_shared::types::{Presence, UserId};
use causerie_store::StoreHandle;

use crate::error::ServerError;
use crate::fanout::FanoutHub;

/// Identifies one live connection of a user (a user may have several
/// devices connected at once).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnId(u64);

#[derive(Default)]
struct UserEntry {
    /// connection id -> liveness deadline.
    connections: HashMap<u64, Instant>,
}

struct TrackerInner {
    /// Per-user state; the inner async mutex serializes transitions for
    /// that user.  Entries are never removed -- the map is bounded by the
    /// registered user population.
    entries: Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<UserEntry>>>>,
    store: StoreHandle,
    hub: FanoutHub,
    timeout: Duration,
    next_conn: AtomicU64,
    online: AtomicUsize,
}

#[derive(Clone)]
pub struct PresenceTracker {
    inner: Arc<TrackerInner>,
}

impl PresenceTracker {
    pub fn new(store: StoreHandle, hub: FanoutHub, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                entries: Mutex::new(HashMap::new()),
                store,
                hub,
                timeout,
                next_conn: AtomicU64::new(0),
                online: AtomicUsize::new(0),
            }),
        }
    }

    fn entry(&self, user: &UserId) -> Arc<tokio::sync::Mutex<UserEntry>> {
        let mut guard = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(guard.entry(user.clone()).or_default())
    }

    /// Register a new live connection for `user`.
    ///
    /// The 0 -> 1 transition persists Online (clearing `last_seen_at`) and
    /// notifies watchers; failure to persist refuses the connection so the
    /// store never lags a session the caller believes is bound.
    pub async fn connect(&self, user: &UserId) -> Result<ConnId, ServerError> {
        let entry = self.entry(user);
        let mut guard = entry.lock().await;

        if guard.connections.is_empty() {
            self.persist_online(user).await?;
            self.inner.online.fetch_add(1, Ordering::Relaxed);
            self.inner.hub.publish_presence(user, Presence::Online, None);
            info!(user = %user, "presence: online");
        }

        let id = self.inner.next_conn.fetch_add(1, Ordering::Relaxed);
        guard
            .connections
            .insert(id, Instant::now() + self.inner.timeout);
        Ok(ConnId(id))
    }

    /// Refresh a connection's liveness deadline.  Unknown connections are
    /// ignored (the sweep may have expired them already).
    pub async fn heartbeat(&self, user: &UserId, conn: ConnId) {
        let entry = self.entry(user);
        let mut guard = entry.lock().await;
        if let Some(deadline) = guard.connections.get_mut(&conn.0) {
            *deadline = Instant::now() + self.inner.timeout;
        }
    }

    /// Drop one connection.  Idempotent: dropping an already-expired or
    /// unknown connection is a no-op.
    pub async fn disconnect(&self, user: &UserId, conn: ConnId) {
        let entry = self.entry(user);
        let mut guard = entry.lock().await;

        if guard.connections.remove(&conn.0).is_none() {
            return;
        }
        if guard.connections.is_empty() {
            self.transition_offline(user).await;
        }
    }

    /// Force a user offline regardless of live connections (explicit
    /// sign-out).  No-op for users with no live connection.
    pub async fn force_offline(&self, user: &UserId) {
        let entry = self.entry(user);
        let mut guard = entry.lock().await;

        if guard.connections.is_empty() {
            return;
        }
        guard.connections.clear();
        self.transition_offline(user).await;
    }

    /// Expire connections whose liveness deadline has passed.
    ///
    /// Run periodically (at half the timeout) from the server main loop.
    pub async fn sweep(&self) {
        let entries: Vec<(UserId, Arc<tokio::sync::Mutex<UserEntry>>)> = {
            let guard = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
            guard
                .iter()
                .map(|(user, entry)| (user.clone(), Arc::clone(entry)))
                .collect()
        };

        let now = Instant::now();
        for (user, entry) in entries {
            let mut guard = entry.lock().await;
            let before = guard.connections.len();
            guard.connections.retain(|_, deadline| *deadline > now);
            let expired = before - guard.connections.len();

            if expired > 0 {
                debug!(user = %user, expired, "presence sweep expired connections");
            }
            if expired > 0 && guard.connections.is_empty() {
                self.transition_offline(&user).await;
            }
        }
    }

    /// Number of users currently online.
    pub fn online_count(&self) -> usize {
        self.inner.online.load(Ordering::Relaxed)
    }

    async fn persist_online(&self, user: &UserId) -> Result<(), ServerError> {
        let user = user.clone();
        self.inner
            .store
            .call(move |db| db.set_presence(&user, Presence::Online, None))
            .await?;
        Ok(())
    }

    /// Persist + announce the 1 -> 0 transition.  Called with the user's
    /// entry lock held and its connection set already empty.
    async fn transition_offline(&self, user: &UserId) {
        let last_seen = Utc::now();
        self.inner.online.fetch_sub(1, Ordering::Relaxed);

        let persisted = {
            let user = user.clone();
            self.inner
                .store
                .call(move |db| db.set_presence(&user, Presence::Offline, Some(last_seen)))
                .await
        };
        if let Err(e) = persisted {
            // The tracker remains authoritative for liveness; a stale store
            // row corrects itself on the next transition.
            warn!(user = %user, error = %e, "failed to persist offline transition");
        }

        self.inner
            .hub
            .publish_presence(user, Presence::Offline, Some(last_seen));
        info!(user = %user, "presence: offline");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use causerie_shared::proto::ServerFrame;
    use causerie_shared::types::User;
    use causerie_store::Database;
    use tokio::sync::mpsc;

    fn store_with_users(ids: &[&str]) -> StoreHandle {
        let db = Database::open_in_memory().unwrap();
        for id in ids {
            db.upsert_user(&User {
                id: UserId::new(*id),
                display_name: id.to_string(),
                email: format!("{id}@example.com"),
                presence: Presence::Offline,
                last_seen_at: None,
                avatar_url: None,
                push_token: None,
                created_at: Utc::now(),
            })
            .unwrap();
        }
        StoreHandle::new(db)
    }

    async fn stored_presence(store: &StoreHandle, id: &str) -> (Presence, bool) {
        let id = UserId::new(id);
        let user = store.call(move |db| db.get_user(&id)).await.unwrap();
        (user.presence, user.last_seen_at.is_some())
    }

    #[tokio::test]
    async fn presence_is_reference_counted() {
        let store = store_with_users(&["u1"]);
        let tracker = PresenceTracker::new(store.clone(), FanoutHub::new(), Duration::from_secs(60));
        let user = UserId::new("u1");

        let phone = tracker.connect(&user).await.unwrap();
        let laptop = tracker.connect(&user).await.unwrap();
        assert_eq!(tracker.online_count(), 1);

        tracker.disconnect(&user, phone).await;
        assert_eq!(stored_presence(&store, "u1").await, (Presence::Online, false));

        tracker.disconnect(&user, laptop).await;
        assert_eq!(tracker.online_count(), 0);
        assert_eq!(stored_presence(&store, "u1").await, (Presence::Offline, true));
    }

    #[tokio::test]
    async fn online_transition_clears_last_seen() {
        let store = store_with_users(&["u1"]);
        let tracker = PresenceTracker::new(store.clone(), FanoutHub::new(), Duration::from_secs(60));
        let user = UserId::new("u1");

        let conn = tracker.connect(&user).await.unwrap();
        tracker.disconnect(&user, conn).await;
        assert_eq!(stored_presence(&store, "u1").await, (Presence::Offline, true));

        let _conn = tracker.connect(&user).await.unwrap();
        assert_eq!(stored_presence(&store, "u1").await, (Presence::Online, false));
    }

    #[tokio::test]
    async fn duplicate_disconnect_is_a_no_op() {
        let store = store_with_users(&["u1"]);
        let tracker = PresenceTracker::new(store.clone(), FanoutHub::new(), Duration::from_secs(60));
        let user = UserId::new("u1");

        let a = tracker.connect(&user).await.unwrap();
        let b = tracker.connect(&user).await.unwrap();

        tracker.disconnect(&user, a).await;
        tracker.disconnect(&user, a).await;
        // Second device is still connected.
        assert_eq!(stored_presence(&store, "u1").await, (Presence::Online, false));

        tracker.disconnect(&user, b).await;
        assert_eq!(stored_presence(&store, "u1").await, (Presence::Offline, true));
    }

    #[tokio::test]
    async fn sweep_forces_offline_after_liveness_timeout() {
        let store = store_with_users(&["u1"]);
        let tracker =
            PresenceTracker::new(store.clone(), FanoutHub::new(), Duration::from_millis(30));
        let user = UserId::new("u1");

        // No explicit disconnect ever arrives.
        let _conn = tracker.connect(&user).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        tracker.sweep().await;

        let (presence, has_last_seen) = stored_presence(&store, "u1").await;
        assert_eq!(presence, Presence::Offline);
        assert!(has_last_seen);
        assert_eq!(tracker.online_count(), 0);
    }

    #[tokio::test]
    async fn heartbeat_extends_the_liveness_window() {
        let store = store_with_users(&["u1"]);
        let tracker =
            PresenceTracker::new(store.clone(), FanoutHub::new(), Duration::from_millis(80));
        let user = UserId::new("u1");

        let conn = tracker.connect(&user).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tracker.heartbeat(&user, conn).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // 100ms elapsed since connect, but only 50ms since the heartbeat.
        tracker.sweep().await;
        assert_eq!(stored_presence(&store, "u1").await, (Presence::Online, false));
    }

    #[tokio::test]
    async fn transitions_are_published_to_watchers() {
        let store = store_with_users(&["u1", "u2"]);
        let hub = FanoutHub::new();
        let tracker = PresenceTracker::new(store.clone(), hub.clone(), Duration::from_secs(60));
        let user = UserId::new("u2");

        let (tx, mut rx) = mpsc::channel(8);
        let _watch = hub.watch_user(user.clone(), UserId::new("u1"), tx);

        let conn = tracker.connect(&user).await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerFrame::Presence { presence: Presence::Online, last_seen_at: None, .. }
        ));

        tracker.disconnect(&user, conn).await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerFrame::Presence { presence: Presence::Offline, last_seen_at: Some(_), .. }
        ));
    }

    #[tokio::test]
    async fn force_offline_clears_all_connections() {
        let store = store_with_users(&["u1"]);
        let tracker = PresenceTracker::new(store.clone(), FanoutHub::new(), Duration::from_secs(60));
        let user = UserId::new("u1");

        let _a = tracker.connect(&user).await.unwrap();
        let _b = tracker.connect(&user).await.unwrap();

        tracker.force_offline(&user).await;
        assert_eq!(stored_presence(&store, "u1").await, (Presence::Offline, true));
        assert_eq!(tracker.online_count(), 0);

        // Idempotent.
        tracker.force_offline(&user).await;
        assert_eq!(tracker.online_count(), 0);
    }
}
