//! Realtime fan-out hub.
//!
//! Holds the live subscriptions of connected sessions and pushes newly
//! committed messages and presence transitions into their delivery queues.
//! This is not a durability layer: the conversation log is the source of
//! truth, and a session that misses an event recovers by re-reading the log
//! on reconnect.
//!
//! Delivery is `try_send` into a bounded per-session queue.  A subscriber
//! whose queue is full is removed from the registry (disconnect-on-overflow)
//! so a slow session can never delay a sender.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use causerie_shared::proto::ServerFrame;
use causerie_shared::types::{ConversationId, Message, Presence, UserId};

/// A registered delivery target.
struct Entry {
    id: u64,
    /// The session's authenticated principal.
    user_id: UserId,
    sink: mpsc::Sender<ServerFrame>,
}

#[derive(Default)]
struct HubInner {
    next_id: AtomicU64,
    /// conversation id -> live subscribers of that conversation.
    conversations: Mutex<HashMap<ConversationId, Vec<Entry>>>,
    /// watched user id -> sessions watching that user's presence.
    watchers: Mutex<HashMap<UserId, Vec<Entry>>>,
}

/// Cheap-to-clone handle to the hub.
#[derive(Clone, Default)]
pub struct FanoutHub {
    inner: Arc<HubInner>,
}

/// Which registry a subscription lives in.
enum SubKey {
    Conversation(ConversationId),
    Watcher(UserId),
}

/// RAII handle for a registration.  Dropping it (or calling
/// [`Subscription::release`]) stops delivery; release is idempotent.
pub struct Subscription {
    hub: Weak<HubInner>,
    key: SubKey,
    id: u64,
    released: AtomicBool,
}

impl Subscription {
    /// Stop delivery to this subscription.  Safe to call multiple times.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(inner) = self.hub.upgrade() else {
            return;
        };
        match &self.key {
            SubKey::Conversation(conv) => {
                remove_entry(&inner.conversations, conv, self.id);
            }
            SubKey::Watcher(user) => {
                remove_entry(&inner.watchers, user, self.id);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

fn remove_entry<K: std::hash::Hash + Eq>(
    map: &Mutex<HashMap<K, Vec<Entry>>>,
    key: &K,
    id: u64,
) {
    let mut guard = map.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(list) = guard.get_mut(key) {
        list.retain(|entry| entry.id != id);
        if list.is_empty() {
            guard.remove(key);
        }
    }
}

impl FanoutHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `sink` for the live tail of a conversation.
    ///
    /// The caller has already authorized `user_id` as a participant.
    pub fn subscribe_conversation(
        &self,
        conversation: ConversationId,
        user_id: UserId,
        sink: mpsc::Sender<ServerFrame>,
    ) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut guard = self
            .inner
            .conversations
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        guard
            .entry(conversation.clone())
            .or_default()
            .push(Entry { id, user_id, sink });
        debug!(conversation = %conversation, id, "conversation subscription added");

        Subscription {
            hub: Arc::downgrade(&self.inner),
            key: SubKey::Conversation(conversation),
            id,
            released: AtomicBool::new(false),
        }
    }

    /// Register `sink` for presence transitions of `watched`.
    pub fn watch_user(
        &self,
        watched: UserId,
        watcher: UserId,
        sink: mpsc::Sender<ServerFrame>,
    ) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.inner.watchers.lock().unwrap_or_else(|e| e.into_inner());
        guard.entry(watched.clone()).or_default().push(Entry {
            id,
            user_id: watcher,
            sink,
        });
        debug!(watched = %watched, id, "presence watch added");

        Subscription {
            hub: Arc::downgrade(&self.inner),
            key: SubKey::Watcher(watched),
            id,
            released: AtomicBool::new(false),
        }
    }

    /// Push a committed message to every live subscriber of its conversation.
    ///
    /// Returns `true` when at least one of `receiver`'s own sessions took
    /// the delivery -- the caller uses this to decide between live push and
    /// push notification (never both).
    pub fn publish_message(&self, message: &Message, receiver: &UserId) -> bool {
        let frame = ServerFrame::Message {
            message: message.clone(),
        };

        let mut delivered_to_receiver = false;
        let mut guard = self
            .inner
            .conversations
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        if let Some(list) = guard.get_mut(&message.conversation_id) {
            list.retain(|entry| match entry.sink.try_send(frame.clone()) {
                Ok(()) => {
                    if entry.user_id == *receiver {
                        delivered_to_receiver = true;
                    }
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        conversation = %message.conversation_id,
                        subscriber = %entry.user_id,
                        "delivery queue full, disconnecting subscriber"
                    );
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
            if list.is_empty() {
                guard.remove(&message.conversation_id);
            }
        }

        delivered_to_receiver
    }

    /// Push a presence transition to every session watching `user_id`.
    pub fn publish_presence(
        &self,
        user_id: &UserId,
        presence: Presence,
        last_seen_at: Option<DateTime<Utc>>,
    ) {
        let frame = ServerFrame::Presence {
            user_id: user_id.clone(),
            presence,
            last_seen_at,
        };

        let mut guard = self.inner.watchers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = guard.get_mut(user_id) {
            list.retain(|entry| match entry.sink.try_send(frame.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        watched = %user_id,
                        subscriber = %entry.user_id,
                        "delivery queue full, disconnecting watcher"
                    );
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
            if list.is_empty() {
                guard.remove(user_id);
            }
        }
    }

    /// Number of live conversation subscriptions (for diagnostics).
    pub fn subscription_count(&self) -> usize {
        let guard = self
            .inner
            .conversations
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        guard.values().map(Vec::len).sum()
    }
}
