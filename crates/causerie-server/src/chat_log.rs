//! The conversation log: ordered, durable message appends and reads.
//!
//! `send` is the append operation.  Appends to the same conversation
//! are serialized through a per-conversation mutex, which lets the log hand
//! out a `created_at` that never moves backwards (wall clock clamped to the
//! previous append) and a strictly increasing per-conversation `seq`.
//! Appends to different conversations share no lock and run fully in
//! parallel.
//!
//! A send returns once the message and the conversation summary are
//! durably committed; live fan-out and push dispatch happen after commit
//! and can never roll it back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use causerie_shared::types::{Conversation, ConversationId, Message, UserId};
use causerie_store::{StoreError, StoreHandle};

use crate::error::ServerError;
use crate::fanout::FanoutHub;
use crate::notify::Notifier;

/// Upper bound on message text, in bytes.
const MAX_TEXT_LEN: usize = 4096;

/// Append serialization state for one conversation.
#[derive(Default)]
struct AppendState {
    /// Whether `last_created_at` / `next_seq` were loaded from the store.
    seeded: bool,
    last_created_at: Option<DateTime<Utc>>,
    next_seq: i64,
}

struct LogInner {
    store: StoreHandle,
    hub: FanoutHub,
    notifier: Notifier,
    /// Per-conversation append locks, created lazily.  Entries are small
    /// and bounded by the number of active conversations.
    appenders: Mutex<HashMap<ConversationId, Arc<tokio::sync::Mutex<AppendState>>>>,
}

#[derive(Clone)]
pub struct ChatLog {
    inner: Arc<LogInner>,
}

impl ChatLog {
    pub fn new(store: StoreHandle, hub: FanoutHub, notifier: Notifier) -> Self {
        Self {
            inner: Arc::new(LogInner {
                store,
                hub,
                notifier,
                appenders: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn appender(&self, conversation: &ConversationId) -> Arc<tokio::sync::Mutex<AppendState>> {
        let mut guard = self
            .inner
            .appenders
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        Arc::clone(guard.entry(conversation.clone()).or_default())
    }

    /// Append a message from `sender` to `receiver` and deliver it.
    ///
    /// Creates the conversation on first use.  After the commit, the
    /// message goes to every live subscriber of the conversation; when none
    /// of the receiver's sessions is subscribed, a push notification is
    /// dispatched instead (never both).
    ///
    /// There is no idempotency key: re-sending an identical request
    /// appends a second message.
    pub async fn send(
        &self,
        sender: &UserId,
        receiver: &UserId,
        text: String,
        attachment_url: Option<String>,
    ) -> Result<Message, ServerError> {
        if text.trim().is_empty() {
            return Err(ServerError::BadRequest("message text is empty".into()));
        }
        if text.len() > MAX_TEXT_LEN {
            return Err(ServerError::BadRequest(format!(
                "message text exceeds {MAX_TEXT_LEN} bytes"
            )));
        }
        if sender == receiver {
            return Err(ServerError::BadRequest(
                "a conversation needs two distinct participants".into(),
            ));
        }

        // "No such user" is a semantic failure the sender should see, as
        // opposed to a transient storage error.
        {
            let receiver = receiver.clone();
            self.inner
                .store
                .call(move |db| db.get_user(&receiver))
                .await
                .map_err(|e| match e {
                    StoreError::NotFound => {
                        ServerError::NotFound("no such user".into())
                    }
                    other => ServerError::Storage(other),
                })?;
        }

        let conversation = ConversationId::of(sender, receiver);
        let appender = self.appender(&conversation);

        let message = {
            let mut state = appender.lock().await;

            if !state.seeded {
                let conv = conversation.clone();
                let seeded = self
                    .inner
                    .store
                    .call(move |db| db.last_append_state(&conv))
                    .await?;
                if let Some((created_at, seq)) = seeded {
                    state.last_created_at = Some(created_at);
                    state.next_seq = seq + 1;
                }
                state.seeded = true;
            }

            // Server-assigned timestamp, clamped so it never precedes the
            // previous append in this conversation.
            let mut created_at = Utc::now();
            if let Some(last) = state.last_created_at {
                if created_at < last {
                    created_at = last;
                }
            }

            let message = Message {
                id: Uuid::new_v4(),
                conversation_id: conversation.clone(),
                sender_id: sender.clone(),
                text,
                attachment_url,
                seq: state.next_seq,
                created_at,
            };

            {
                let message = message.clone();
                self.inner
                    .store
                    .call(move |db| db.record_message(&message))
                    .await?;
            }

            state.last_created_at = Some(created_at);
            state.next_seq += 1;
            message
            // Lock released here; the next append for this conversation may
            // proceed while we fan out below.
        };

        let delivered = self.inner.hub.publish_message(&message, receiver);
        if !delivered {
            debug!(
                conversation = %message.conversation_id,
                receiver = %receiver,
                "receiver has no live subscription, dispatching push"
            );
            self.inner.notifier.dispatch(receiver.clone(), &message);
        }

        Ok(message)
    }

    /// Full ordered history of a conversation.
    ///
    /// A conversation that has never been created reads as empty: callers
    /// asked for messages, and there are none.
    pub async fn history(&self, conversation: &ConversationId) -> Result<Vec<Message>, ServerError> {
        let conv = conversation.clone();
        match self
            .inner
            .store
            .call(move |db| db.messages_for_conversation(&conv))
            .await
        {
            Ok(messages) => Ok(messages),
            Err(StoreError::NotFound) => Ok(Vec::new()),
            Err(e) => Err(ServerError::Storage(e)),
        }
    }

    /// Conversations involving `user`, most recently active first.
    pub async fn conversations_for(&self, user: &UserId) -> Result<Vec<Conversation>, ServerError> {
        let user = user.clone();
        Ok(self
            .inner
            .store
            .call(move |db| db.conversations_for_user(&user))
            .await?)
    }
}
