//! WebSocket wire frames exchanged between a client session and the server.
//!
//! Frames are JSON with an external `type` tag so browser and mobile clients
//! can match on a single discriminator field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConversationId, Message, Presence, UserId};

/// Frames sent by the client over an established session socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Start receiving the live tail of a conversation.
    Subscribe { conversation_id: ConversationId },

    /// Stop receiving a conversation's tail.
    Unsubscribe { conversation_id: ConversationId },

    /// Start receiving presence transitions for a user.
    Watch { user_id: UserId },

    /// Stop watching a user's presence.
    Unwatch { user_id: UserId },

    /// Liveness signal; resets the connection's presence deadline.
    Heartbeat,
}

/// Frames pushed by the server to a session socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// A newly committed message in a subscribed conversation.
    Message { message: Message },

    /// A presence transition for a watched user.
    Presence {
        user_id: UserId,
        presence: Presence,
        last_seen_at: Option<DateTime<Utc>>,
    },

    /// A request-scoped error (the socket stays open).
    Error { code: ErrorCode, message: String },
}

/// Machine-readable error discriminator for [`ServerFrame::Error`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    BadRequest,
}
