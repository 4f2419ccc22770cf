use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// User identity = stable principal id assigned by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Principal ids are restricted to `[A-Za-z0-9-]`, 1..=64 chars.
    ///
    /// The underscore is reserved as the conversation-id separator, so ids
    /// containing one are rejected at the authentication boundary.
    pub fn is_well_formed(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= 64
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-')
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical conversation identifier: the two participant ids sorted
/// lexicographically and joined with `_`, so that the pair `(a, b)` and
/// `(b, a)` address the same conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConversationId(pub String);

impl ConversationId {
    /// Derive the canonical id for the unordered pair `{a, b}`.
    pub fn of(a: &UserId, b: &UserId) -> Self {
        let (lo, hi) = if a.0 <= b.0 { (a, b) } else { (b, a) };
        Self(format!("{}_{}", lo.0, hi.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split back into the sorted participant pair.
    ///
    /// Returns `None` for ids that are not of the canonical `lo_hi` form.
    pub fn participants(&self) -> Option<(UserId, UserId)> {
        let (lo, hi) = self.0.split_once('_')?;
        if lo.is_empty() || hi.is_empty() || hi.contains('_') {
            return None;
        }
        Some((UserId::new(lo), UserId::new(hi)))
    }

    /// Whether `user` is one of the two participants.
    pub fn includes(&self, user: &UserId) -> bool {
        self.participants()
            .map(|(lo, hi)| lo == *user || hi == *user)
            .unwrap_or(false)
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Live online/offline state as tracked by the presence subsystem.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    Offline,
}

impl Presence {
    pub fn is_online(self) -> bool {
        matches!(self, Presence::Online)
    }
}

/// A registered user record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    /// Stable principal id from the identity provider.
    pub id: UserId,
    pub display_name: String,
    pub email: String,
    pub presence: Presence,
    /// Set on the transition to Offline, cleared on the transition to Online.
    pub last_seen_at: Option<DateTime<Utc>>,
    /// URL of the stored profile picture, if one was uploaded.
    pub avatar_url: Option<String>,
    /// Opaque device push token, last write wins.
    pub push_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A two-party conversation with its denormalized last-message summary.
///
/// The record is created by the first append, so the summary fields are
/// always populated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    /// Lexicographically smaller participant id.
    pub participant_lo: UserId,
    /// Lexicographically larger participant id.
    pub participant_hi: UserId,
    pub last_message_text: String,
    pub last_sender_id: UserId,
    pub last_message_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A single chat message.  Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub text: String,
    /// Optional attachment reference (a URL into the object store).
    pub attachment_url: Option<String>,
    /// Per-conversation commit counter; breaks `created_at` ties.
    pub seq: i64,
    /// Server-assigned, monotonically non-decreasing within a conversation.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_id_is_symmetric() {
        let a = UserId::new("u1");
        let b = UserId::new("u2");
        assert_eq!(ConversationId::of(&a, &b), ConversationId::of(&b, &a));
        assert_eq!(ConversationId::of(&a, &b).as_str(), "u1_u2");
    }

    #[test]
    fn conversation_id_participants_round_trip() {
        let a = UserId::new("alice");
        let b = UserId::new("bob");
        let id = ConversationId::of(&a, &b);
        let (lo, hi) = id.participants().unwrap();
        assert_eq!(lo, a);
        assert_eq!(hi, b);
        assert!(id.includes(&a));
        assert!(id.includes(&b));
        assert!(!id.includes(&UserId::new("carol")));
    }

    #[test]
    fn malformed_conversation_ids_have_no_participants() {
        assert!(ConversationId("nounderscore".into()).participants().is_none());
        assert!(ConversationId("a_b_c".into()).participants().is_none());
        assert!(ConversationId("_b".into()).participants().is_none());
    }

    #[test]
    fn user_id_well_formedness() {
        assert!(UserId::new("u1").is_well_formed());
        assert!(UserId::new("AbC-123").is_well_formed());
        assert!(!UserId::new("").is_well_formed());
        assert!(!UserId::new("has_underscore").is_well_formed());
        assert!(!UserId::new("white space").is_well_formed());
        assert!(!UserId::new("x".repeat(65)).is_well_formed());
    }
}
