//! Append and read operations for [`Message`] records -- the durable half of
//! the conversation log.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use causerie_shared::types::{ConversationId, Message, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::users::parse_timestamp;

impl Database {
    /// Commit a message and its conversation summary as one atomic unit.
    ///
    /// Creates the conversation row on first append, otherwise refreshes the
    /// denormalized last-message fields.  A reader can never observe the
    /// summary without the message or vice versa -- both writes share one
    /// transaction.
    ///
    /// The caller is responsible for `created_at` monotonicity and `seq`
    /// assignment (serialized per conversation above the store).
    pub fn record_message(&mut self, message: &Message) -> Result<()> {
        let (lo, hi) = message.conversation_id.participants().ok_or_else(|| {
            StoreError::InvalidRecord(format!(
                "non-canonical conversation id: {}",
                message.conversation_id
            ))
        })?;

        let created_at = message.created_at.to_rfc3339();

        let tx = self.conn_mut().transaction()?;

        tx.execute(
            "INSERT INTO conversations
                 (id, participant_lo, participant_hi, last_message_text,
                  last_sender_id, last_message_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 last_message_text = excluded.last_message_text,
                 last_sender_id    = excluded.last_sender_id,
                 last_message_at   = excluded.last_message_at",
            params![
                message.conversation_id.as_str(),
                lo.as_str(),
                hi.as_str(),
                message.text,
                message.sender_id.as_str(),
                created_at,
            ],
        )?;

        tx.execute(
            "INSERT INTO messages
                 (id, conversation_id, seq, sender_id, text, attachment_url, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id.to_string(),
                message.conversation_id.as_str(),
                message.seq,
                message.sender_id.as_str(),
                message.text,
                message.attachment_url,
                created_at,
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// All messages of a conversation, ordered by `created_at` then commit
    /// order.
    ///
    /// Fails with [`StoreError::NotFound`] when the conversation has never
    /// been created; callers that prefer "empty" semantics map it themselves.
    pub fn messages_for_conversation(&self, id: &ConversationId) -> Result<Vec<Message>> {
        let exists: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM conversations WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NotFound);
        }

        let mut stmt = self.conn().prepare(
            "SELECT id, conversation_id, seq, sender_id, text, attachment_url, created_at
             FROM messages
             WHERE conversation_id = ?1
             ORDER BY created_at ASC, seq ASC",
        )?;

        let rows = stmt.query_map(params![id.as_str()], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// The latest committed `(created_at, seq)` pair for a conversation, or
    /// `None` when no message exists yet.  Seeds the append serializer after
    /// a restart.
    pub fn last_append_state(
        &self,
        id: &ConversationId,
    ) -> Result<Option<(DateTime<Utc>, i64)>> {
        let row: Option<(String, i64)> = self
            .conn()
            .query_row(
                "SELECT created_at, seq FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY seq DESC
                 LIMIT 1",
                params![id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((ts, seq)) => Ok(Some((parse_timestamp(&ts, 0)?, seq))),
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` to a [`Message`].
fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let conversation_id: String = row.get(1)?;
    let seq: i64 = row.get(2)?;
    let sender_id: String = row.get(3)?;
    let text: String = row.get(4)?;
    let attachment_url: Option<String> = row.get(5)?;
    let created_str: String = row.get(6)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Message {
        id,
        conversation_id: ConversationId(conversation_id),
        sender_id: UserId::new(sender_id),
        text,
        attachment_url,
        seq,
        created_at: parse_timestamp(&created_str, 6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(conv: &ConversationId, sender: &str, text: &str, seq: i64) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id: conv.clone(),
            sender_id: UserId::new(sender),
            text: text.to_string(),
            attachment_url: None,
            seq,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn record_and_read_back_in_order() {
        let mut db = Database::open_in_memory().unwrap();
        let conv = ConversationId::of(&UserId::new("u1"), &UserId::new("u2"));

        for (i, text) in ["one", "two", "three"].iter().enumerate() {
            db.record_message(&msg(&conv, "u1", text, i as i64)).unwrap();
        }

        let messages = db.messages_for_conversation(&conv).unwrap();
        let texts: Vec<_> = messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
    }

    #[test]
    fn summary_tracks_latest_message() {
        let mut db = Database::open_in_memory().unwrap();
        let conv = ConversationId::of(&UserId::new("u1"), &UserId::new("u2"));

        db.record_message(&msg(&conv, "u1", "first", 0)).unwrap();
        db.record_message(&msg(&conv, "u2", "second", 1)).unwrap();

        let summary = db.get_conversation(&conv).unwrap();
        assert_eq!(summary.last_message_text, "second");
        assert_eq!(summary.last_sender_id, UserId::new("u2"));
        assert_eq!(summary.participant_lo, UserId::new("u1"));
        assert_eq!(summary.participant_hi, UserId::new("u2"));
    }

    #[test]
    fn unknown_conversation_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        let conv = ConversationId("u1_u9".into());
        assert!(matches!(
            db.messages_for_conversation(&conv),
            Err(StoreError::NotFound)
        ));
        assert!(matches!(db.get_conversation(&conv), Err(StoreError::NotFound)));
    }

    #[test]
    fn failed_append_leaves_summary_untouched() {
        let mut db = Database::open_in_memory().unwrap();
        let conv = ConversationId::of(&UserId::new("u1"), &UserId::new("u2"));

        db.record_message(&msg(&conv, "u1", "kept", 0)).unwrap();
        // Duplicate seq violates UNIQUE(conversation_id, seq); the whole
        // transaction must roll back, including the summary update.
        let dup = msg(&conv, "u2", "lost", 0);
        assert!(db.record_message(&dup).is_err());

        let summary = db.get_conversation(&conv).unwrap();
        assert_eq!(summary.last_message_text, "kept");
        assert_eq!(db.messages_for_conversation(&conv).unwrap().len(), 1);
    }

    #[test]
    fn non_canonical_conversation_id_is_rejected() {
        let mut db = Database::open_in_memory().unwrap();
        let bad = Message {
            conversation_id: ConversationId("nounderscore".into()),
            ..msg(&ConversationId("a_b".into()), "a", "x", 0)
        };
        assert!(matches!(
            db.record_message(&bad),
            Err(StoreError::InvalidRecord(_))
        ));
    }

    #[test]
    fn last_append_state_tracks_latest_seq() {
        let mut db = Database::open_in_memory().unwrap();
        let conv = ConversationId::of(&UserId::new("u1"), &UserId::new("u2"));

        assert!(db.last_append_state(&conv).unwrap().is_none());

        let m = msg(&conv, "u1", "hello", 7);
        db.record_message(&m).unwrap();

        let (ts, seq) = db.last_append_state(&conv).unwrap().unwrap();
        assert_eq!(seq, 7);
        assert_eq!(ts.timestamp_millis(), m.created_at.timestamp_millis());
    }

    #[test]
    fn conversations_for_user_orders_by_activity() {
        let mut db = Database::open_in_memory().unwrap();
        let u1 = UserId::new("u1");
        let a = ConversationId::of(&u1, &UserId::new("u2"));
        let b = ConversationId::of(&u1, &UserId::new("u3"));

        let mut first = msg(&a, "u1", "old", 0);
        first.created_at = Utc::now() - chrono::Duration::minutes(5);
        db.record_message(&first).unwrap();
        db.record_message(&msg(&b, "u1", "new", 0)).unwrap();

        let convs = db.conversations_for_user(&u1).unwrap();
        assert_eq!(convs.len(), 2);
        assert_eq!(convs[0].id, b);
        assert_eq!(convs[1].id, a);

        assert!(db.conversations_for_user(&UserId::new("u9")).unwrap().is_empty());
    }
}
