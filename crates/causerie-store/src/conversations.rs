//! Read operations for [`Conversation`] records.
//!
//! Conversations are created implicitly by the first message append (see
//! [`crate::database::Database::record_message`]); there is no standalone
//! create path.

use rusqlite::params;

use causerie_shared::types::{Conversation, ConversationId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::users::parse_timestamp;

impl Database {
    /// Fetch a single conversation by canonical id.
    pub fn get_conversation(&self, id: &ConversationId) -> Result<Conversation> {
        self.conn()
            .query_row(
                "SELECT id, participant_lo, participant_hi, last_message_text,
                        last_sender_id, last_message_at, created_at
                 FROM conversations
                 WHERE id = ?1",
                params![id.as_str()],
                row_to_conversation,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// List the conversations a user participates in, most recently active
    /// first.
    pub fn conversations_for_user(&self, user: &UserId) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, participant_lo, participant_hi, last_message_text,
                    last_sender_id, last_message_at, created_at
             FROM conversations
             WHERE participant_lo = ?1 OR participant_hi = ?1
             ORDER BY last_message_at DESC",
        )?;

        let rows = stmt.query_map(params![user.as_str()], row_to_conversation)?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` to a [`Conversation`].
fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let id: String = row.get(0)?;
    let participant_lo: String = row.get(1)?;
    let participant_hi: String = row.get(2)?;
    let last_message_text: String = row.get(3)?;
    let last_sender_id: String = row.get(4)?;
    let last_message_at: String = row.get(5)?;
    let created_at: String = row.get(6)?;

    Ok(Conversation {
        id: ConversationId(id),
        participant_lo: UserId::new(participant_lo),
        participant_hi: UserId::new(participant_hi),
        last_message_text,
        last_sender_id: UserId::new(last_sender_id),
        last_message_at: parse_timestamp(&last_message_at, 5)?,
        created_at: parse_timestamp(&created_at, 6)?,
    })
}
