//! CRUD operations for [`User`] records -- the identity store.
//!
//! Mutations follow an explicit per-field last-write-wins contract: `upsert`
//! owns the identity-provider fields (display name on creation, email), while
//! the targeted setters own the client- and presence-driven fields.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use causerie_shared::types::{Presence, User, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};

impl Database {
    /// Create-or-merge a user record, idempotent on `id`.
    ///
    /// On conflict only `display_name` and `email` are refreshed; presence,
    /// push token, and avatar keep their stored values.
    pub fn upsert_user(&self, user: &User) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (id, display_name, email, online, last_seen_at, avatar_url, push_token, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                 display_name = excluded.display_name,
                 email        = excluded.email",
            params![
                user.id.as_str(),
                user.display_name,
                user.email,
                user.presence.is_online() as i64,
                user.last_seen_at.map(|t| t.to_rfc3339()),
                user.avatar_url,
                user.push_token,
                user.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Fetch a single user by id.
    pub fn get_user(&self, id: &UserId) -> Result<User> {
        self.conn()
            .query_row(
                "SELECT id, display_name, email, online, last_seen_at, avatar_url, push_token, created_at
                 FROM users WHERE id = ?1",
                params![id.as_str()],
                row_to_user,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Fetch a user's push token, `None` when the user has no registered
    /// device.  Fails with [`StoreError::NotFound`] for unknown users.
    pub fn get_push_token(&self, id: &UserId) -> Result<Option<String>> {
        self.conn()
            .query_row(
                "SELECT push_token FROM users WHERE id = ?1",
                params![id.as_str()],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .ok_or(StoreError::NotFound)
    }

    /// List all users, ordered by display name.
    pub fn list_users(&self) -> Result<Vec<User>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, display_name, email, online, last_seen_at, avatar_url, push_token, created_at
             FROM users
             ORDER BY display_name COLLATE NOCASE ASC, id ASC",
        )?;

        let rows = stmt.query_map([], row_to_user)?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    /// Number of registered users.
    pub fn count_users(&self) -> Result<i64> {
        Ok(self
            .conn()
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?)
    }

    /// Replace the display name.
    pub fn set_display_name(&self, id: &UserId, display_name: &str) -> Result<()> {
        self.update_user_field(
            "UPDATE users SET display_name = ?2 WHERE id = ?1",
            params![id.as_str(), display_name],
        )
    }

    /// Replace the avatar URL.
    pub fn set_avatar_url(&self, id: &UserId, avatar_url: &str) -> Result<()> {
        self.update_user_field(
            "UPDATE users SET avatar_url = ?2 WHERE id = ?1",
            params![id.as_str(), avatar_url],
        )
    }

    /// Replace the device push token, last write wins.
    pub fn set_push_token(&self, id: &UserId, token: &str) -> Result<()> {
        self.update_user_field(
            "UPDATE users SET push_token = ?2 WHERE id = ?1",
            params![id.as_str(), token],
        )
    }

    /// Persist a presence transition.
    ///
    /// The caller (the presence tracker) owns the state machine; this just
    /// records its outcome.
    pub fn set_presence(
        &self,
        id: &UserId,
        presence: Presence,
        last_seen_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.update_user_field(
            "UPDATE users SET online = ?2, last_seen_at = ?3 WHERE id = ?1",
            params![
                id.as_str(),
                presence.is_online() as i64,
                last_seen_at.map(|t| t.to_rfc3339()),
            ],
        )
    }

    fn update_user_field<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<()> {
        let affected = self.conn().execute(sql, params)?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` to a [`User`].
pub(crate) fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let id: String = row.get(0)?;
    let display_name: String = row.get(1)?;
    let email: String = row.get(2)?;
    let online: i64 = row.get(3)?;
    let last_seen_str: Option<String> = row.get(4)?;
    let avatar_url: Option<String> = row.get(5)?;
    let push_token: Option<String> = row.get(6)?;
    let created_str: String = row.get(7)?;

    let last_seen_at = last_seen_str
        .map(|s| parse_timestamp(&s, 4))
        .transpose()?;
    let created_at = parse_timestamp(&created_str, 7)?;

    Ok(User {
        id: UserId::new(id),
        display_name,
        email,
        presence: if online != 0 {
            Presence::Online
        } else {
            Presence::Offline
        },
        last_seen_at,
        avatar_url,
        push_token,
        created_at,
    })
}

/// Parse an RFC-3339 column, reporting the column index on failure.
pub(crate) fn parse_timestamp(s: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
        })
}
