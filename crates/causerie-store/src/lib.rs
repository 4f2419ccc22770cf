//! # causerie-store
//!
//! Durable storage for the Causerie backend, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` with typed CRUD helpers for users, conversations,
//! and messages, plus an async [`StoreHandle`] that routes calls through the
//! blocking thread pool.  Message + summary writes commit as one transaction;
//! everything above this layer treats the store as the single durability
//! authority.

pub mod conversations;
pub mod database;
pub mod handle;
pub mod messages;
pub mod migrations;
pub mod users;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use handle::StoreHandle;
