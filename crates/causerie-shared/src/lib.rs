//! # causerie-shared
//!
//! Domain types, wire protocol, and session-token verification shared by the
//! Causerie backend and its tooling.

pub mod error;
pub mod proto;
pub mod token;
pub mod types;

pub use error::TokenError;
pub use types::{Conversation, ConversationId, Message, Presence, User, UserId};
