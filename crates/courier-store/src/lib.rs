//! # courier-store
//!
//! Local storage for Courier, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle wrapping a
//! `rusqlite::Connection`. It implements the [`MessageLog`] the delivery
//! path persists into and the [`Notifier`] it signals, and builds the
//! per-counterpart conversation list from the log.

pub mod conversations;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod notifications;

mod error;

pub use conversations::{aggregate_conversations, ConversationSummary};
pub use database::Database;
pub use error::{Result, StoreError};
pub use messages::MessageLog;
pub use models::*;
pub use notifications::Notifier;
