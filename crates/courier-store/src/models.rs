//! Record types read from and written to the local database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to a UI layer or printed as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_shared::protocol::Message;

// ---------------------------------------------------------------------------
// StoredMessage
// ---------------------------------------------------------------------------

/// A message from the log with its receiver-side state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub message: Message,
    /// Whether the receiver has read it. Meaningless for our own sent messages.
    pub read: bool,
    /// Last known display name of the receiver.
    pub receiver_name: Option<String>,
}

// ---------------------------------------------------------------------------
// ReadTarget
// ---------------------------------------------------------------------------

/// What `mark_read` should flag as read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadTarget {
    /// One message, by id.
    Message(String),
    /// Every message received by this user id.
    AllFor(String),
}

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A party seen in the message log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub user_id: String,
    pub address: String,
    pub display_name: Option<String>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    Message,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::Message => "MESSAGE",
        }
    }
}

/// A signal for the user `user_id` that `actor_id` did something.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub user_id: String,
    pub kind: NotificationKind,
    pub actor_id: String,
    pub message_id: Option<String>,
    pub preview: String,
}

impl Notification {
    /// Maximum characters of message content carried in `preview`.
    pub const PREVIEW_CHARS: usize = 80;

    /// Notification to the receiver of `message`.
    pub fn for_message(message: &Message) -> Self {
        Self {
            user_id: message.receiver_id.clone(),
            kind: NotificationKind::Message,
            actor_id: message.sender_id.clone(),
            message_id: Some(message.message_id.clone()),
            preview: message.content.chars().take(Self::PREVIEW_CHARS).collect(),
        }
    }
}
