//! Wire format for direct messages.
//!
//! A [`Message`] is encoded as a Protocol Buffers record with eight numbered
//! fields. Absent optional fields decode to their empty value and unknown
//! field numbers are skipped, so new fields can be appended under new numbers
//! without breaking older peers.
//!
//! | # | field              | type   |
//! |---|--------------------|--------|
//! | 1 | `timestamp`        | uint64 |
//! | 2 | `sender_id`        | string |
//! | 3 | `sender_address`   | string |
//! | 4 | `sender_name`      | string |
//! | 5 | `receiver_id`      | string |
//! | 6 | `receiver_address` | string |
//! | 7 | `content`          | string |
//! | 8 | `message_id`       | string |

use chrono::Utc;
use prost::Message as _;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::constants::{MAX_MESSAGE_SIZE, MESSAGE_ID_SUFFIX_LEN};
use crate::error::DecodeError;

/// A direct message, as sent on the wire and stored in the message log.
#[derive(Clone, PartialEq, Eq, Hash, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Milliseconds since the Unix epoch, stamped by the sender.
    #[prost(uint64, tag = "1")]
    pub timestamp: u64,
    #[prost(string, tag = "2")]
    pub sender_id: String,
    #[prost(string, tag = "3")]
    pub sender_address: String,
    /// Empty when the sender has no display name.
    #[prost(string, tag = "4")]
    pub sender_name: String,
    #[prost(string, tag = "5")]
    pub receiver_id: String,
    #[prost(string, tag = "6")]
    pub receiver_address: String,
    #[prost(string, tag = "7")]
    pub content: String,
    /// `<timestamp>-<random suffix>`, unique per message.
    #[prost(string, tag = "8")]
    pub message_id: String,
}

impl Message {
    /// Serialize to the binary wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn sender_name(&self) -> Option<&str> {
        non_empty(&self.sender_name)
    }
}

/// Everything the sender chooses when composing a message. The codec adds
/// the timestamp and id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDraft {
    pub sender_id: String,
    pub sender_address: String,
    pub sender_name: Option<String>,
    pub receiver_id: String,
    pub receiver_address: String,
    pub content: String,
}

impl MessageDraft {
    /// Stamp the draft with the current time and a fresh message id.
    pub fn seal(self) -> Message {
        let timestamp = now_millis();
        Message {
            timestamp,
            message_id: generate_message_id(timestamp),
            sender_id: self.sender_id,
            sender_address: self.sender_address,
            sender_name: self.sender_name.unwrap_or_default(),
            receiver_id: self.receiver_id,
            receiver_address: self.receiver_address,
            content: self.content,
        }
    }
}

/// A sealed message together with its wire bytes.
#[derive(Debug, Clone)]
pub struct EncodedMessage {
    pub message: Message,
    pub bytes: Vec<u8>,
}

/// Seal a draft and encode it.
pub fn encode(draft: MessageDraft) -> EncodedMessage {
    let message = draft.seal();
    let bytes = message.to_bytes();
    EncodedMessage { message, bytes }
}

/// Decode an inbound frame.
///
/// Never panics. Fails on empty, oversized, malformed or truncated input, and
/// when any of `message_id`, `sender_address` or `receiver_address` is absent.
pub fn decode(data: &[u8]) -> Result<Message, DecodeError> {
    if data.is_empty() {
        return Err(DecodeError::Empty);
    }
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(DecodeError::Oversized {
            size: data.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let message = <Message as prost::Message>::decode(data)?;

    if message.message_id.is_empty() {
        return Err(DecodeError::MissingField("message_id"));
    }
    if message.sender_address.is_empty() {
        return Err(DecodeError::MissingField("sender_address"));
    }
    if message.receiver_address.is_empty() {
        return Err(DecodeError::MissingField("receiver_address"));
    }

    Ok(message)
}

/// Build a message id from a timestamp and a random alphanumeric suffix.
pub fn generate_message_id(timestamp: u64) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(MESSAGE_ID_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("{timestamp}-{suffix}")
}

/// The timestamp prefix of a well-formed message id.
pub fn message_id_timestamp(message_id: &str) -> Option<u64> {
    let (timestamp, suffix) = message_id.split_once('-')?;
    if suffix.len() < MESSAGE_ID_SUFFIX_LEN || !suffix.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    timestamp.parse().ok()
}

pub fn now_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default()
}

fn non_empty(value: &str) -> Option<&str> {
    (!value.is_empty()).then_some(value)
}
