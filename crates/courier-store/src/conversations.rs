//! Per-counterpart conversation list built from the message log.
//!
//! A [`ConversationSummary`] is a read model: it is derived on demand from a
//! user's sent and received messages and never persisted.

use std::collections::HashMap;

use serde::Serialize;

use courier_shared::constants::UNKNOWN_DISPLAY_NAME;

use crate::database::Database;
use crate::error::Result;
use crate::messages::MessageLog;
use crate::models::StoredMessage;

/// The latest state of a conversation with one counterpart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub counterpart_id: String,
    pub counterpart_address: String,
    pub counterpart_name: Option<String>,
    pub last_message: String,
    pub last_message_time: u64,
    pub unread_count: u32,
}

impl ConversationSummary {
    /// The counterpart's name, or a placeholder when none is known.
    pub fn display_name(&self) -> &str {
        self.counterpart_name.as_deref().unwrap_or(UNKNOWN_DISPLAY_NAME)
    }
}

/// Merge a user's sent and received messages into one summary per counterpart,
/// most recent activity first.
///
/// Sent messages seed summaries first; a received message replaces the
/// displayed last message only when strictly newer. Every unread received
/// message counts toward `unread_count`, whether or not it is the one shown.
/// Ties in time keep first-seen order.
pub fn aggregate_conversations(
    sent: &[StoredMessage],
    received: &[StoredMessage],
) -> Vec<ConversationSummary> {
    let mut summaries: Vec<ConversationSummary> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for stored in sent {
        let message = &stored.message;
        if index.contains_key(message.receiver_id.as_str()) {
            continue;
        }
        index.insert(&message.receiver_id, summaries.len());
        summaries.push(ConversationSummary {
            counterpart_id: message.receiver_id.clone(),
            counterpart_address: message.receiver_address.clone(),
            counterpart_name: stored.receiver_name.clone(),
            last_message: message.content.clone(),
            last_message_time: message.timestamp,
            unread_count: 0,
        });
    }

    for stored in received {
        let message = &stored.message;
        let unread = u32::from(!stored.read);

        match index.get(message.sender_id.as_str()) {
            Some(&i) => {
                let summary = &mut summaries[i];
                if message.timestamp > summary.last_message_time {
                    summary.last_message = message.content.clone();
                    summary.last_message_time = message.timestamp;
                }
                if summary.counterpart_name.is_none() {
                    summary.counterpart_name = message.sender_name().map(str::to_string);
                }
                summary.unread_count += unread;
            }
            None => {
                index.insert(&message.sender_id, summaries.len());
                summaries.push(ConversationSummary {
                    counterpart_id: message.sender_id.clone(),
                    counterpart_address: message.sender_address.clone(),
                    counterpart_name: message.sender_name().map(str::to_string),
                    last_message: message.content.clone(),
                    last_message_time: message.timestamp,
                    unread_count: unread,
                });
            }
        }
    }

    // `sort_by` is stable, so equal times keep insertion order.
    summaries.sort_by(|a, b| b.last_message_time.cmp(&a.last_message_time));
    summaries
}

impl Database {
    /// Conversation list for `user_id`, straight from the log.
    pub fn conversations_for(&self, user_id: &str) -> Result<Vec<ConversationSummary>> {
        let sent = self.find_messages_by_sender(user_id)?;
        let received = self.find_messages_by_receiver(user_id)?;
        Ok(aggregate_conversations(&sent, &received))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_shared::protocol::Message;

    fn stored(from: &str, to: &str, ts: u64, content: &str, read: bool) -> StoredMessage {
        StoredMessage {
            message: Message {
                timestamp: ts,
                sender_id: from.into(),
                sender_address: format!("0x{from}"),
                sender_name: String::new(),
                receiver_id: to.into(),
                receiver_address: format!("0x{to}"),
                content: content.into(),
                message_id: format!("{ts}-{from}{to}xxxxxx"),
            },
            read,
            receiver_name: None,
        }
    }

    fn scenario() -> (Vec<StoredMessage>, Vec<StoredMessage>) {
        let sent = vec![stored("u", "a", 10, "hi", true), stored("u", "b", 5, "yo", true)];
        let received = vec![stored("a", "u", 20, "hey", false), stored("c", "u", 1, "sup", true)];
        (sent, received)
    }

    #[test]
    fn test_mixed_sent_and_received() {
        let (sent, received) = scenario();
        let out = aggregate_conversations(&sent, &received);

        let view: Vec<_> = out
            .iter()
            .map(|s| (s.counterpart_id.as_str(), s.last_message.as_str(), s.last_message_time, s.unread_count))
            .collect();
        assert_eq!(
            view,
            [("a", "hey", 20, 1), ("b", "yo", 5, 0), ("c", "sup", 1, 0)]
        );
        assert_eq!(out[0].counterpart_address, "0xa");
    }

    #[test]
    fn test_aggregation_is_pure() {
        let (sent, received) = scenario();
        assert_eq!(
            aggregate_conversations(&sent, &received),
            aggregate_conversations(&sent, &received)
        );
    }

    #[test]
    fn test_empty_input() {
        assert!(aggregate_conversations(&[], &[]).is_empty());
    }

    #[test]
    fn test_older_unread_counts_but_does_not_replace() {
        let sent = vec![stored("u", "a", 30, "latest", true)];
        let received = vec![
            stored("a", "u", 20, "older", false),
            stored("a", "u", 10, "oldest", false),
        ];
        let out = aggregate_conversations(&sent, &received);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].last_message, "latest");
        assert_eq!(out[0].unread_count, 2);
    }

    #[test]
    fn test_equal_times_keep_first_seen_order() {
        let sent = vec![stored("u", "b", 7, "x", true), stored("u", "a", 7, "y", true)];
        let out = aggregate_conversations(&sent, &[]);
        assert_eq!(out[0].counterpart_id, "b");
        assert_eq!(out[1].counterpart_id, "a");
    }

    #[test]
    fn test_display_name_placeholder() {
        let mut received = stored("a", "u", 1, "hi", true);
        let out = aggregate_conversations(&[], std::slice::from_ref(&received));
        assert_eq!(out[0].display_name(), UNKNOWN_DISPLAY_NAME);
        assert_eq!(out[0].counterpart_name, None);

        received.message.sender_name = "Alice".into();
        let out = aggregate_conversations(&[], &[received]);
        assert_eq!(out[0].display_name(), "Alice");
    }

    #[test]
    fn test_conversations_for_reads_log() {
        let db = Database::open_in_memory().unwrap();
        let (sent, received) = scenario();
        for s in sent.iter().chain(&received) {
            db.append_message(&s.message).unwrap();
        }
        // The log marks everything unread on append; mirror the scenario.
        db.mark_read(&crate::models::ReadTarget::Message(received[1].message.message_id.clone()))
            .unwrap();

        let out = db.conversations_for("u").unwrap();
        let ids: Vec<_> = out.iter().map(|s| s.counterpart_id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert_eq!(out[0].unread_count, 1);
        assert_eq!(out[2].unread_count, 0);
    }
}
