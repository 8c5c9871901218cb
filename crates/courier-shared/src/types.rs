use serde::{Deserialize, Serialize};

use crate::error::TopicError;
use crate::protocol::MessageDraft;
use crate::topic::{normalize_address, DmTopic};

/// The user this process sends and receives as.
///
/// `user_id` is the opaque account identifier used by the message log;
/// `address` is the wallet address that names P2P channels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalIdentity {
    pub user_id: String,
    pub address: String,
    pub display_name: Option<String>,
}

impl LocalIdentity {
    /// Create an identity, normalizing the address.
    pub fn new(
        user_id: impl Into<String>,
        address: &str,
        display_name: Option<String>,
    ) -> Result<Self, TopicError> {
        Ok(Self {
            user_id: user_id.into(),
            address: normalize_address(address)?,
            display_name: display_name.filter(|name| !name.trim().is_empty()),
        })
    }

    /// The channel this identity shares with `counterpart_address`.
    pub fn topic_with(&self, counterpart_address: &str) -> Result<DmTopic, TopicError> {
        DmTopic::between(&self.address, counterpart_address)
    }

    /// Start a message from this identity.
    pub fn draft_to(
        &self,
        receiver_id: impl Into<String>,
        receiver_address: &str,
        content: impl Into<String>,
    ) -> Result<MessageDraft, TopicError> {
        Ok(MessageDraft {
            sender_id: self.user_id.clone(),
            sender_address: self.address.clone(),
            sender_name: self.display_name.clone(),
            receiver_id: receiver_id.into(),
            receiver_address: normalize_address(receiver_address)?,
            content: content.into(),
        })
    }

    /// Whether `address` (any case) belongs to this identity.
    pub fn owns_address(&self, address: &str) -> bool {
        address.trim().eq_ignore_ascii_case(&self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_normalizes_address() {
        let me = LocalIdentity::new("u1", " 0xABCDEF ", Some("  ".into())).unwrap();
        assert_eq!(me.address, "0xabcdef");
        assert_eq!(me.display_name, None);
        assert!(me.owns_address("0xAbCdEf"));
    }

    #[test]
    fn test_draft_to_fills_sender() {
        let me = LocalIdentity::new("u1", "0xaaa", Some("Me".into())).unwrap();
        let draft = me.draft_to("u2", "0xBBB", "hello").unwrap();
        assert_eq!(draft.sender_id, "u1");
        assert_eq!(draft.sender_address, "0xaaa");
        assert_eq!(draft.receiver_address, "0xbbb");
        assert!(me.draft_to("u2", "", "hello").is_err());
    }

    #[test]
    fn test_topic_with_matches_counterpart() {
        let me = LocalIdentity::new("u1", "0xaaa", None).unwrap();
        let them = LocalIdentity::new("u2", "0xbbb", None).unwrap();
        assert_eq!(
            me.topic_with(&them.address).unwrap(),
            them.topic_with(&me.address).unwrap()
        );
    }
}
