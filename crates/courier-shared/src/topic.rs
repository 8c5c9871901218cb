//! Direct-message channel naming.
//!
//! Two parties meet on a topic derived only from their account addresses, so
//! each side computes the same channel name on its own:
//!
//! ```text
//! /courier/1/dm-<low>-<high>/proto
//! ```
//!
//! `<low>` and `<high>` are the two lower-cased addresses in lexicographic
//! order.

use std::fmt;

use crate::constants::{
    DM_SEGMENT_PREFIX, MAX_ADDRESS_LEN, TOPIC_ENCODING, TOPIC_NAMESPACE, TOPIC_VERSION,
};
use crate::error::TopicError;

/// A validated pair of participants and the topic they share.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DmTopic {
    low: String,
    high: String,
}

impl DmTopic {
    /// Build the channel shared by `a` and `b`. Argument order does not matter.
    pub fn between(a: &str, b: &str) -> Result<Self, TopicError> {
        let a = normalize_address(a)?;
        let b = normalize_address(b)?;
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Ok(Self { low, high })
    }

    /// Recover the participants from a topic string produced by [`DmTopic::to_topic`].
    ///
    /// Returns `None` for anything that is not a well-formed direct-message
    /// topic in the current namespace and version.
    pub fn parse(topic: &str) -> Option<Self> {
        let mut parts = topic.strip_prefix('/')?.split('/');
        if parts.next()? != TOPIC_NAMESPACE || parts.next()? != TOPIC_VERSION {
            return None;
        }
        let pair = parts.next()?.strip_prefix(DM_SEGMENT_PREFIX)?;
        if parts.next()? != TOPIC_ENCODING || parts.next().is_some() {
            return None;
        }

        let (low, high) = pair.split_once('-')?;
        let parsed = Self::between(low, high).ok()?;
        // Only the canonical spelling round-trips.
        (parsed.low == low && parsed.high == high).then_some(parsed)
    }

    /// The other participant, given one side's address (any case).
    pub fn counterpart_of(&self, address: &str) -> Option<&str> {
        let address = address.trim().to_ascii_lowercase();
        if address == self.low {
            Some(&self.high)
        } else if address == self.high {
            Some(&self.low)
        } else {
            None
        }
    }

    pub fn to_topic(&self) -> String {
        format!(
            "/{TOPIC_NAMESPACE}/{TOPIC_VERSION}/{DM_SEGMENT_PREFIX}{}-{}/{TOPIC_ENCODING}",
            self.low, self.high
        )
    }
}

impl fmt::Display for DmTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_topic())
    }
}

/// Derive the canonical topic name for a conversation between two addresses.
pub fn derive_topic(address_a: &str, address_b: &str) -> Result<String, TopicError> {
    DmTopic::between(address_a, address_b).map(|topic| topic.to_topic())
}

/// Lower-case an address and check it is plausible.
///
/// Accepted: 1 to [`MAX_ADDRESS_LEN`] ASCII alphanumerics after trimming. That
/// covers `0x…` hex accounts and base58 accounts while keeping `-` and `/` out
/// of topic names.
pub fn normalize_address(address: &str) -> Result<String, TopicError> {
    let trimmed = address.trim();
    let invalid = |reason| TopicError::InvalidAddress {
        address: address.to_string(),
        reason,
    };

    if trimmed.is_empty() {
        return Err(invalid("address is empty"));
    }
    if trimmed.len() > MAX_ADDRESS_LEN {
        return Err(invalid("address is too long"));
    }
    if !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(invalid("address must be ASCII alphanumeric"));
    }

    Ok(trimmed.to_ascii_lowercase())
}
