//! Types shared by every Courier crate: identities, the direct-message topic
//! scheme and the binary message codec.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod topic;
pub mod types;

pub use error::{DecodeError, TopicError};
pub use protocol::{decode, encode, EncodedMessage, Message, MessageDraft};
pub use topic::{derive_topic, normalize_address, DmTopic};
pub use types::LocalIdentity;
