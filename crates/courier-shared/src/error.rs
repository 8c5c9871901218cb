use thiserror::Error;

/// Rejected input to topic derivation. Never worth retrying: the caller has
/// to fix the address.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("Invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: &'static str },
}

/// An inbound frame that could not be turned into a [`crate::protocol::Message`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Empty payload")]
    Empty,

    #[error("Payload too large: {size} bytes (max {max})")]
    Oversized { size: usize, max: usize },

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Missing required field `{0}`")]
    MissingField(&'static str),
}

impl From<prost::DecodeError> for DecodeError {
    fn from(err: prost::DecodeError) -> Self {
        DecodeError::Malformed(err.to_string())
    }
}
