use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the network layer.
///
/// `NotReady` asks the caller to wait or queue. `BootstrapTimeout`, `Node`
/// and `Publish` are transient and may be retried by the caller with backoff.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    #[error("Network session is not ready")]
    NotReady,

    #[error("Network session stopped")]
    Stopped,

    #[error("Timed out after {0:?} waiting for peers")]
    BootstrapTimeout(Duration),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Node error: {0}")]
    Node(String),

    #[error("Swarm command channel closed")]
    ChannelClosed,
}
