//! The network capability the session manager drives.
//!
//! A [`NodeFactory`] creates nodes; a [`Node`] is started, waits for useful
//! peers, publishes and subscribes on topics, and is stopped. The libp2p
//! implementation lives in [`crate::swarm_node`]; tests substitute their own.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use libp2p::Multiaddr;

use courier_shared::constants::{DEFAULT_BOOTSTRAP_TIMEOUT_SECS, DEFAULT_QUIC_PORT};

use crate::error::NetError;

/// Callback receiving one raw frame delivered on a subscribed topic.
pub type OnMessage = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// What a peer must be able to do for us before the session counts as ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerCapability {
    /// Accepts messages we publish.
    Publish,
    /// Forwards messages on topics we subscribe to.
    Subscribe,
}

impl PeerCapability {
    /// Protocol id prefix a peer must advertise via Identify.
    ///
    /// GossipSub carries both directions over the same protocol family.
    pub fn protocol_prefix(self) -> &'static str {
        match self {
            PeerCapability::Publish | PeerCapability::Subscribe => "/meshsub/",
        }
    }

    /// Whether any of `protocols` satisfies this capability.
    pub fn is_met_by<S: AsRef<str>>(self, protocols: &[S]) -> bool {
        let prefix = self.protocol_prefix();
        protocols.iter().any(|p| p.as_ref().starts_with(prefix))
    }
}

/// Identifies one handler registered on a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Options used to create and bootstrap a node.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// UDP port for QUIC. `0` picks a free port.
    pub listen_port: u16,
    /// File of bootstrap multiaddrs, one per line.
    pub bootstrap_peers_path: Option<PathBuf>,
    /// Bootstrap multiaddrs given directly.
    pub bootstrap_peers: Vec<Multiaddr>,
    /// Seed for a stable node identity. A random identity is used when absent.
    pub key_seed: Option<String>,
    /// Capabilities at least one connected peer must offer.
    pub required_capabilities: Vec<PeerCapability>,
    /// Upper bound on create + start + peer wait.
    pub bootstrap_timeout: Duration,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_QUIC_PORT,
            bootstrap_peers_path: None,
            bootstrap_peers: Vec::new(),
            key_seed: None,
            required_capabilities: vec![PeerCapability::Publish, PeerCapability::Subscribe],
            bootstrap_timeout: Duration::from_secs(DEFAULT_BOOTSTRAP_TIMEOUT_SECS),
        }
    }
}

/// Creates network nodes.
#[async_trait]
pub trait NodeFactory: Send + Sync {
    async fn create_node(&self, options: &NodeOptions) -> Result<Arc<dyn Node>, NetError>;
}

/// A single network client instance.
#[async_trait]
pub trait Node: Send + Sync {
    /// Begin listening and dialing bootstrap peers.
    async fn start(&self) -> Result<(), NetError>;

    /// Resolve once a connected peer offers every capability in `capabilities`.
    /// Callers bound this with a timeout.
    async fn wait_for_peers(&self, capabilities: &[PeerCapability]) -> Result<(), NetError>;

    /// Release all resources. Stopping a node that never started is a no-op.
    async fn stop(&self) -> Result<(), NetError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), NetError>;

    /// Register `on_message` for frames on `topic`.
    async fn subscribe(&self, topic: &str, on_message: OnMessage)
        -> Result<SubscriptionId, NetError>;

    async fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> Result<(), NetError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_matches_gossipsub_protocols() {
        let protocols = ["/ipfs/id/1.0.0", "/meshsub/1.1.0"];
        assert!(PeerCapability::Publish.is_met_by(&protocols));
        assert!(PeerCapability::Subscribe.is_met_by(&protocols));
        assert!(!PeerCapability::Publish.is_met_by(&["/ipfs/kad/1.0.0"]));
    }

    #[test]
    fn test_default_options_require_both_capabilities() {
        let options = NodeOptions::default();
        assert_eq!(options.bootstrap_timeout, Duration::from_secs(30));
        assert_eq!(options.required_capabilities.len(), 2);
    }
}
