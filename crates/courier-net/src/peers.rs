//! What the swarm knows about each connected peer.
//!
//! Connection and Identify events arrive in either order; a peer counts as
//! capable once its advertised protocols cover what the session needs.

use std::collections::HashMap;

use libp2p::{Multiaddr, PeerId};
use tracing::trace;

use courier_shared::protocol::now_millis;

use crate::node::PeerCapability;

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub peer_id: PeerId,
    /// `None` until the connection itself has been seen.
    pub address: Option<Multiaddr>,
    /// From the peer's latest Identify. Empty until identified.
    pub protocols: Vec<String>,
    /// Unix epoch millis of first sighting.
    pub first_seen: u64,
}

impl ConnectionInfo {
    fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            address: None,
            protocols: Vec::new(),
            first_seen: now_millis(),
        }
    }

    pub fn offers_all(&self, capabilities: &[PeerCapability]) -> bool {
        capabilities.iter().all(|cap| cap.is_met_by(&self.protocols))
    }
}

#[derive(Debug, Clone, Default)]
pub struct PeerTracker {
    peers: HashMap<PeerId, ConnectionInfo>,
}

impl PeerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, peer_id: PeerId) -> &mut ConnectionInfo {
        self.peers
            .entry(peer_id)
            .or_insert_with(|| ConnectionInfo::new(peer_id))
    }

    pub fn on_connected(&mut self, peer_id: PeerId, address: Multiaddr) {
        trace!(peer = %peer_id, addr = %address, "tracking connection");
        self.record(peer_id).address = Some(address);
    }

    pub fn on_identified(&mut self, peer_id: PeerId, protocols: Vec<String>) {
        self.record(peer_id).protocols = protocols;
    }

    /// Forget a peer whose last connection closed.
    pub fn on_disconnected(&mut self, peer_id: &PeerId) {
        self.peers.remove(peer_id);
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&ConnectionInfo> {
        self.peers.get(peer_id)
    }

    /// Peers offering every capability in `capabilities`.
    pub fn capable_peers(&self, capabilities: &[PeerCapability]) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|info| info.offers_all(capabilities))
            .map(|info| info.peer_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOTH: [PeerCapability; 2] = [PeerCapability::Publish, PeerCapability::Subscribe];

    fn addr() -> Multiaddr {
        "/ip4/127.0.0.1/udp/4001/quic-v1".parse().unwrap()
    }

    #[test]
    fn test_disconnect_forgets_peer() {
        let mut tracker = PeerTracker::new();
        let peer = PeerId::random();

        tracker.on_connected(peer, addr());
        assert_eq!(tracker.len(), 1);

        tracker.on_disconnected(&peer);
        assert!(tracker.is_empty());
        assert!(tracker.get(&peer).is_none());
    }

    #[test]
    fn test_capable_only_after_identify() {
        let mut tracker = PeerTracker::new();
        let peer = PeerId::random();

        tracker.on_connected(peer, addr());
        assert!(tracker.capable_peers(&BOTH).is_empty());

        tracker.on_identified(peer, vec!["/ipfs/id/1.0.0".into(), "/meshsub/1.1.0".into()]);
        assert_eq!(tracker.capable_peers(&BOTH), vec![peer]);
    }

    #[test]
    fn test_identify_first_then_connection() {
        let mut tracker = PeerTracker::new();
        let peer = PeerId::random();

        tracker.on_identified(peer, vec!["/meshsub/1.0.0".into()]);
        assert_eq!(tracker.get(&peer).unwrap().address, None);

        tracker.on_connected(peer, addr());
        let info = tracker.get(&peer).unwrap();
        assert_eq!(info.address, Some(addr()));
        assert!(info.offers_all(&BOTH));
    }

    #[test]
    fn test_kad_only_peer_is_not_capable() {
        let mut tracker = PeerTracker::new();
        let kad_only = PeerId::random();
        let gossip = PeerId::random();

        tracker.on_identified(kad_only, vec!["/ipfs/kad/1.0.0".into()]);
        tracker.on_identified(gossip, vec!["/meshsub/1.1.0".into()]);

        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.capable_peers(&BOTH), vec![gossip]);
    }
}
