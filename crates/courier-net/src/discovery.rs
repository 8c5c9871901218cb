//! Bootstrap peer lists.
//!
//! A bootstrap file holds one multiaddr per line. `#` starts a comment,
//! either on its own line or after an address:
//!
//! ```text
//! # Courier bootstrap nodes
//! /ip4/51.158.191.43/udp/4001/quic-v1/p2p/12D3KooW...   # eu-west
//! ```

use std::collections::HashSet;
use std::path::Path;

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use tracing::{info, warn};

/// Read bootstrap addresses from `path`.
///
/// An unreadable file yields no peers. Bad lines are logged with their line
/// number and skipped. Repeated addresses are kept once.
pub fn load_bootstrap_peers(path: &Path) -> Vec<Multiaddr> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Bootstrap file unreadable");
            return Vec::new();
        }
    };

    let mut seen = HashSet::new();
    let mut addrs = Vec::new();
    for (n, line) in content.lines().enumerate() {
        let entry = strip_comment(line);
        if entry.is_empty() {
            continue;
        }
        match entry.parse::<Multiaddr>() {
            Ok(addr) if seen.insert(addr.clone()) => addrs.push(addr),
            Ok(_) => {}
            Err(e) => warn!(path = %path.display(), line = n + 1, error = %e, "Bad bootstrap entry"),
        }
    }

    info!(path = %path.display(), count = addrs.len(), "Loaded bootstrap peers");
    addrs
}

/// Parse configured multiaddr strings, dropping blanks and the unparseable.
pub fn parse_multiaddrs<S: AsRef<str>>(raw: &[S]) -> Vec<Multiaddr> {
    let mut addrs = Vec::with_capacity(raw.len());
    for entry in raw.iter().map(|s| s.as_ref().trim()).filter(|s| !s.is_empty()) {
        match entry.parse::<Multiaddr>() {
            Ok(addr) => addrs.push(addr),
            Err(e) => warn!(addr = %entry, error = %e, "Skipping invalid multiaddr"),
        }
    }
    addrs
}

/// The `/p2p/<peer id>` component of `addr`, if any.
pub fn extract_peer_id(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| match p {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}

fn strip_comment(line: &str) -> &str {
    line.split_once('#').map_or(line, |(before, _)| before).trim()
}
