//! Node configuration loaded from environment variables.
//!
//! Everything except the wallet address has a default so a node can start
//! with one variable set.

use std::path::PathBuf;
use std::time::Duration;

use libp2p::Multiaddr;

use courier_net::{parse_multiaddrs, NodeOptions};
use courier_shared::constants::{DEFAULT_BOOTSTRAP_TIMEOUT_SECS, DEFAULT_QUIC_PORT};
use courier_shared::{normalize_address, LocalIdentity, TopicError};

/// Node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Account id written to the message log.
    /// Env: `COURIER_USER_ID`
    /// Default: the normalized address.
    pub user_id: Option<String>,

    /// Wallet address naming our channels.
    /// Env: `COURIER_ADDRESS`
    /// Required.
    pub address: Option<String>,

    /// Env: `COURIER_DISPLAY_NAME`
    pub display_name: Option<String>,

    /// SQLite file for the message log.
    /// Env: `COURIER_DB_PATH`
    /// Default: the platform data directory.
    pub db_path: Option<PathBuf>,

    /// UDP port for QUIC.
    /// Env: `COURIER_LISTEN_PORT`
    /// Default: `4001`
    pub listen_port: u16,

    /// File of bootstrap multiaddrs, one per line.
    /// Env: `COURIER_BOOTSTRAP_FILE`
    pub bootstrap_file: Option<PathBuf>,

    /// Env: `COURIER_BOOTSTRAP_PEERS` (comma-separated multiaddrs)
    pub bootstrap_peers: Vec<Multiaddr>,

    /// Upper bound on reaching a usable peer.
    /// Env: `COURIER_BOOTSTRAP_TIMEOUT_SECS`
    /// Default: `30`
    pub bootstrap_timeout: Duration,

    /// Seed for a stable libp2p identity.
    /// Env: `COURIER_KEY_SEED`
    /// Default: a fresh identity each run.
    pub key_seed: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            user_id: None,
            address: None,
            display_name: None,
            db_path: None,
            listen_port: DEFAULT_QUIC_PORT,
            bootstrap_file: None,
            bootstrap_peers: Vec::new(),
            bootstrap_timeout: Duration::from_secs(DEFAULT_BOOTSTRAP_TIMEOUT_SECS),
            key_seed: None,
        }
    }
}

impl NodeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`NodeConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        config.user_id = var("COURIER_USER_ID");
        config.address = var("COURIER_ADDRESS");
        config.display_name = var("COURIER_DISPLAY_NAME");
        config.db_path = var("COURIER_DB_PATH").map(PathBuf::from);
        config.bootstrap_file = var("COURIER_BOOTSTRAP_FILE").map(PathBuf::from);
        config.key_seed = var("COURIER_KEY_SEED");

        if let Some(val) = var("COURIER_LISTEN_PORT") {
            match val.parse::<u16>() {
                Ok(port) => config.listen_port = port,
                Err(_) => tracing::warn!(value = %val, "Invalid COURIER_LISTEN_PORT, using default"),
            }
        }

        if let Some(val) = var("COURIER_BOOTSTRAP_PEERS") {
            let entries: Vec<&str> = val.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
            config.bootstrap_peers = parse_multiaddrs(&entries);
            if config.bootstrap_peers.len() < entries.len() {
                tracing::warn!(
                    given = entries.len(),
                    valid = config.bootstrap_peers.len(),
                    "Some COURIER_BOOTSTRAP_PEERS entries were not valid multiaddrs"
                );
            }
        }

        if let Some(val) = var("COURIER_BOOTSTRAP_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.bootstrap_timeout = Duration::from_secs(secs),
                _ => tracing::warn!(
                    value = %val,
                    "Invalid COURIER_BOOTSTRAP_TIMEOUT_SECS, using default"
                ),
            }
        }

        config
    }

    /// The identity to send and receive as. `None` when no address is set.
    pub fn identity(&self) -> Option<Result<LocalIdentity, TopicError>> {
        let address = self.address.as_deref()?;
        let user_id = match &self.user_id {
            Some(user_id) => user_id.clone(),
            None => match normalize_address(address) {
                Ok(normalized) => normalized,
                Err(e) => return Some(Err(e)),
            },
        };
        Some(LocalIdentity::new(user_id, address, self.display_name.clone()))
    }

    pub fn node_options(&self) -> NodeOptions {
        NodeOptions {
            listen_port: self.listen_port,
            bootstrap_peers_path: self.bootstrap_file.clone(),
            bootstrap_peers: self.bootstrap_peers.clone(),
            key_seed: self.key_seed.clone(),
            bootstrap_timeout: self.bootstrap_timeout,
            ..NodeOptions::default()
        }
    }
}
