//! Swarm construction: QUIC transport plus the Courier behaviour.

use std::time::Duration;

use libp2p::gossipsub::{self, MessageAuthenticity, MessageId, ValidationMode};
use libp2p::identity::Keypair;
use libp2p::kad::{self, store::MemoryStore};
use libp2p::{identify, Swarm, SwarmBuilder};
use tracing::info;

use courier_shared::constants::{
    APP_NAME, GOSSIPSUB_HEARTBEAT_SECS, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};

use crate::behaviour::CourierBehaviour;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);
const IDENTIFY_INTERVAL: Duration = Duration::from_secs(60);

pub fn build_swarm(keypair: Keypair) -> anyhow::Result<Swarm<CourierBehaviour>> {
    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_quic()
        .with_behaviour(|key| -> Result<CourierBehaviour, BoxError> {
            Ok(CourierBehaviour {
                gossipsub: gossipsub_behaviour(key)?,
                kademlia: kademlia_behaviour(key),
                identify: identify_behaviour(key),
            })
        })?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
        .build();

    info!(peer_id = %swarm.local_peer_id(), "Built QUIC swarm");
    Ok(swarm)
}

/// Same author and payload give the same gossip id, so a re-broadcast of an
/// identical frame is suppressed by the mesh itself.
fn gossip_message_id(message: &gossipsub::Message) -> MessageId {
    let mut hasher = blake3::Hasher::new();
    if let Some(source) = &message.source {
        hasher.update(&source.to_bytes());
    }
    hasher.update(&message.data);
    MessageId::from(hasher.finalize().to_hex().to_string())
}

fn gossipsub_behaviour(key: &Keypair) -> Result<gossipsub::Behaviour, BoxError> {
    let config = gossipsub::ConfigBuilder::default()
        .heartbeat_interval(Duration::from_secs(GOSSIPSUB_HEARTBEAT_SECS))
        .validation_mode(ValidationMode::Strict)
        .max_transmit_size(MAX_MESSAGE_SIZE)
        .message_id_fn(gossip_message_id)
        .build()
        .map_err(|e| format!("gossipsub config: {e}"))?;

    let behaviour = gossipsub::Behaviour::new(MessageAuthenticity::Signed(key.clone()), config)
        .map_err(|e| format!("gossipsub init: {e}"))?;
    Ok(behaviour)
}

fn kademlia_behaviour(key: &Keypair) -> kad::Behaviour<MemoryStore> {
    let peer_id = key.public().to_peer_id();
    let mut kademlia = kad::Behaviour::new(peer_id, MemoryStore::new(peer_id));
    // Clients only route; they never serve DHT records.
    kademlia.set_mode(Some(kad::Mode::Client));
    kademlia
}

fn identify_behaviour(key: &Keypair) -> identify::Behaviour {
    let agent = format!("{}/{}", APP_NAME.to_lowercase(), env!("CARGO_PKG_VERSION"));
    identify::Behaviour::new(
        identify::Config::new(PROTOCOL_VERSION.to_string(), key.public())
            .with_agent_version(agent)
            .with_push_listen_addr_updates(true)
            .with_interval(IDENTIFY_INTERVAL),
    )
}
