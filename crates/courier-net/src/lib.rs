// P2P networking layer: a libp2p node over QUIC and the session that owns it.

pub mod behaviour;
pub mod discovery;
pub mod error;
pub mod node;
pub mod peers;
pub mod session;
pub mod swarm;
pub mod swarm_node;
pub mod transport;

pub use behaviour::{CourierBehaviour, CourierEvent};
pub use discovery::{load_bootstrap_peers, parse_multiaddrs};
pub use error::NetError;
pub use node::{Node, NodeFactory, NodeOptions, OnMessage, PeerCapability, SubscriptionId};
pub use peers::{ConnectionInfo, PeerTracker};
pub use session::{ReadinessHandle, SessionManager, SessionState, SubscriptionHandle};
pub use swarm::{spawn_swarm, SwarmCommand, SwarmConfig, SwarmHandle, SwarmNotification};
pub use swarm_node::{keypair_from_seed, SwarmNode, SwarmNodeFactory};
pub use transport::build_swarm;
