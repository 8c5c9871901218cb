use libp2p::kad::{self, store::MemoryStore};
use libp2p::{gossipsub, identify, swarm::NetworkBehaviour};

/// GossipSub carries direct messages, Kademlia finds peers, and Identify
/// tells us which protocols each peer speaks. Built by
/// [`crate::transport::build_swarm`].
#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "CourierEvent")]
pub struct CourierBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub kademlia: kad::Behaviour<MemoryStore>,
    pub identify: identify::Behaviour,
}

#[derive(Debug)]
pub enum CourierEvent {
    Gossipsub(gossipsub::Event),
    Kademlia(kad::Event),
    Identify(identify::Event),
}

macro_rules! wrap_event {
    ($($variant:ident => $event:ty),* $(,)?) => {
        $(
            impl From<$event> for CourierEvent {
                fn from(event: $event) -> Self {
                    CourierEvent::$variant(event)
                }
            }
        )*
    };
}

wrap_event! {
    Gossipsub => gossipsub::Event,
    Kademlia => kad::Event,
    Identify => identify::Event,
}
